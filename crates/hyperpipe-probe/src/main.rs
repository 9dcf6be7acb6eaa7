//! hyperpipe-probe: request a URL once per local source address and report
//! which address the far end saw.

mod ip_list;
mod report;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Context as _;
use hyperpipe::{
    CancellationToken, HttpTransport, HttpTransportConfig, Pipeline, PipelineConfig, RunSummary,
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::ip_list::{DEFAULT_LIMIT, DEFAULT_TARGET_URL, IpListProvider, ProbeTarget};
use crate::report::ReportingHandler;

const DEFAULT_HOST: &str = "VPS1";

#[derive(Debug, Clone, PartialEq)]
struct Options {
    dir: PathBuf,
    host: Option<String>,
    url: String,
    concurrency: Option<usize>,
    limit: usize,
    timeout: Duration,
    ca_bundle: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("."),
            host: None,
            url: DEFAULT_TARGET_URL.to_string(),
            concurrency: None,
            limit: DEFAULT_LIMIT,
            timeout: ip_list::DEFAULT_TIMEOUT,
            ca_bundle: None,
        }
    }
}

impl Options {
    /// `--host`, then `HYPERPIPE_HOST`, then the built-in default.
    fn host(&self) -> String {
        self.host
            .clone()
            .or_else(|| std::env::var("HYPERPIPE_HOST").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let options = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            if !msg.is_empty() {
                eprintln!("error: {msg}");
                eprintln!();
            }
            eprintln!(
                "Usage: hyperpipe-probe [--dir <dir>] [--host <name>] [--url <url>] [--concurrency <n>]"
            );
            eprintln!("                       [--limit <n>] [--timeout-ms <ms>] [--ca-bundle <file>]");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --dir <dir>          Directory holding IPv6-<host>-<cc>.txt [default: .]");
            eprintln!(
                "  --host <name>        Host name in the list file name [default: $HYPERPIPE_HOST or {DEFAULT_HOST}]"
            );
            eprintln!("  --url <url>          URL to request [default: {DEFAULT_TARGET_URL}]");
            eprintln!(
                "  --concurrency <n>    Parallel transfers [default: $HYPERPIPE_CONCURRENCY or 8]"
            );
            eprintln!("  --limit <n>          Maximum addresses to probe [default: {DEFAULT_LIMIT}]");
            eprintln!("  --timeout-ms <ms>    Per-request timeout [default: 30000]");
            eprintln!("  --ca-bundle <file>   PEM bundle replacing the system trust roots");
            process::exit(2);
        }
    };

    init_tracing();

    if let Err(e) = run(options) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut options = Options::default();

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| format!("{flag} requires a value"))
        };
        match flag {
            "--dir" => options.dir = PathBuf::from(value()?),
            "--host" => options.host = Some(value()?),
            "--url" => options.url = value()?,
            "--concurrency" => {
                let n = value()?;
                options.concurrency = Some(
                    n.parse()
                        .map_err(|_| format!("invalid --concurrency '{n}'"))?,
                );
            }
            "--limit" => {
                let n = value()?;
                options.limit = n.parse().map_err(|_| format!("invalid --limit '{n}'"))?;
            }
            "--timeout-ms" => {
                let ms = value()?;
                let ms: u64 = ms
                    .parse()
                    .map_err(|_| format!("invalid --timeout-ms '{ms}'"))?;
                options.timeout = Duration::from_millis(ms);
            }
            "--ca-bundle" => options.ca_bundle = Some(PathBuf::from(value()?)),
            "--help" | "-h" => return Err(String::new()),
            arg => return Err(format!("unexpected argument: {arg}")),
        }
        i += 1;
    }

    Ok(options)
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("HYPERPIPE_LOG").as_deref() {
            Ok("trace") => "trace",
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("hyperpipe={level},hyperpipe_probe={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn run(options: Options) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;
    runtime.block_on(probe(options))
}

async fn probe(options: Options) -> anyhow::Result<()> {
    let started = chrono::Local::now();
    println!("Start: {}", started.format("%Y-%m-%d %H:%M:%S%.3f"));

    let config = match options.concurrency {
        Some(n) => PipelineConfig::default().with_concurrency(n),
        None => PipelineConfig::default(),
    };
    let slots = config.concurrency;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling outstanding probes");
            on_signal.cancel();
        }
    });

    let (summary, reachable) = probe_with(&options, config, cancel).await?;

    let elapsed = (chrono::Local::now() - started).num_milliseconds() as f64 / 1000.0;
    println!(
        "Took {:.3} secs using {} slots = {:.3} secs per slot",
        elapsed,
        slots,
        elapsed / slots as f64
    );
    tracing::info!(
        reachable,
        summary = %serde_json::to_string(&summary)?,
        "Probe finished"
    );
    Ok(())
}

/// Drive one probe run. Returns the driver summary and the number of
/// addresses that got a 200 response.
async fn probe_with(
    options: &Options,
    config: PipelineConfig,
    cancel: CancellationToken,
) -> anyhow::Result<(RunSummary, usize)> {
    let host = options.host();
    let target = ProbeTarget {
        url: options.url.clone(),
        timeout: options.timeout,
        ca_bundle: options.ca_bundle.clone(),
    };
    tracing::info!(dir = %options.dir.display(), %host, url = %target.url, "Starting probe");

    let transport = HttpTransport::new(HttpTransportConfig::default())
        .context("failed to initialize HTTP transport")?;
    let provider = IpListProvider::new(&options.dir, host, target).with_limit(options.limit);
    let mut pipeline = Pipeline::with_config(config, transport, provider, ReportingHandler::new(true))
        .context("failed to build pipeline")?;

    let summary = pipeline.run_until_cancelled(cancel).await;
    let reachable = pipeline.handler().reachable();
    Ok((summary, reachable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("hyperpipe-probe")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn defaults_without_flags() {
        assert_eq!(parse_args(&args(&[])).unwrap(), Options::default());
    }

    #[test]
    fn parses_every_flag() {
        let options = parse_args(&args(&[
            "--dir",
            "/srv/lists",
            "--host",
            "VPS7",
            "--url",
            "https://example.test/ip",
            "--concurrency",
            "16",
            "--limit",
            "5",
            "--timeout-ms",
            "2500",
            "--ca-bundle",
            "/etc/ssl/ca.pem",
        ]))
        .unwrap();

        assert_eq!(
            options,
            Options {
                dir: PathBuf::from("/srv/lists"),
                host: Some("VPS7".to_string()),
                url: "https://example.test/ip".to_string(),
                concurrency: Some(16),
                limit: 5,
                timeout: Duration::from_millis(2500),
                ca_bundle: Some(PathBuf::from("/etc/ssl/ca.pem")),
            }
        );
        assert_eq!(options.host(), "VPS7");
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(
            parse_args(&args(&["--limit"])).unwrap_err(),
            "--limit requires a value"
        );
        assert_eq!(
            parse_args(&args(&["--concurrency", "many"])).unwrap_err(),
            "invalid --concurrency 'many'"
        );
        assert_eq!(
            parse_args(&args(&["extra"])).unwrap_err(),
            "unexpected argument: extra"
        );
        assert_eq!(parse_args(&args(&["--help"])).unwrap_err(), "");
    }

    #[tokio::test]
    async fn probes_each_listed_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("127.0.0.1\n"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("IPv6-TEST-zz.txt"),
            "127.0.0.1\n127.0.0.1\nbogus\n",
        )
        .unwrap();

        let options = Options {
            dir: dir.path().to_path_buf(),
            host: Some("TEST".to_string()),
            url: format!("{}/", server.uri()),
            timeout: Duration::from_secs(5),
            ..Options::default()
        };
        let (summary, reachable) =
            probe_with(&options, PipelineConfig::new(4), CancellationToken::new())
                .await
                .unwrap();

        assert_eq!(summary.transfers, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.retired_unused, 3);
        assert_eq!(reachable, 1);
    }

    #[tokio::test]
    async fn missing_list_probes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let options = Options {
            dir: dir.path().to_path_buf(),
            host: Some("NOWHERE".to_string()),
            ..Options::default()
        };

        let (summary, reachable) =
            probe_with(&options, PipelineConfig::new(2), CancellationToken::new())
                .await
                .unwrap();

        assert_eq!(summary.transfers, 0);
        assert_eq!(summary.retired_unused, 2);
        assert_eq!(reachable, 0);
    }
}
