//! HTTP transport backed by reqwest.
//!
//! Per-request options (target, timeout, headers, capture flags) are applied to
//! each request. Client-level options (redirect policy, trust bundle, outbound
//! binding) need a dedicated client; a handle caches the last one it built and
//! reuses it while those options stay the same.

use std::borrow::Cow;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;

use super::{TransferHandle, TransferStatus, Transport, TransportError};
use crate::version::user_agent;

/// Redirect limit when following is enabled.
const MAX_REDIRECTS: usize = 10;

/// Outbound network binding for a transfer.
///
/// Parsed from the `if!<name>` / `host!<addr>` convention; a bare value is an
/// address when it parses as one and an interface name otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NetworkBinding {
    Interface(String),
    Address(IpAddr),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindingParseError {
    #[error("empty network binding")]
    Empty,
    #[error("invalid source address: {0}")]
    InvalidAddress(String),
    #[error("invalid interface name: {0}")]
    InvalidInterface(String),
}

/// Longest interface name the kernel accepts (IFNAMSIZ minus the NUL).
const MAX_INTERFACE_NAME: usize = 15;

impl FromStr for NetworkBinding {
    type Err = BindingParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(BindingParseError::Empty);
        }

        if let Some(name) = s.strip_prefix("if!") {
            return interface_name(name).map(Self::Interface);
        }
        if let Some(addr) = s.strip_prefix("host!") {
            return parse_address(addr)
                .map(Self::Address)
                .ok_or_else(|| BindingParseError::InvalidAddress(addr.to_string()));
        }

        match parse_address(s) {
            Some(addr) => Ok(Self::Address(addr)),
            None => interface_name(s).map(Self::Interface),
        }
    }
}

impl std::fmt::Display for NetworkBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interface(name) => write!(f, "if!{}", name),
            Self::Address(addr) => write!(f, "host!{}", addr),
        }
    }
}

fn parse_address(s: &str) -> Option<IpAddr> {
    let s = s.trim();
    let s = s
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(s);
    s.parse().ok()
}

fn interface_name(name: &str) -> Result<String, BindingParseError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INTERFACE_NAME
        && !name.contains(|c: char| c.is_whitespace() || c == '!' || c == '/');
    if valid {
        Ok(name.to_string())
    } else {
        Err(BindingParseError::InvalidInterface(name.to_string()))
    }
}

/// Options for one transfer. Consumed as-is by [`HttpHandle::perform`].
#[derive(Debug, Clone, Default)]
pub struct TransferOptions {
    pub url: Option<String>,
    pub follow_redirects: bool,
    pub timeout: Option<Duration>,
    pub capture_headers: bool,
    pub capture_body: bool,
    /// PEM bundle replacing the built-in trust roots.
    pub ca_bundle: Option<PathBuf>,
    pub binding: Option<NetworkBinding>,
    pub headers: Vec<(String, String)>,
}

impl TransferOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_follow_redirects(mut self, follow: bool) -> Self {
        self.follow_redirects = follow;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_ms(self, ms: u64) -> Self {
        self.with_timeout(Duration::from_millis(ms))
    }

    pub fn with_capture_headers(mut self, capture: bool) -> Self {
        self.capture_headers = capture;
        self
    }

    pub fn with_capture_body(mut self, capture: bool) -> Self {
        self.capture_body = capture;
        self
    }

    pub fn with_ca_bundle(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_bundle = Some(path.into());
        self
    }

    pub fn with_binding(mut self, binding: NetworkBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// What a completed transfer left behind for inspection.
#[derive(Debug, Clone, Default)]
pub struct TransferInfo {
    pub response_code: Option<u16>,
    pub effective_url: Option<String>,
    /// Empty unless header capture was requested.
    pub headers: HeaderMap,
    /// Empty unless body capture was requested.
    pub body: Bytes,
}

impl TransferInfo {
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub user_agent: String,
    pub connect_timeout: Option<Duration>,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            user_agent: user_agent(),
            connect_timeout: None,
        }
    }
}

impl HttpTransportConfig {
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

/// Client-level settings; transfers sharing a key can share a client.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientKey {
    follow_redirects: bool,
    ca_bundle: Option<PathBuf>,
    binding: Option<NetworkBinding>,
}

impl ClientKey {
    fn from_options(options: &TransferOptions) -> Self {
        Self {
            follow_redirects: options.follow_redirects,
            ca_bundle: options.ca_bundle.clone(),
            binding: options.binding.clone(),
        }
    }

    fn is_shared(&self) -> bool {
        self.ca_bundle.is_none() && self.binding.is_none()
    }
}

fn client_builder(config: &HttpTransportConfig, follow_redirects: bool) -> reqwest::ClientBuilder {
    let policy = if follow_redirects {
        reqwest::redirect::Policy::limited(MAX_REDIRECTS)
    } else {
        reqwest::redirect::Policy::none()
    };

    let mut builder = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .redirect(policy);
    if let Some(timeout) = config.connect_timeout {
        builder = builder.connect_timeout(timeout);
    }
    builder
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_interface(
    builder: reqwest::ClientBuilder,
    name: &str,
) -> Result<reqwest::ClientBuilder, TransferStatus> {
    Ok(builder.interface(name))
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_interface(
    _builder: reqwest::ClientBuilder,
    name: &str,
) -> Result<reqwest::ClientBuilder, TransferStatus> {
    Err(TransferStatus::InvalidOptions(format!(
        "binding to interface {} is not supported on this platform",
        name
    )))
}

async fn build_dedicated_client(
    config: &HttpTransportConfig,
    key: &ClientKey,
) -> Result<reqwest::Client, TransferStatus> {
    let mut builder = client_builder(config, key.follow_redirects);

    if let Some(ref path) = key.ca_bundle {
        let pem = tokio::fs::read(path).await.map_err(|e| {
            TransferStatus::InvalidOptions(format!(
                "failed to read trust bundle {}: {}",
                path.display(),
                e
            ))
        })?;
        let certs = reqwest::Certificate::from_pem_bundle(&pem).map_err(|e| {
            TransferStatus::InvalidOptions(format!(
                "invalid trust bundle {}: {}",
                path.display(),
                e
            ))
        })?;
        builder = builder.tls_built_in_root_certs(false);
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }

    match key.binding {
        Some(NetworkBinding::Address(addr)) => builder = builder.local_address(addr),
        Some(NetworkBinding::Interface(ref name)) => builder = bind_interface(builder, name)?,
        None => {}
    }

    builder
        .build()
        .map_err(|e| TransferStatus::InvalidOptions(error_chain(&e)))
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

fn classify_error(err: &reqwest::Error) -> TransferStatus {
    if err.is_timeout() {
        TransferStatus::TimedOut
    } else if err.is_redirect() {
        TransferStatus::TooManyRedirects
    } else if err.is_connect() {
        TransferStatus::ConnectFailed(error_chain(err))
    } else if err.is_builder() {
        TransferStatus::InvalidOptions(error_chain(err))
    } else {
        TransferStatus::Failed(error_chain(err))
    }
}

/// HTTP transport: owns the shared clients every handle starts from.
pub struct HttpTransport {
    config: HttpTransportConfig,
    direct: reqwest::Client,
    following: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let direct = client_builder(&config, false)
            .build()
            .map_err(|e| TransportError::Init(error_chain(&e)))?;
        let following = client_builder(&config, true)
            .build()
            .map_err(|e| TransportError::Init(error_chain(&e)))?;

        tracing::debug!(user_agent = %config.user_agent, "HTTP transport initialized");
        Ok(Self {
            config,
            direct,
            following,
        })
    }
}

impl Transport for HttpTransport {
    type Handle = HttpHandle;

    fn create_handle(&self) -> Result<HttpHandle, TransportError> {
        Ok(HttpHandle {
            config: self.config.clone(),
            direct: self.direct.clone(),
            following: self.following.clone(),
            options: TransferOptions::default(),
            dedicated: None,
            info: TransferInfo::default(),
        })
    }
}

/// Reusable HTTP transfer handle.
pub struct HttpHandle {
    config: HttpTransportConfig,
    direct: reqwest::Client,
    following: reqwest::Client,
    options: TransferOptions,
    dedicated: Option<(ClientKey, reqwest::Client)>,
    info: TransferInfo,
}

impl HttpHandle {
    /// Replace the options for the next transfer.
    pub fn configure(&mut self, options: TransferOptions) {
        self.options = options;
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut TransferOptions {
        &mut self.options
    }

    /// Results of the last transfer.
    pub fn info(&self) -> &TransferInfo {
        &self.info
    }

    pub fn response_code(&self) -> Option<u16> {
        self.info.response_code
    }

    pub fn effective_url(&self) -> Option<&str> {
        self.info.effective_url.as_deref()
    }

    async fn client(&mut self) -> Result<reqwest::Client, TransferStatus> {
        let key = ClientKey::from_options(&self.options);
        if key.is_shared() {
            return Ok(if key.follow_redirects {
                self.following.clone()
            } else {
                self.direct.clone()
            });
        }

        if let Some((cached, client)) = &self.dedicated
            && *cached == key
        {
            return Ok(client.clone());
        }

        let client = build_dedicated_client(&self.config, &key).await?;
        tracing::trace!(?key, "Built dedicated HTTP client");
        self.dedicated = Some((key, client.clone()));
        Ok(client)
    }
}

#[async_trait]
impl TransferHandle for HttpHandle {
    async fn perform(&mut self) -> TransferStatus {
        self.info = TransferInfo::default();

        let Some(url) = self.options.url.clone() else {
            return TransferStatus::InvalidOptions("no target URL configured".to_string());
        };

        let client = match self.client().await {
            Ok(client) => client,
            Err(status) => return status,
        };

        let mut request = client.get(&url);
        if let Some(timeout) = self.options.timeout {
            request = request.timeout(timeout);
        }
        for (name, value) in &self.options.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return classify_error(&e),
        };

        self.info.response_code = Some(response.status().as_u16());
        self.info.effective_url = Some(response.url().to_string());
        if self.options.capture_headers {
            self.info.headers = response.headers().clone();
        }

        if self.options.capture_body {
            match response.bytes().await {
                Ok(body) => self.info.body = body,
                Err(e) => return classify_error(&e),
            }
        }

        TransferStatus::Ok
    }

    fn reset(&mut self) {
        // The dedicated client survives reset so repeated bindings reuse connections.
        self.options = TransferOptions::default();
        self.info = TransferInfo::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn handle() -> HttpHandle {
        HttpTransport::new(HttpTransportConfig::default())
            .unwrap()
            .create_handle()
            .unwrap()
    }

    #[test]
    fn binding_parses_prefixed_forms() {
        assert_eq!(
            "if!eth0".parse::<NetworkBinding>().unwrap(),
            NetworkBinding::Interface("eth0".to_string())
        );
        assert_eq!(
            "host!2001:db8::1".parse::<NetworkBinding>().unwrap(),
            NetworkBinding::Address("2001:db8::1".parse().unwrap())
        );
        assert_eq!(
            "host![::1]".parse::<NetworkBinding>().unwrap(),
            NetworkBinding::Address("::1".parse().unwrap())
        );
    }

    #[test]
    fn binding_parses_bare_values() {
        assert_eq!(
            " 10.0.0.7 ".parse::<NetworkBinding>().unwrap(),
            NetworkBinding::Address("10.0.0.7".parse().unwrap())
        );
        assert_eq!(
            "wlan0".parse::<NetworkBinding>().unwrap(),
            NetworkBinding::Interface("wlan0".to_string())
        );
    }

    #[test]
    fn binding_rejects_malformed() {
        assert_eq!("".parse::<NetworkBinding>(), Err(BindingParseError::Empty));
        assert!(matches!(
            "host!not-an-ip".parse::<NetworkBinding>(),
            Err(BindingParseError::InvalidAddress(_))
        ));
        assert!(matches!(
            "if!".parse::<NetworkBinding>(),
            Err(BindingParseError::InvalidInterface(_))
        ));
        assert!(matches!(
            "a-very-long-interface-name".parse::<NetworkBinding>(),
            Err(BindingParseError::InvalidInterface(_))
        ));
        assert!(matches!(
            "host!!1.2.3.4".parse::<NetworkBinding>(),
            Err(BindingParseError::InvalidAddress(_))
        ));
    }

    #[test]
    fn binding_display_round_trips_convention() {
        let binding: NetworkBinding = "host!10.1.2.3".parse().unwrap();
        assert_eq!(binding.to_string(), "host!10.1.2.3");
        let binding: NetworkBinding = "if!eth1".parse().unwrap();
        assert_eq!(binding.to_string(), "if!eth1");
    }

    #[tokio::test]
    async fn perform_captures_response() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ip"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("x-probe", "yes")
                    .set_body_string("2001:db8::1\n"),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut handle = handle();
        handle.configure(
            TransferOptions::new(format!("{}/ip", server.uri()))
                .with_capture_headers(true)
                .with_capture_body(true),
        );

        assert_eq!(handle.perform().await, TransferStatus::Ok);
        assert_eq!(handle.response_code(), Some(200));
        assert_eq!(handle.info().body_text(), "2001:db8::1\n");
        assert_eq!(handle.info().headers.get("x-probe").unwrap(), "yes");
        assert!(handle.effective_url().unwrap().ends_with("/ip"));
    }

    #[tokio::test]
    async fn capture_is_opt_in() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
            .mount(&server)
            .await;

        let mut handle = handle();
        handle.configure(TransferOptions::new(server.uri()));

        assert_eq!(handle.perform().await, TransferStatus::Ok);
        assert!(handle.info().body.is_empty());
        assert!(handle.info().headers.is_empty());
    }

    #[tokio::test]
    async fn http_error_codes_are_transport_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut handle = handle();
        handle.configure(TransferOptions::new(server.uri()));

        assert_eq!(handle.perform().await, TransferStatus::Ok);
        assert_eq!(handle.response_code(), Some(404));
    }

    #[tokio::test]
    async fn redirects_follow_only_when_asked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/old"))
            .respond_with(
                ResponseTemplate::new(302).insert_header("location", "/new"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut handle = handle();
        let url = format!("{}/old", server.uri());

        handle.configure(TransferOptions::new(url.clone()));
        assert_eq!(handle.perform().await, TransferStatus::Ok);
        assert_eq!(handle.response_code(), Some(302));

        handle.reset();
        handle.configure(TransferOptions::new(url).with_follow_redirects(true));
        assert_eq!(handle.perform().await, TransferStatus::Ok);
        assert_eq!(handle.response_code(), Some(200));
        assert!(handle.effective_url().unwrap().ends_with("/new"));
    }

    #[tokio::test]
    async fn request_headers_are_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-trace", "abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut handle = handle();
        handle.configure(TransferOptions::new(server.uri()).with_header("x-trace", "abc"));

        assert_eq!(handle.perform().await, TransferStatus::Ok);
        assert_eq!(handle.response_code(), Some(204));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let mut handle = handle();
        handle.configure(TransferOptions::new(server.uri()).with_timeout_ms(50));

        assert_eq!(handle.perform().await, TransferStatus::TimedOut);
        assert_eq!(handle.response_code(), None);
    }

    #[tokio::test]
    async fn missing_url_is_invalid_options() {
        let mut handle = handle();
        assert!(matches!(
            handle.perform().await,
            TransferStatus::InvalidOptions(_)
        ));
    }

    #[tokio::test]
    async fn unreadable_trust_bundle_is_invalid_options() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = handle();
        handle.configure(
            TransferOptions::new("https://example.invalid/")
                .with_ca_bundle(dir.path().join("missing.pem")),
        );

        let status = handle.perform().await;
        assert!(matches!(status, TransferStatus::InvalidOptions(ref m) if m.contains("trust bundle")));
    }

    #[tokio::test]
    async fn source_address_binding_reaches_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let mut handle = handle();
        let binding: NetworkBinding = "host!127.0.0.1".parse().unwrap();
        for _ in 0..2 {
            handle.reset();
            handle.configure(TransferOptions::new(server.uri()).with_binding(binding.clone()));
            assert_eq!(handle.perform().await, TransferStatus::Ok);
        }
        assert!(handle.dedicated.is_some());
    }

    #[tokio::test]
    async fn connection_refused_is_connect_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut handle = handle();
        handle.configure(TransferOptions::new(format!("http://{}/", addr)));

        assert!(matches!(
            handle.perform().await,
            TransferStatus::ConnectFailed(_)
        ));
    }

    #[test]
    fn reset_clears_options_and_info() {
        let mut handle = handle();
        handle.configure(TransferOptions::new("http://localhost/").with_capture_body(true));
        handle.info.response_code = Some(200);

        handle.reset();
        assert!(handle.options().url.is_none());
        assert!(!handle.options().capture_body);
        assert_eq!(handle.response_code(), None);
    }
}
