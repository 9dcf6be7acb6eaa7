//! Per-address probe results.

use std::fmt;
use std::net::IpAddr;

use hyperpipe::{HttpHandle, ResponseHandler, SlotAction, TransferStatus};
use serde::Serialize;

use crate::ip_list::ProbeContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// 200 response; `seen_as` is the body, i.e. the address the target saw.
    Reachable { effective_url: String, seen_as: String },
    HttpStatus { code: u16 },
    TransferFailed { status: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    pub label: String,
    pub address: IpAddr,
    #[serde(flatten)]
    pub outcome: Outcome,
}

impl fmt::Display for ProbeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Request label: {}", self.label)?;
        match &self.outcome {
            Outcome::Reachable {
                effective_url,
                seen_as,
            } => {
                writeln!(f, "Effective URL: {}", effective_url)?;
                writeln!(f, "Effective IP: {}", seen_as)?;
            }
            Outcome::HttpStatus { code } => writeln!(f, "Invalid HTTP response code: {}", code)?,
            Outcome::TransferFailed { status } => writeln!(f, "Transfer error: {}", status)?,
        }
        write!(f, "--------")
    }
}

/// Records one report per completed probe and always recycles the slot.
#[derive(Debug, Default)]
pub struct ReportingHandler {
    reports: Vec<ProbeReport>,
    echo: bool,
}

impl ReportingHandler {
    /// `echo` prints every report to stdout as it arrives.
    pub fn new(echo: bool) -> Self {
        Self {
            reports: Vec::new(),
            echo,
        }
    }

    pub fn reports(&self) -> &[ProbeReport] {
        &self.reports
    }

    pub fn reachable(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Reachable { .. }))
            .count()
    }
}

fn outcome(handle: &HttpHandle, status: &TransferStatus) -> Outcome {
    if !status.is_success() {
        return Outcome::TransferFailed {
            status: status.to_string(),
        };
    }
    match handle.response_code() {
        Some(200) => Outcome::Reachable {
            effective_url: handle.effective_url().unwrap_or_default().to_string(),
            seen_as: handle.info().body_text().trim().to_string(),
        },
        code => Outcome::HttpStatus {
            code: code.unwrap_or_default(),
        },
    }
}

impl ResponseHandler<HttpHandle, ProbeContext> for ReportingHandler {
    fn on_complete(
        &mut self,
        handle: &HttpHandle,
        context: ProbeContext,
        status: TransferStatus,
    ) -> SlotAction {
        let outcome = outcome(handle, &status);
        match &outcome {
            Outcome::Reachable { seen_as, .. } => {
                tracing::info!(label = %context.label, seen_as = %seen_as, "Probe succeeded");
            }
            Outcome::HttpStatus { code } => {
                tracing::warn!(label = %context.label, code, "Probe got unexpected response code");
            }
            Outcome::TransferFailed { status } => {
                tracing::warn!(label = %context.label, error = %status, "Probe transfer failed");
            }
        }

        let report = ProbeReport {
            label: context.label,
            address: context.address,
            outcome,
        };
        if self.echo {
            println!("{}", report);
        }
        self.reports.push(report);
        SlotAction::Recycle
    }
}
