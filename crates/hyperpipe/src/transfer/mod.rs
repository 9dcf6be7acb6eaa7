//! Transfer collaborators.
//!
//! The pipeline only sees these traits. A [`Transport`] is the global context
//! that hands out reusable [`TransferHandle`]s; each handle performs one network
//! exchange per configure/perform cycle and reports a [`TransferStatus`].

pub mod http;

use async_trait::async_trait;

/// Transport-level outcome of one transfer.
///
/// HTTP error codes are not transport failures: a 404 is `Ok` here and the
/// response handler inspects the code itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Ok,
    TimedOut,
    ConnectFailed(String),
    TooManyRedirects,
    /// The handle was configured with options the transport cannot apply.
    InvalidOptions(String),
    Failed(String),
    /// The provider failed to prepare the handle; nothing was sent.
    ProviderFault(String),
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::TimedOut => "timed_out",
            Self::ConnectFailed(_) => "connect_failed",
            Self::TooManyRedirects => "too_many_redirects",
            Self::InvalidOptions(_) => "invalid_options",
            Self::Failed(_) => "failed",
            Self::ProviderFault(_) => "provider_fault",
        }
    }

    /// Human-readable detail for failures, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::ConnectFailed(m)
            | Self::InvalidOptions(m)
            | Self::Failed(m)
            | Self::ProviderFault(m) => Some(m),
            Self::Ok | Self::TimedOut | Self::TooManyRedirects => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{}: {}", self.as_str(), msg),
            None => f.write_str(self.as_str()),
        }
    }
}

/// One reusable network exchange slot.
#[async_trait]
pub trait TransferHandle: Send + 'static {
    /// Perform the configured exchange. Never panics on network failure;
    /// every outcome is a status.
    async fn perform(&mut self) -> TransferStatus;

    /// Clear per-request options and captured response data before reuse.
    fn reset(&mut self);
}

/// Global transport context owning handle creation and release.
pub trait Transport: Send + Sync + 'static {
    type Handle: TransferHandle;

    fn create_handle(&self) -> Result<Self::Handle, TransportError>;

    /// Release a handle for good. Errors are reported but the handle is gone
    /// either way.
    fn release_handle(&self, handle: Self::Handle) -> Result<(), TransportError> {
        drop(handle);
        Ok(())
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport not initialized: {0}")]
    Init(String),
    #[error("failed to create transfer handle: {0}")]
    CreateHandle(String),
    #[error("failed to release transfer handle: {0}")]
    Release(String),
}
