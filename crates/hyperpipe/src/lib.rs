//! hyperpipe: bounded-concurrency request pipeline.
//!
//! A [`Pipeline`] keeps at most N transfers in flight, pulling work from a
//! [`WorkProvider`] only when a slot frees up and handing every completion to a
//! [`ResponseHandler`] that decides whether the slot is recycled or retired.

mod config;
mod handler;
mod pipeline;
mod provider;
mod version;

pub mod slot;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use config::{MAX_CONCURRENCY, PipelineConfig};
pub use handler::{ResponseHandler, SlotAction};
pub use pipeline::{DriverState, Pipeline, PipelineError, RunId, RunSummary};
pub use provider::{IterProvider, NextRequest, ProviderFault, ProviderFn, WorkProvider, provider_fn};
pub use slot::{SlotId, SlotLedger, SlotState};
pub use transfer::http::{
    HttpHandle, HttpTransport, HttpTransportConfig, NetworkBinding, TransferInfo, TransferOptions,
};
pub use transfer::{TransferHandle, TransferStatus, Transport, TransportError};
pub use version::{HYPERPIPE_VERSION, user_agent};

pub use tokio_util::sync::CancellationToken;
