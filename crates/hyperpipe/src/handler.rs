//! Response handlers: completion sinks deciding each slot's fate.

use crate::transfer::TransferStatus;

/// What to do with a slot once its transfer has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotAction {
    /// Reset the handle and pull the next request into the same slot.
    Recycle,
    /// Remove the slot from the pool for the rest of the run.
    Retire,
}

/// Completion sink.
///
/// Gets the finished handle for inspection, the request context by value
/// (dropped when the handler returns), and the transport status. Failure
/// statuses are ordinary input; the pipeline never retries on its own.
pub trait ResponseHandler<H, C>: Send {
    fn on_complete(&mut self, handle: &H, context: C, status: TransferStatus) -> SlotAction;
}

impl<H, C, F> ResponseHandler<H, C> for F
where
    F: FnMut(&H, C, TransferStatus) -> SlotAction + Send,
{
    fn on_complete(&mut self, handle: &H, context: C, status: TransferStatus) -> SlotAction {
        self(handle, context, status)
    }
}
