//! Slot typestate: empty slot, pending slot, completion.

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::SlotId;
use crate::handler::{ResponseHandler, SlotAction};
use crate::provider::ProviderFault;
use crate::transfer::{TransferHandle, TransferStatus};

/// An empty slot: owns its handle, no request bound.
pub struct Slot<H> {
    id: SlotId,
    handle: H,
}

impl<H: TransferHandle> Slot<H> {
    pub(crate) fn new(id: SlotId, handle: H) -> Self {
        Self { id, handle }
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub(crate) fn handle_mut(&mut self) -> &mut H {
        &mut self.handle
    }

    /// Clear whatever the previous request left on the handle.
    pub(crate) fn reset(&mut self) {
        self.handle.reset();
    }

    /// Bind a request context. The handle must already be configured.
    pub(crate) fn fill<C>(self, context: C) -> PendingSlot<H, C> {
        PendingSlot {
            slot: self,
            context,
        }
    }

    pub(crate) fn into_handle(self) -> H {
        self.handle
    }
}

/// A configured slot carrying its request context, ready to submit.
pub struct PendingSlot<H, C> {
    slot: Slot<H>,
    context: C,
}

impl<H: TransferHandle, C> PendingSlot<H, C> {
    pub fn id(&self) -> SlotId {
        self.slot.id
    }

    /// Run the transfer. Lives on the transfer task.
    ///
    /// The slot always comes back: when `cancel` fires the transfer is dropped
    /// mid-flight, and a panic inside the transport unwinds only the transfer
    /// future, never the handle it borrowed.
    pub(crate) async fn perform(self, cancel: CancellationToken) -> Transferred<H, C> {
        let PendingSlot { mut slot, context } = self;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = AssertUnwindSafe(slot.handle.perform()).catch_unwind() => Some(outcome),
        };

        match outcome {
            Some(Ok(status)) => {
                tracing::trace!(slot = %slot.id, status = %status, "Transfer finished");
                Transferred::Completed(Completion {
                    slot,
                    context,
                    status,
                })
            }
            Some(Err(_)) => {
                tracing::error!(slot = %slot.id, "Transfer panicked");
                Transferred::Panicked(slot)
            }
            None => {
                tracing::trace!(slot = %slot.id, "Transfer cancelled");
                Transferred::Cancelled(slot)
            }
        }
    }

    /// Complete without sending anything.
    pub(crate) fn fault(self, fault: ProviderFault) -> Completion<H, C> {
        Completion {
            slot: self.slot,
            context: self.context,
            status: TransferStatus::ProviderFault(fault.0),
        }
    }
}

/// What a transfer task hands back. Only `Completed` carries the context;
/// the other two drop it on the task.
pub enum Transferred<H, C> {
    Completed(Completion<H, C>),
    Cancelled(Slot<H>),
    /// The transport panicked; the handle may be in any state.
    Panicked(Slot<H>),
}

impl<H, C> Transferred<H, C> {
    pub fn id(&self) -> SlotId {
        match self {
            Self::Completed(completion) => completion.slot.id,
            Self::Cancelled(slot) | Self::Panicked(slot) => slot.id,
        }
    }
}

/// A finished transfer awaiting the response handler.
pub struct Completion<H, C> {
    slot: Slot<H>,
    context: C,
    status: TransferStatus,
}

impl<H: TransferHandle, C> Completion<H, C> {
    pub fn id(&self) -> SlotId {
        self.slot.id
    }

    pub fn status(&self) -> &TransferStatus {
        &self.status
    }

    /// Hand the completion to the response handler. The context is moved into
    /// the handler and dropped when it returns; the slot comes back empty.
    pub(crate) fn dispatch<R>(self, handler: &mut R) -> (Slot<H>, SlotAction)
    where
        R: ResponseHandler<H, C> + ?Sized,
    {
        let Completion {
            slot,
            context,
            status,
        } = self;
        let action = handler.on_complete(&slot.handle, context, status);
        (slot, action)
    }

    /// Drop the context without handling it. Used when the run is aborted.
    pub(crate) fn discard(self) -> Slot<H> {
        self.slot
    }
}
