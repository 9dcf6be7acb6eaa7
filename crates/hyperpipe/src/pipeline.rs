//! Pipeline driver - keeps N transfer slots busy.
//!
//! Flow:
//! 1. Pull a request from the provider for every empty slot
//! 2. Submit configured handles as transfer tasks
//! 3. Wait for at least one completion (waking every poll interval)
//! 4. Dispatch every completion of that wake to the response handler
//! 5. Recycle slots back to step 1 or retire them; stop once all are retired
//!
//! Handles go back through `Transport::release_handle` on normal stop, on
//! cancellation (every transfer task watches a child token and hands its slot
//! back) and after a transport panic. Only a dropped run future falls back to
//! aborting the tasks, which drops their handles without a release call.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{MAX_CONCURRENCY, PipelineConfig};
use crate::handler::{ResponseHandler, SlotAction};
use crate::provider::{NextRequest, WorkProvider};
use crate::slot::{Completion, Slot, SlotId, SlotLedger, Transferred};
use crate::transfer::{TransferStatus, Transport, TransportError};

/// Identifier attached to the tracing span of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RunId(uuid::Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverState {
    /// Constructed, not yet run.
    Idle,
    /// At least one slot may still pull work.
    Running,
    /// Provider exhausted, transfers still in flight.
    Draining,
    /// Every slot retired. Terminal.
    Stopped,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Transfers submitted to the transport.
    pub transfers: u64,
    pub succeeded: u64,
    /// Completed with a transport-level failure status.
    pub failed: u64,
    pub provider_faults: u64,
    pub recycled: u64,
    pub retired: usize,
    /// Slots retired without ever carrying a transfer.
    pub retired_unused: usize,
    pub peak_in_flight: usize,
    /// Transfer tasks that panicked; their slots were retired.
    pub panicked: u64,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub release_errors: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("concurrency must be between 1 and {max}, got {0}", max = MAX_CONCURRENCY)]
    InvalidConcurrency(usize),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to build runtime: {0}")]
    Runtime(#[source] std::io::Error),
}

type Joined<H, C> = Result<(Id, Transferred<H, C>), JoinError>;

/// Bounded-concurrency driver over a fixed pool of transfer slots.
pub struct Pipeline<T: Transport, P, R> {
    config: PipelineConfig,
    transport: T,
    provider: P,
    handler: R,
    slots: Vec<Slot<T::Handle>>,
    ledger: SlotLedger,
    state: watch::Sender<DriverState>,
    summary: RunSummary,
}

impl<T, P, R> Pipeline<T, P, R>
where
    T: Transport,
    P: WorkProvider<T::Handle>,
    R: ResponseHandler<T::Handle, P::Context>,
{
    pub fn new(
        concurrency: usize,
        transport: T,
        provider: P,
        handler: R,
    ) -> Result<Self, PipelineError> {
        Self::with_config(PipelineConfig::new(concurrency), transport, provider, handler)
    }

    /// Validate the configuration and acquire one handle per slot.
    pub fn with_config(
        config: PipelineConfig,
        transport: T,
        provider: P,
        handler: R,
    ) -> Result<Self, PipelineError> {
        let num_slots = config.concurrency;
        if !(1..=MAX_CONCURRENCY).contains(&num_slots) {
            return Err(PipelineError::InvalidConcurrency(num_slots));
        }

        let mut slots = Vec::with_capacity(num_slots);
        for index in 0..num_slots {
            match transport.create_handle() {
                Ok(handle) => slots.push(Slot::new(SlotId::new(index), handle)),
                Err(e) => {
                    tracing::error!(slot = index, error = %e, "Failed to create transfer handle");
                    for slot in slots {
                        if let Err(err) = transport.release_handle(slot.into_handle()) {
                            tracing::warn!(error = %err, "Failed to release handle after setup error");
                        }
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(num_slots, "Pipeline created");
        Ok(Self {
            config,
            transport,
            provider,
            handler,
            slots,
            ledger: SlotLedger::new(num_slots),
            state: watch::Sender::new(DriverState::Idle),
            summary: RunSummary::default(),
        })
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    pub fn state(&self) -> DriverState {
        *self.state.borrow()
    }

    /// Follow state changes while a run holds the pipeline.
    pub fn subscribe_state(&self) -> watch::Receiver<DriverState> {
        self.state.subscribe()
    }

    pub fn ledger(&self) -> &SlotLedger {
        &self.ledger
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn handler(&self) -> &R {
        &self.handler
    }

    /// Run until every slot is retired.
    ///
    /// Running a stopped pipeline does nothing and returns the last summary.
    pub async fn run(&mut self) -> RunSummary {
        self.run_until_cancelled(CancellationToken::new()).await
    }

    /// Like [`run`](Self::run), but aborts every in-flight transfer once
    /// `cancel` fires.
    pub async fn run_until_cancelled(&mut self, cancel: CancellationToken) -> RunSummary {
        if self.state() == DriverState::Stopped {
            tracing::debug!("Pipeline already stopped");
            return self.summary.clone();
        }

        let run_id = RunId::new();
        let span = tracing::info_span!(
            "pipeline",
            %run_id,
            concurrency = self.config.concurrency
        );

        let Self {
            config,
            transport,
            provider,
            handler,
            slots,
            ledger,
            state,
            summary,
        } = self;

        state.send_replace(DriverState::Running);
        let mut run = Run {
            transport,
            provider,
            handler,
            ledger,
            state,
            cancel: cancel.child_token(),
            poll_interval: config.poll_interval,
            idle: std::mem::take(slots).into(),
            in_flight: JoinSet::new(),
            tasks: HashMap::new(),
            exhausted: false,
            finished: false,
            summary: RunSummary::default(),
        };

        run.execute().instrument(span.clone()).await;
        let result = span.in_scope(|| run.finish());
        *summary = result.clone();
        result
    }

    /// Run to completion on a fresh current-thread runtime.
    pub fn run_blocking(&mut self) -> Result<RunSummary, PipelineError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(PipelineError::Runtime)?;
        Ok(runtime.block_on(self.run()))
    }
}

impl<T: Transport, P, R> Drop for Pipeline<T, P, R> {
    fn drop(&mut self) {
        // Only a pipeline that never ran still holds handles here.
        for slot in self.slots.drain(..) {
            if let Err(e) = self.transport.release_handle(slot.into_handle()) {
                tracing::warn!(error = %e, "Failed to release handle on drop");
            }
        }
    }
}

/// One execution of the driver loop. Borrowed out of the pipeline so that
/// dropping the run future still releases everything it holds.
struct Run<'a, T, P, R>
where
    T: Transport,
    P: WorkProvider<T::Handle>,
{
    transport: &'a T,
    provider: &'a mut P,
    handler: &'a mut R,
    ledger: &'a mut SlotLedger,
    state: &'a watch::Sender<DriverState>,
    /// Run-local; every transfer task holds a child of it.
    cancel: CancellationToken,
    poll_interval: Duration,
    idle: VecDeque<Slot<T::Handle>>,
    in_flight: JoinSet<Transferred<T::Handle, P::Context>>,
    tasks: HashMap<Id, SlotId>,
    exhausted: bool,
    finished: bool,
    summary: RunSummary,
}

impl<T, P, R> Run<'_, T, P, R>
where
    T: Transport,
    P: WorkProvider<T::Handle>,
    R: ResponseHandler<T::Handle, P::Context>,
{
    async fn execute(&mut self) {
        tracing::info!(num_slots = self.ledger.num_slots(), "Pipeline started");

        loop {
            while let Some(slot) = self.idle.pop_front() {
                if let Some(slot) = self.refill(slot).await {
                    self.idle.push_front(slot);
                    self.abort().await;
                    return;
                }
            }

            if self.in_flight.is_empty() {
                break;
            }
            if self.exhausted && *self.state.borrow() == DriverState::Running {
                tracing::debug!(in_flight = self.ledger.in_flight(), "Pipeline draining");
                self.state.send_replace(DriverState::Draining);
            }

            if !self.wait_for_completions().await {
                self.abort().await;
                return;
            }
        }
    }

    /// Pull the next request into `slot` and act on the answer.
    ///
    /// Returns the slot back only if the pull was cancelled.
    async fn refill(&mut self, mut slot: Slot<T::Handle>) -> Option<Slot<T::Handle>> {
        let id = slot.id();
        if self.exhausted {
            self.retire(slot);
            return None;
        }
        if self.cancel.is_cancelled() {
            return Some(slot);
        }

        slot.reset();
        self.ledger.mark_pending(id);

        let next = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            next = self.provider.next_request(slot.handle_mut()) => Some(next),
        };

        match next {
            None => {
                self.ledger.mark_empty(id);
                Some(slot)
            }
            Some(NextRequest::Ready(context)) => {
                self.ledger.mark_in_flight(id);
                self.summary.transfers += 1;
                tracing::debug!(slot = %id, in_flight = self.ledger.in_flight(), "Transfer submitted");

                let transfer = slot.fill(context).perform(self.cancel.child_token());
                let task = self.in_flight.spawn(transfer);
                self.tasks.insert(task.id(), id);
                None
            }
            Some(NextRequest::Faulted(context, fault)) => {
                tracing::warn!(slot = %id, error = %fault, "Provider failed to prepare request");
                self.ledger.mark_empty(id);
                self.dispatch(slot.fill(context).fault(fault));
                None
            }
            Some(NextRequest::Exhausted) => {
                tracing::info!(
                    slot = %id,
                    in_flight = self.ledger.in_flight(),
                    "Provider exhausted"
                );
                self.exhausted = true;
                self.ledger.mark_empty(id);
                self.retire(slot);
                None
            }
        }
    }

    /// Block until at least one transfer completes, then handle everything that
    /// completed in the same wake. Returns false if cancelled.
    async fn wait_for_completions(&mut self) -> bool {
        let first = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return false,
                joined = self.in_flight.join_next_with_id() => break joined,
                _ = tokio::time::sleep(self.poll_interval) => {
                    tracing::trace!(
                        in_flight = self.ledger.in_flight(),
                        transfers = self.summary.transfers,
                        "Waiting for completions"
                    );
                }
            }
        };

        let mut batch: Vec<_> = first.into_iter().collect();
        while let Some(joined) = self.in_flight.try_join_next_with_id() {
            batch.push(joined);
        }
        tracing::trace!(completions = batch.len(), "Wake");

        for joined in batch {
            self.complete(joined);
        }
        true
    }

    fn complete(&mut self, joined: Joined<T::Handle, P::Context>) {
        let transferred = match joined {
            Ok((task, transferred)) => {
                self.tasks.remove(&task);
                transferred
            }
            Err(e) => return self.lose_task(e),
        };

        match transferred {
            Transferred::Completed(completion) => {
                self.ledger.mark_empty(completion.id());
                self.dispatch(completion);
            }
            Transferred::Panicked(slot) => {
                tracing::error!(slot = %slot.id(), "Transfer panicked - retiring slot");
                self.summary.panicked += 1;
                self.retire(slot);
            }
            Transferred::Cancelled(slot) => {
                tracing::debug!(slot = %slot.id(), "Transfer cancelled - retiring slot");
                self.retire(slot);
            }
        }
    }

    /// A task that died without handing its slot back. Its handle is gone, so
    /// the slot is retired in the ledger and the missed release is recorded.
    fn lose_task(&mut self, e: JoinError) {
        if e.is_panic() {
            self.summary.panicked += 1;
        }
        let Some(id) = self.tasks.remove(&e.id()) else {
            tracing::error!(error = %e, "Bug: unknown transfer task ended");
            return;
        };
        tracing::error!(slot = %id, error = %e, "Bug: transfer task ended without its slot");
        self.ledger.retire(id);
        self.summary
            .release_errors
            .push(format!("slot {}: handle lost with its task: {}", id, e));
    }

    fn dispatch(&mut self, completion: Completion<T::Handle, P::Context>) {
        let id = completion.id();
        match completion.status() {
            TransferStatus::Ok => self.summary.succeeded += 1,
            TransferStatus::ProviderFault(_) => self.summary.provider_faults += 1,
            status => {
                tracing::debug!(slot = %id, %status, "Transfer failed");
                self.summary.failed += 1;
            }
        }

        let (slot, action) = completion.dispatch(&mut *self.handler);
        match action {
            SlotAction::Recycle => {
                self.summary.recycled += 1;
                self.idle.push_back(slot);
            }
            SlotAction::Retire => self.retire(slot),
        }
    }

    fn retire(&mut self, slot: Slot<T::Handle>) {
        let id = slot.id();
        self.ledger.retire(id);
        tracing::debug!(slot = %id, active = self.ledger.active(), "Slot retired");
        if let Err(e) = self.transport.release_handle(slot.into_handle()) {
            tracing::warn!(slot = %id, error = %e, "Failed to release handle");
            self.summary.release_errors.push(e.to_string());
        }
    }

    /// Cancel every in-flight transfer, take the slots back and retire them all.
    async fn abort(&mut self) {
        tracing::warn!(
            in_flight = self.ledger.in_flight(),
            "Pipeline cancelled - aborting in-flight transfers"
        );
        self.summary.cancelled = true;
        self.cancel.cancel();

        while let Some(joined) = self.in_flight.join_next_with_id().await {
            let transferred = match joined {
                Ok((task, transferred)) => {
                    self.tasks.remove(&task);
                    transferred
                }
                Err(e) => {
                    self.lose_task(e);
                    continue;
                }
            };
            match transferred {
                // Finished before the cancel landed; nobody handles it now.
                Transferred::Completed(completion) => self.retire(completion.discard()),
                Transferred::Panicked(slot) => {
                    self.summary.panicked += 1;
                    self.retire(slot);
                }
                Transferred::Cancelled(slot) => self.retire(slot),
            }
        }

        while let Some(slot) = self.idle.pop_front() {
            self.retire(slot);
        }
        self.ledger.retire_remaining();
    }

    fn finish(&mut self) -> RunSummary {
        self.finished = true;
        self.state.send_replace(DriverState::Stopped);

        let mut summary = std::mem::take(&mut self.summary);
        summary.retired = self.ledger.retired();
        summary.retired_unused = self.ledger.retired_unused();
        summary.peak_in_flight = self.ledger.peak_in_flight();
        debug_assert!(self.ledger.all_retired());

        tracing::info!(
            transfers = summary.transfers,
            succeeded = summary.succeeded,
            failed = summary.failed,
            retired_unused = summary.retired_unused,
            cancelled = summary.cancelled,
            "Pipeline stopped"
        );
        summary
    }
}

impl<T, P, R> Drop for Run<'_, T, P, R>
where
    T: Transport,
    P: WorkProvider<T::Handle>,
{
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        tracing::warn!(
            in_flight = self.in_flight.len(),
            "Pipeline run dropped before completion - aborting transfers"
        );
        // No await here, so slots can't be taken back: aborted tasks drop their
        // handles and contexts without a release call.
        self.cancel.cancel();
        self.in_flight.abort_all();
        for slot in self.idle.drain(..) {
            let id = slot.id();
            if let Err(e) = self.transport.release_handle(slot.into_handle()) {
                tracing::warn!(slot = %id, error = %e, "Failed to release handle");
            }
        }
        self.ledger.retire_remaining();
        self.state.send_replace(DriverState::Stopped);
    }
}
