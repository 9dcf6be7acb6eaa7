//! Counting transport double for pipeline tests.
//!
//! Every handle and context reports its creation and drop to shared counters,
//! so tests can assert that nothing outlives the pipeline.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::transfer::{TransferHandle, TransferStatus, Transport, TransportError};

#[derive(Default)]
struct Counters {
    handles_created: AtomicUsize,
    handles_dropped: AtomicUsize,
    handles_released: AtomicUsize,
    contexts_created: AtomicUsize,
    contexts_dropped: AtomicUsize,
    performs: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockStats {
    pub handles_created: usize,
    pub handles_dropped: usize,
    pub handles_released: usize,
    pub contexts_created: usize,
    pub contexts_dropped: usize,
    pub performs: usize,
    pub active: usize,
    pub peak_active: usize,
}

impl MockStats {
    pub fn nothing_leaked(&self) -> bool {
        self.handles_created == self.handles_dropped
            && self.contexts_created == self.contexts_dropped
            && self.active == 0
    }
}

#[derive(Clone, Default)]
pub struct MockTransport {
    counters: Arc<Counters>,
    fail_release: bool,
    fail_create_after: Option<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `release_handle` drops the handle but reports an error.
    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// `create_handle` fails once `n` handles exist.
    pub fn failing_create_after(mut self, n: usize) -> Self {
        self.fail_create_after = Some(n);
        self
    }

    pub fn context(&self, label: impl Into<String>) -> Tracked {
        self.counters.contexts_created.fetch_add(1, Ordering::SeqCst);
        Tracked {
            label: label.into(),
            counters: Arc::clone(&self.counters),
        }
    }

    pub fn stats(&self) -> MockStats {
        let c = &self.counters;
        MockStats {
            handles_created: c.handles_created.load(Ordering::SeqCst),
            handles_dropped: c.handles_dropped.load(Ordering::SeqCst),
            handles_released: c.handles_released.load(Ordering::SeqCst),
            contexts_created: c.contexts_created.load(Ordering::SeqCst),
            contexts_dropped: c.contexts_dropped.load(Ordering::SeqCst),
            performs: c.performs.load(Ordering::SeqCst),
            active: c.active.load(Ordering::SeqCst),
            peak_active: c.peak_active.load(Ordering::SeqCst),
        }
    }
}

impl Transport for MockTransport {
    type Handle = MockHandle;

    fn create_handle(&self) -> Result<MockHandle, TransportError> {
        let created = self.counters.handles_created.load(Ordering::SeqCst);
        if self.fail_create_after.is_some_and(|n| created >= n) {
            return Err(TransportError::CreateHandle("mock limit reached".to_string()));
        }
        self.counters.handles_created.fetch_add(1, Ordering::SeqCst);
        Ok(MockHandle {
            counters: Arc::clone(&self.counters),
            plan: Plan::default(),
            performed: 0,
        })
    }

    fn release_handle(&self, handle: MockHandle) -> Result<(), TransportError> {
        self.counters.handles_released.fetch_add(1, Ordering::SeqCst);
        drop(handle);
        if self.fail_release {
            Err(TransportError::Release("mock release failure".to_string()))
        } else {
            Ok(())
        }
    }
}

/// What the next `perform` on a handle does.
#[derive(Debug, Clone)]
pub struct Plan {
    pub status: TransferStatus,
    /// Cooperative yields before completing, so transfers overlap.
    pub yields: usize,
    pub hang: bool,
    pub panic: bool,
}

impl Default for Plan {
    fn default() -> Self {
        Self {
            status: TransferStatus::Ok,
            yields: 3,
            hang: false,
            panic: false,
        }
    }
}

pub struct MockHandle {
    counters: Arc<Counters>,
    plan: Plan,
    performed: usize,
}

impl MockHandle {
    pub fn configure(&mut self, plan: Plan) {
        self.plan = plan;
    }

    pub fn performed(&self) -> usize {
        self.performed
    }
}

struct ActiveGuard(Arc<Counters>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransferHandle for MockHandle {
    async fn perform(&mut self) -> TransferStatus {
        self.performed += 1;
        let counters = &self.counters;
        counters.performs.fetch_add(1, Ordering::SeqCst);
        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_active.fetch_max(active, Ordering::SeqCst);
        let _active = ActiveGuard(Arc::clone(counters));

        if self.plan.panic {
            panic!("mock transfer panicked");
        }
        if self.plan.hang {
            std::future::pending::<()>().await;
        }
        for _ in 0..self.plan.yields {
            tokio::task::yield_now().await;
        }
        self.plan.status.clone()
    }

    fn reset(&mut self) {
        self.plan = Plan::default();
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.counters.handles_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Request context that counts its own drop.
#[derive(Debug)]
pub struct Tracked {
    label: String,
    counters: Arc<Counters>,
}

impl Tracked {
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counters.contexts_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Counters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counters").finish_non_exhaustive()
    }
}
