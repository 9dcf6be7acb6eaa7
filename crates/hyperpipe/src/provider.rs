//! Work providers: pull-based request generators.

use std::marker::PhantomData;

use async_trait::async_trait;

/// Outcome of asking a provider for the next request.
#[derive(Debug)]
pub enum NextRequest<C> {
    /// The handle is configured; submit it.
    Ready(C),
    /// Preparing this item failed. The context goes to the response handler
    /// with a `ProviderFault` status and nothing is sent.
    Faulted(C, ProviderFault),
    /// No more work, ever.
    Exhausted,
}

impl<C> NextRequest<C> {
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }
}

impl<C> From<Option<C>> for NextRequest<C> {
    fn from(next: Option<C>) -> Self {
        match next {
            Some(context) => Self::Ready(context),
            None => Self::Exhausted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProviderFault(pub String);

impl ProviderFault {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Pull-based generator of requests.
///
/// Called once per empty slot with the slot's (already reset) handle. The
/// provider configures the handle in place and returns the request context.
/// Once it returns [`NextRequest::Exhausted`] the pipeline never calls it again.
#[async_trait]
pub trait WorkProvider<H>: Send {
    type Context: Send + 'static;

    async fn next_request(&mut self, handle: &mut H) -> NextRequest<Self::Context>;
}

/// Provider backed by a synchronous closure. See [`provider_fn`].
pub struct ProviderFn<F, C> {
    f: F,
    _context: PhantomData<fn() -> C>,
}

/// Wrap a closure as a [`WorkProvider`].
pub fn provider_fn<H, C, F>(f: F) -> ProviderFn<F, C>
where
    F: FnMut(&mut H) -> NextRequest<C> + Send,
{
    ProviderFn {
        f,
        _context: PhantomData,
    }
}

#[async_trait]
impl<H, C, F> WorkProvider<H> for ProviderFn<F, C>
where
    H: Send,
    C: Send + 'static,
    F: FnMut(&mut H) -> NextRequest<C> + Send,
{
    type Context = C;

    async fn next_request(&mut self, handle: &mut H) -> NextRequest<C> {
        (self.f)(handle)
    }
}

/// Provider that hands out one iterator item per pull.
///
/// `configure` turns an item into a configured handle and its context.
pub struct IterProvider<I, F, C> {
    items: I,
    configure: F,
    issued: usize,
    _context: PhantomData<fn() -> C>,
}

impl<I, F, C> IterProvider<I, F, C> {
    pub fn new<T>(items: T, configure: F) -> Self
    where
        T: IntoIterator<IntoIter = I>,
    {
        Self {
            items: items.into_iter(),
            configure,
            issued: 0,
            _context: PhantomData,
        }
    }

    /// Items handed out so far, faulted ones included.
    pub fn issued(&self) -> usize {
        self.issued
    }
}

#[async_trait]
impl<H, C, I, F> WorkProvider<H> for IterProvider<I, F, C>
where
    H: Send,
    C: Send + 'static,
    I: Iterator + Send,
    I::Item: Send,
    F: FnMut(&mut H, I::Item) -> NextRequest<C> + Send,
{
    type Context = C;

    async fn next_request(&mut self, handle: &mut H) -> NextRequest<C> {
        let Some(item) = self.items.next() else {
            return NextRequest::Exhausted;
        };
        self.issued += 1;
        (self.configure)(handle, item)
    }
}
