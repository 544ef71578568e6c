use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Cancels the paired [`CancelToken`]s explicitly or once dropped.
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Returns a new token paired with this handle.
    pub fn token(&self) -> CancelToken {
        CancelToken(self.0.clone())
    }
}

impl Drop for CancelHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Cancellation signal observed by blocking operations, e.g.
/// [`crate::Session::connect_with_cancel`].
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token which is never cancelled.
    pub fn never() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Creates a cancellation handle / token pair. Once the handle gets
/// cancelled or dropped, the token signals cancellation.
pub fn cancellation() -> (CancelHandle, CancelToken) {
    let flag = Arc::new(AtomicBool::new(false));
    (CancelHandle(flag.clone()), CancelToken(flag))
}
