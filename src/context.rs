//! Cooperative cancellation, modeled on the thread-based `ThreadContext` found
//! in process-supervision code: a cheap, cloneable handle that a long-lived
//! task can select on alongside its own timers and I/O, and that a parent can
//! fire to unwind every descendant task without waiting on them.

use tokio::sync::watch;

/// A cancellation signal shared by a task and whoever owns its lifetime.
///
/// Cloning a `Context` gives every clone the same underlying flag: firing
/// `cancel()` on any clone cancels all of them. Child contexts derived with
/// `child()` are cancelled both by their own `cancel()` and by the parent's.
#[derive(Clone)]
pub struct Context {
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl Context {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self { tx, rx }
    }

    /// Fire cancellation. Idempotent; safe to call more than once.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel()` has been called on this context (or a parent
    /// it was derived from). Intended for use in `tokio::select!` alongside a
    /// sleep or an I/O future; never await this alone in a loop without also
    /// polling the work being cancelled, or cancellation becomes the only
    /// progress the task makes.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender dropped: treat as cancelled so waiters don't hang.
                return;
            }
        }
    }

    /// Derive a child context that is cancelled whenever `self` is cancelled,
    /// but that can also be cancelled independently without affecting `self`
    /// or sibling children. Used to scope a single request's cancellation to
    /// the lifetime of the Process it was issued against.
    pub fn child(&self) -> Context {
        let child = Context::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        let mut parent_rx = self.rx.clone();
        let child_tx = child.tx.clone();
        tokio::spawn(async move {
            loop {
                if *parent_rx.borrow() {
                    let _ = child_tx.send(true);
                    return;
                }
                if parent_rx.changed().await.is_err() {
                    return;
                }
            }
        });
        child
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
