//! The Process state machine and its single legal-transition authority.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::ProxyError;
use crate::event::{Event, EventBus};

/// Tagged state of a single backend process. `Shutdown` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ProcessState {
    Stopped,
    Starting,
    Ready,
    Stopping,
    Shutdown,
}

impl ProcessState {
    fn as_u8(self) -> u8 {
        match self {
            ProcessState::Stopped => 0,
            ProcessState::Starting => 1,
            ProcessState::Ready => 2,
            ProcessState::Stopping => 3,
            ProcessState::Shutdown => 4,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => ProcessState::Stopped,
            1 => ProcessState::Starting,
            2 => ProcessState::Ready,
            3 => ProcessState::Stopping,
            _ => ProcessState::Shutdown,
        }
    }

    /// The transition table from the data model: the only authority on what
    /// moves are legal. Anything not listed here is a programming error, not
    /// a runtime condition to recover from.
    pub(crate) fn is_legal_transition(from: ProcessState, to: ProcessState) -> bool {
        use ProcessState::*;
        match (from, to) {
            (Stopped, Starting) => true,
            (Starting, Ready) => true,
            (Starting, Stopped) => true,
            (Ready, Stopping) => true,
            (Stopping, Stopped) => true,
            (_, Shutdown) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Stopped => "Stopped",
            ProcessState::Starting => "Starting",
            ProcessState::Ready => "Ready",
            ProcessState::Stopping => "Stopping",
            ProcessState::Shutdown => "Shutdown",
        };
        f.write_str(s)
    }
}

/// Owns the atomic state word plus the CAS primitive that is the sole path
/// any transition takes. `stateMutex` in the concurrency model's lock table
/// is realized here as a `tokio::sync::Mutex` guarding the word itself; the
/// atomic is read lock-free by `current()` so hot-path observers never block
/// on anything the monitor tasks are doing.
pub struct StateMachine {
    word: AtomicU8,
    // Serializes writers so two concurrent CAS attempts can't both observe
    // the same `expected` and both "win"; readers never take this lock.
    write_lock: Mutex<()>,
    model_id: String,
    events: Arc<EventBus>,
}

impl StateMachine {
    pub fn new(model_id: String, events: Arc<EventBus>) -> Self {
        Self {
            word: AtomicU8::new(ProcessState::Stopped.as_u8()),
            write_lock: Mutex::new(()),
            model_id,
            events,
        }
    }

    pub fn current(&self) -> ProcessState {
        ProcessState::from_u8(self.word.load(Ordering::SeqCst))
    }

    /// `swapState(expected, next)`: takes the write lock, checks the current
    /// value, rejects with `kIllegalTransition` on mismatch or on a move the
    /// transition table forbids, otherwise commits and publishes a
    /// `ProcessStateChange` event. Returns the prior state on success.
    pub async fn cas(
        &self,
        expected: ProcessState,
        next: ProcessState,
    ) -> Result<ProcessState, ProxyError> {
        let _guard = self.write_lock.lock().await;
        let current = self.current();
        if current != expected {
            tracing::error!(
                model_id = %self.model_id,
                expected = %expected,
                found = %current,
                "illegal transition: stale expected state"
            );
            return Err(ProxyError::IllegalTransition {
                model_id: self.model_id.clone(),
                expected: expected.to_string(),
                found: current.to_string(),
            });
        }
        if !ProcessState::is_legal_transition(current, next) {
            tracing::error!(
                model_id = %self.model_id,
                from = %current,
                to = %next,
                "illegal transition: not in the transition table"
            );
            return Err(ProxyError::IllegalTransition {
                model_id: self.model_id.clone(),
                expected: format!("one of the legal successors of {current}"),
                found: next.to_string(),
            });
        }
        self.word.store(next.as_u8(), Ordering::SeqCst);
        self.events.publish(Event::ProcessStateChange {
            model_id: self.model_id.clone(),
            from: current,
            to: next,
            at: chrono::Utc::now(),
        });
        Ok(current)
    }

    /// Force a transition to `Shutdown` from whatever the current state is;
    /// every state has a legal edge to `Shutdown`, so this never fails on
    /// transition legality, only exposed for symmetry with `cas`.
    pub async fn force_shutdown(&self) -> ProcessState {
        let _guard = self.write_lock.lock().await;
        let current = self.current();
        if current == ProcessState::Shutdown {
            return current;
        }
        self.word.store(ProcessState::Shutdown.as_u8(), Ordering::SeqCst);
        self.events.publish(Event::ProcessStateChange {
            model_id: self.model_id.clone(),
            from: current,
            to: ProcessState::Shutdown,
            at: chrono::Utc::now(),
        });
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use rstest::rstest;
    use tracing_test::traced_test;
    use tracing_test::logs_contain;

    fn machine(id: &str) -> StateMachine {
        StateMachine::new(id.to_string(), Arc::new(EventBus::new()))
    }

    #[rstest]
    #[case(ProcessState::Stopped, ProcessState::Starting, true)]
    #[case(ProcessState::Starting, ProcessState::Ready, true)]
    #[case(ProcessState::Starting, ProcessState::Stopped, true)]
    #[case(ProcessState::Ready, ProcessState::Stopping, true)]
    #[case(ProcessState::Stopping, ProcessState::Stopped, true)]
    #[case(ProcessState::Stopped, ProcessState::Shutdown, true)]
    #[case(ProcessState::Starting, ProcessState::Shutdown, true)]
    #[case(ProcessState::Ready, ProcessState::Shutdown, true)]
    #[case(ProcessState::Stopping, ProcessState::Shutdown, true)]
    #[case(ProcessState::Shutdown, ProcessState::Shutdown, true)]
    #[case(ProcessState::Stopped, ProcessState::Ready, false)]
    #[case(ProcessState::Stopped, ProcessState::Stopping, false)]
    #[case(ProcessState::Starting, ProcessState::Stopping, false)]
    #[case(ProcessState::Ready, ProcessState::Starting, false)]
    #[case(ProcessState::Ready, ProcessState::Stopped, false)]
    #[case(ProcessState::Stopping, ProcessState::Starting, false)]
    #[case(ProcessState::Stopping, ProcessState::Ready, false)]
    #[case(ProcessState::Shutdown, ProcessState::Stopped, false)]
    fn transition_table_matches_spec(
        #[case] from: ProcessState,
        #[case] to: ProcessState,
        #[case] expected: bool,
    ) {
        assert_eq!(ProcessState::is_legal_transition(from, to), expected, "{from} -> {to}");
    }

    #[traced_test]
    #[tokio::test]
    async fn illegal_transition_logs_at_error_severity() {
        let m = machine("m1");
        let _ = m.cas(ProcessState::Stopped, ProcessState::Ready).await;
        assert!(logs_contain("illegal transition"));
    }

    #[tokio::test]
    async fn legal_path_succeeds() {
        let m = machine("m1");
        assert_eq!(m.current(), ProcessState::Stopped);
        m.cas(ProcessState::Stopped, ProcessState::Starting).await.unwrap();
        m.cas(ProcessState::Starting, ProcessState::Ready).await.unwrap();
        assert_eq!(m.current(), ProcessState::Ready);
    }

    #[tokio::test]
    async fn stale_expected_is_illegal_transition() {
        let m = machine("m1");
        m.cas(ProcessState::Stopped, ProcessState::Starting).await.unwrap();
        let err = m.cas(ProcessState::Stopped, ProcessState::Starting).await.unwrap_err();
        assert_matches::assert_matches!(err, ProxyError::IllegalTransition { .. });
    }

    #[tokio::test]
    async fn transition_outside_table_is_illegal() {
        let m = machine("m1");
        let err = m.cas(ProcessState::Stopped, ProcessState::Ready).await.unwrap_err();
        assert_matches::assert_matches!(err, ProxyError::IllegalTransition { .. });
    }

    #[tokio::test]
    async fn any_state_can_shut_down() {
        for start in [
            ProcessState::Stopped,
            ProcessState::Starting,
            ProcessState::Ready,
            ProcessState::Stopping,
        ] {
            let m = machine("m1");
            m.word.store(start.as_u8(), Ordering::SeqCst);
            let prior = m.force_shutdown().await;
            assert_eq!(prior, start);
            assert_eq!(m.current(), ProcessState::Shutdown);
        }
    }
}
