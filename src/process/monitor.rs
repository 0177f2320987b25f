//! The three long-lived tasks a `Process` owns while alive: the health
//! probe loop, the child-exit supervisor, and the TTL idleness monitor.
//! Each takes a `Context` and selects on it at every suspension point, per
//! the cooperative-cancellation requirement in the concurrency model.

use std::sync::atomic::{AtomicI64, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::context::Context;
use crate::error::ProxyError;
use crate::process::health::HealthChecker;
use crate::process::state::{ProcessState, StateMachine};

const PROBE_INTERVAL: Duration = Duration::from_millis(250);
const MIN_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(15);
const TTL_MONITOR_TICK: Duration = Duration::from_secs(1);

pub enum ProbeOutcome {
    Ready,
    /// Caller cancelled (state left `Starting` behind our back, or the
    /// parent fired the cancellation signal). Not a failure in itself.
    Cancelled,
}

/// The start-and-probe algorithm's probe loop (step 4-5): poll the health
/// URL on a fixed tick, racing the tick against cancellation so the loop
/// never blocks purely on the timer.
pub async fn run_health_probe(
    ctx: &Context,
    state: &StateMachine,
    checker: &dyn HealthChecker,
    health_check_timeout: Duration,
) -> Result<ProbeOutcome, ProxyError> {
    let timeout = health_check_timeout.max(MIN_HEALTH_CHECK_TIMEOUT);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if state.current() != ProcessState::Starting {
            return Ok(ProbeOutcome::Cancelled);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(ProxyError::HealthTimeout {
                model_id: String::new(), // filled in by the caller, which knows its own id
                timeout_secs: timeout.as_secs(),
            });
        }

        tokio::select! {
            _ = ctx.cancelled() => return Ok(ProbeOutcome::Cancelled),
            healthy = checker.check_health() => {
                if healthy {
                    return Ok(ProbeOutcome::Ready);
                }
            }
        }

        tokio::select! {
            _ = ctx.cancelled() => return Ok(ProbeOutcome::Cancelled),
            _ = tokio::time::sleep(PROBE_INTERVAL) => {}
        }
    }
}

/// Shared idleness bookkeeping a `Process` exposes to the TTL monitor and
/// updates on every request. `last_used` is stored as Unix-epoch millis so
/// it can live behind a plain atomic rather than a mutex.
pub struct Idleness {
    last_used_millis: AtomicI64,
    in_flight: AtomicI32,
}

impl Idleness {
    pub fn new() -> Self {
        Self {
            last_used_millis: AtomicI64::new(Utc::now().timestamp_millis()),
            in_flight: AtomicI32::new(0),
        }
    }

    pub fn touch(&self) {
        self.last_used_millis.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    pub fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn in_flight(&self) -> i32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_used_millis.load(Ordering::SeqCst);
        let now = Utc::now().timestamp_millis();
        Duration::from_millis(now.saturating_sub(last).max(0) as u64)
    }
}

impl Default for Idleness {
    fn default() -> Self {
        Self::new()
    }
}

/// The TTL eviction monitor: wakes once per second while `Ready`, and when
/// idle time has reached `ttl` with zero in-flight requests, invokes the
/// supplied graceful-stop callback exactly once then exits (a fresh monitor
/// is started the next time the Process becomes `Ready`).
pub async fn run_ttl_monitor<F, Fut>(ctx: &Context, idleness: &Idleness, ttl: Duration, stop_graceful: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    if ttl.is_zero() {
        return;
    }
    loop {
        tokio::select! {
            _ = ctx.cancelled() => return,
            _ = tokio::time::sleep(TTL_MONITOR_TICK) => {}
        }
        if idleness.idle_for() >= ttl && idleness.in_flight() == 0 {
            stop_graceful().await;
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    mockall::mock! {
        pub Checker {}

        #[async_trait]
        impl HealthChecker for Checker {
            async fn check_health(&self) -> bool;
        }
    }

    struct NeverHealthy;
    #[async_trait]
    impl HealthChecker for NeverHealthy {
        async fn check_health(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn probe_succeeds_immediately_when_healthy() {
        let state = StateMachine::new("m1".into(), Arc::new(EventBus::new()));
        state.cas(ProcessState::Stopped, ProcessState::Starting).await.unwrap();
        let ctx = Context::new();
        let mut checker = MockChecker::new();
        checker.expect_check_health().times(1).returning(|| true);
        let outcome = run_health_probe(&ctx, &state, &checker, Duration::from_secs(15))
            .await
            .unwrap();
        assert!(matches!(outcome, ProbeOutcome::Ready));
    }

    #[tokio::test]
    async fn probe_retries_until_healthy() {
        let state = StateMachine::new("m1".into(), Arc::new(EventBus::new()));
        state.cas(ProcessState::Stopped, ProcessState::Starting).await.unwrap();
        let ctx = Context::new();
        let mut checker = MockChecker::new();
        let mut call = 0;
        checker.expect_check_health().times(3).returning(move || {
            call += 1;
            call == 3
        });
        let outcome = run_health_probe(&ctx, &state, &checker, Duration::from_secs(15))
            .await
            .unwrap();
        assert!(matches!(outcome, ProbeOutcome::Ready));
    }

    #[tokio::test]
    async fn probe_cancels_when_state_leaves_starting() {
        let state = StateMachine::new("m1".into(), Arc::new(EventBus::new()));
        state.cas(ProcessState::Stopped, ProcessState::Starting).await.unwrap();
        state.force_shutdown().await;
        let ctx = Context::new();
        let outcome = run_health_probe(&ctx, &state, &NeverHealthy, Duration::from_secs(15))
            .await
            .unwrap();
        assert!(matches!(outcome, ProbeOutcome::Cancelled));
    }

    #[tokio::test]
    async fn probe_cancels_on_context_cancellation() {
        let state = StateMachine::new("m1".into(), Arc::new(EventBus::new()));
        state.cas(ProcessState::Stopped, ProcessState::Starting).await.unwrap();
        let ctx = Context::new();
        ctx.cancel();
        let outcome = run_health_probe(&ctx, &state, &NeverHealthy, Duration::from_secs(15))
            .await
            .unwrap();
        assert!(matches!(outcome, ProbeOutcome::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_monitor_fires_after_idle_period_with_no_in_flight() {
        let idleness = Arc::new(Idleness::new());
        let ctx = Context::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let idleness_clone = idleness.clone();
        let ctx_clone = ctx.clone();
        let handle = tokio::spawn(async move {
            run_ttl_monitor(&ctx_clone, &idleness_clone, Duration::from_secs(2), || {
                let fired_clone = fired_clone.clone();
                async move {
                    fired_clone.store(true, Ordering::SeqCst);
                }
            })
            .await;
        });
        tokio::time::advance(Duration::from_secs(3)).await;
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn ttl_monitor_does_nothing_when_ttl_is_zero() {
        let idleness = Idleness::new();
        let ctx = Context::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        run_ttl_monitor(&ctx, &idleness, Duration::ZERO, || {
            let fired_clone = fired_clone.clone();
            async move {
                fired_clone.store(true, Ordering::SeqCst);
            }
        })
        .await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
