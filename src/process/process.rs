//! `Process`: one child backend — spawn, health-probe, reverse-proxy, stop.

use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;

use crate::config::ModelConfig;
use crate::context::Context;
use crate::error::{ProxyError, StartFailure};
use crate::event::EventBus;
use crate::process::command::{self, SpawnedChild, CHILD_WAIT_POLL_INTERVAL};
use crate::process::health::{HealthChecker, HttpHealthChecker};
use crate::process::monitor::{self, Idleness, ProbeOutcome};
use crate::process::state::{ProcessState, StateMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopStrategy {
    Graceful,
    Immediate,
}

pub const DEFAULT_GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything about a Process that does not change after construction.
pub struct ProcessConfig {
    pub model_id: String,
    pub model: ModelConfig,
    pub health_check_timeout: Duration,
    pub graceful_stop_timeout: Duration,
    /// Mirrors the owning group's `persistent` flag: a persistent group's
    /// members are exempt from TTL eviction regardless of `ttl_secs`.
    pub persistent: bool,
    /// Headers stripped before forwarding, in addition to `Authorization`
    /// and the hop-by-hop set (§4.3 step 5).
    pub sensitive_headers: Vec<String>,
}

struct Runtime {
    child: Option<SpawnedChild>,
    /// Cancellation scope for the current start attempt's probe, child-wait
    /// supervisor, and TTL monitor. Replaced on every `Stopped -> Starting`
    /// transition; cancelling it tears down exactly the tasks born from that
    /// one start, never a sibling Process's tasks.
    run_ctx: Option<Context>,
}

/// One backend. Owned exclusively by its `ProcessGroup`; holds a back
/// reference to itself only as a `Weak` handle so its own long-lived tasks
/// can call back into its public methods — never an ownership edge to the
/// `ProcessGroup`, per the no-cycles design note.
pub struct Process {
    config: ProcessConfig,
    state: Arc<StateMachine>,
    idleness: Arc<Idleness>,
    events: Arc<EventBus>,
    http_client: reqwest::Client,
    runtime: AsyncMutex<Runtime>,
    self_weak: OnceLock<Weak<Process>>,
}

impl Process {
    pub fn new(config: ProcessConfig, events: Arc<EventBus>) -> Arc<Self> {
        let state = Arc::new(StateMachine::new(config.model_id.clone(), events.clone()));
        let process = Arc::new(Self {
            config,
            state,
            idleness: Arc::new(Idleness::new()),
            events,
            http_client: reqwest::Client::new(),
            runtime: AsyncMutex::new(Runtime { child: None, run_ctx: None }),
            self_weak: OnceLock::new(),
        });
        let _ = process.self_weak.set(Arc::downgrade(&process));
        process
    }

    fn self_arc(&self) -> Arc<Process> {
        self.self_weak
            .get()
            .and_then(Weak::upgrade)
            .expect("Process must be constructed through Process::new")
    }

    pub fn id(&self) -> &str {
        &self.config.model_id
    }

    pub fn current_state(&self) -> ProcessState {
        self.state.current()
    }

    /// `ProxyRequest(w, r)`: ensure Ready, forward, track in-flight/lastUsed.
    /// Convenience wrapper over [`ensure_ready`]/[`forward`] for callers that
    /// have no exclusivity permit to release in between the two.
    pub async fn proxy_request(&self, req: &HttpRequest, body: Bytes) -> Result<HttpResponse, ProxyError> {
        self.ensure_ready().await?;
        self.forward(req, body).await
    }

    /// The forwarding half of `ProxyRequest`, assuming the caller has
    /// already driven this Process to `Ready` (via [`ensure_ready`]). Split
    /// out so a caller holding a cross-group exclusivity permit can release
    /// it the moment `ensure_ready` resolves, rather than holding it across
    /// the full forwarded request/response, which may stream for as long as
    /// a chat completion runs (§4.5).
    pub async fn forward(&self, req: &HttpRequest, body: Bytes) -> Result<HttpResponse, ProxyError> {
        self.idleness.enter();
        let result = crate::process::proxy::forward(
            &self.http_client,
            &self.config.model.proxy,
            req,
            &self.config.sensitive_headers,
            body,
        )
        .await;
        self.idleness.leave();

        result.map_err(|err| match err {
            ProxyError::UpstreamUnreachable { source, .. } => ProxyError::UpstreamUnreachable {
                model_id: self.config.model_id.clone(),
                source,
            },
            other => other,
        })
    }

    /// `EnsureReady()`: drives the Process through start-and-probe if it is
    /// not already `Ready`, returning once it either reaches `Ready` or the
    /// attempt fails. Public so a `ProcessGroup` can release an exclusivity
    /// permit right after this resolves, before forwarding the request body.
    pub async fn ensure_ready(&self) -> Result<(), ProxyError> {
        loop {
            match self.state.current() {
                ProcessState::Ready => return Ok(()),
                ProcessState::Stopping => {
                    return Err(ProxyError::Stopping { model_id: self.config.model_id.clone() })
                }
                ProcessState::Shutdown => {
                    return Err(ProxyError::Shutdown { model_id: self.config.model_id.clone() })
                }
                ProcessState::Starting => {
                    // Another caller is already driving start-and-probe;
                    // poll rather than racing a second CAS attempt.
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                ProcessState::Stopped => match self.state.cas(ProcessState::Stopped, ProcessState::Starting).await {
                    Ok(_) => return self.start_and_probe().await,
                    Err(_) => continue, // lost the race; re-check current state
                },
            }
        }
    }

    /// The start-and-probe algorithm (§4.1), steps 2-5. The caller has
    /// already won the `Stopped -> Starting` CAS (step 1).
    async fn start_and_probe(&self) -> Result<(), ProxyError> {
        let spawned = match command::spawn(&self.config.model_id, &self.config.model, self.events.clone()) {
            Ok(spawned) => spawned,
            Err(source) => {
                self.state.cas(ProcessState::Starting, ProcessState::Stopped).await.ok();
                return Err(ProxyError::StartFailed {
                    model_id: self.config.model_id.clone(),
                    source: StartFailure::Spawn(std::io::Error::other(source)),
                });
            }
        };

        let run_ctx = Context::new();
        {
            let mut runtime = self.runtime.lock().await;
            runtime.run_ctx = Some(run_ctx.clone());
            runtime.child = Some(spawned);
        }

        self.spawn_child_wait_supervisor(run_ctx.clone());

        let checker = HttpHealthChecker::new(self.config.model.health_check_url.clone());
        let outcome =
            monitor::run_health_probe(&run_ctx, &self.state, &checker, self.config.health_check_timeout).await;

        match outcome {
            Ok(ProbeOutcome::Ready) => match self.state.cas(ProcessState::Starting, ProcessState::Ready).await {
                Ok(_) => {
                    self.idleness.touch();
                    self.spawn_ttl_monitor(run_ctx);
                    Ok(())
                }
                Err(_) => Err(ProxyError::StartFailed {
                    model_id: self.config.model_id.clone(),
                    source: StartFailure::EarlyExit("state changed while committing health probe success".into()),
                }),
            },
            Ok(ProbeOutcome::Cancelled) => Err(ProxyError::StartFailed {
                model_id: self.config.model_id.clone(),
                source: StartFailure::EarlyExit("start was cancelled before becoming healthy".into()),
            }),
            Err(ProxyError::HealthTimeout { timeout_secs, .. }) => {
                self.stop(StopStrategy::Immediate).await;
                Err(ProxyError::HealthTimeout { model_id: self.config.model_id.clone(), timeout_secs })
            }
            Err(other) => Err(other),
        }
    }

    /// Supervisor task (step 3): polls the child non-blockingly so it never
    /// holds exclusive ownership of the child handle across a long wait,
    /// which would conflict with `terminate_child`'s own need to reap it.
    /// On exit while `Starting`/`Ready`, CASes to `Stopped`.
    fn spawn_child_wait_supervisor(&self, ctx: Context) {
        let process = self.self_arc();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    _ = tokio::time::sleep(CHILD_WAIT_POLL_INTERVAL) => {}
                }
                let exited = {
                    let mut runtime = process.runtime.lock().await;
                    match runtime.child.as_mut() {
                        Some(spawned) => matches!(spawned.child.try_wait(), Ok(Some(_))),
                        None => return, // already reaped by an explicit stop
                    }
                };
                if exited {
                    let current = process.state.current();
                    if matches!(current, ProcessState::Starting | ProcessState::Ready) {
                        if current == ProcessState::Ready {
                            process.state.cas(ProcessState::Ready, ProcessState::Stopping).await.ok();
                            process.state.cas(ProcessState::Stopping, ProcessState::Stopped).await.ok();
                        } else {
                            process.state.cas(ProcessState::Starting, ProcessState::Stopped).await.ok();
                        }
                    }
                    process.runtime.lock().await.child = None;
                    ctx.cancel();
                    return;
                }
            }
        });
    }

    /// TTL monitor (§4.1 TTL eviction): bound to the same per-start context
    /// as the probe and child-wait supervisor so it cannot outlive this
    /// Process's current run.
    fn spawn_ttl_monitor(&self, ctx: Context) {
        if self.config.persistent {
            return;
        }
        let ttl = Duration::from_secs(self.config.model.ttl_secs);
        if ttl.is_zero() {
            return;
        }
        let process = self.self_arc();
        let idleness = self.idleness.clone();
        tokio::spawn(async move {
            monitor::run_ttl_monitor(&ctx, &idleness, ttl, || {
                let process = process.clone();
                async move {
                    process.stop(StopStrategy::Graceful).await;
                }
            })
            .await;
        });
    }

    /// `Stop(strategy)`. Idempotent on `Stopped`/`Shutdown`.
    pub async fn stop(&self, strategy: StopStrategy) {
        let current = self.state.current();
        if matches!(current, ProcessState::Stopped | ProcessState::Shutdown) {
            return;
        }

        if current == ProcessState::Ready {
            if self.state.cas(ProcessState::Ready, ProcessState::Stopping).await.is_err() {
                return;
            }
        }
        // `Starting`: cancelling run_ctx below drives the probe/supervisor
        // to exit; they do not themselves commit a transition out of
        // Starting in that case, so we commit it here uniformly.

        if let Some(ctx) = self.runtime.lock().await.run_ctx.take() {
            ctx.cancel();
        }

        self.terminate_child(strategy).await;

        let current = self.state.current();
        if matches!(current, ProcessState::Starting | ProcessState::Stopping) {
            self.state.cas(current, ProcessState::Stopped).await.ok();
        }
    }

    async fn terminate_child(&self, strategy: StopStrategy) {
        let mut runtime = self.runtime.lock().await;
        let Some(spawned) = runtime.child.as_mut() else { return };

        if strategy == StopStrategy::Graceful {
            if let Some(cmd_stop) = &self.config.model.cmd_stop {
                let _ = run_cmd_stop(cmd_stop).await;
            } else {
                send_graceful_signal(spawned.pid);
            }
            let waited = tokio::time::timeout(self.config.graceful_stop_timeout, spawned.child.wait()).await;
            if waited.is_ok() {
                runtime.child = None;
                return;
            }
        }
        let _ = spawned.child.start_kill();
        let _ = spawned.child.wait().await;
        runtime.child = None;
    }

    /// `Shutdown()`: as `Stop(Immediate)` but terminal; cannot be restarted.
    pub async fn shutdown(&self) {
        if let Some(ctx) = self.runtime.lock().await.run_ctx.take() {
            ctx.cancel();
        }
        self.terminate_child(StopStrategy::Immediate).await;
        self.state.force_shutdown().await;
    }
}

async fn run_cmd_stop(argv: &[String]) -> std::io::Result<()> {
    if argv.is_empty() {
        return Ok(());
    }
    let mut command = tokio::process::Command::new(&argv[0]);
    command.args(&argv[1..]);
    command.status().await.map(|_| ())
}

#[cfg(target_family = "unix")]
fn send_graceful_signal(pid: u32) {
    let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), nix::sys::signal::Signal::SIGTERM);
}

#[cfg(not(target_family = "unix"))]
fn send_graceful_signal(_pid: u32) {
    // No SIGTERM equivalent is reachable without extra platform crates;
    // immediate kill is the only escalation step on this target.
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(model_id: &str, cmd: Vec<&str>, ttl_secs: u64) -> ProcessConfig {
        ProcessConfig {
            model_id: model_id.to_string(),
            model: ModelConfig {
                cmd: cmd.into_iter().map(String::from).collect(),
                cmd_stop: None,
                env: HashMap::new(),
                working_dir: None,
                proxy: "http://127.0.0.1:1".to_string(),
                health_check_url: "http://127.0.0.1:1/healthz".to_string(),
                ttl_secs,
                use_model_name: None,
                aliases: vec![],
                concurrency_limit: None,
                unlisted: false,
                metadata: HashMap::new(),
            },
            health_check_timeout: Duration::from_secs(15),
            graceful_stop_timeout: Duration::from_millis(200),
            persistent: false,
            sensitive_headers: vec![],
        }
    }

    #[tokio::test]
    async fn stop_on_already_stopped_process_is_a_no_op() {
        let process = Process::new(config("m1", vec!["/bin/true"], 0), Arc::new(EventBus::new()));
        assert_eq!(process.current_state(), ProcessState::Stopped);
        process.stop(StopStrategy::Graceful).await;
        assert_eq!(process.current_state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_is_terminal_and_stop_after_is_a_no_op() {
        let process = Process::new(config("m1", vec!["/bin/true"], 0), Arc::new(EventBus::new()));
        process.shutdown().await;
        assert_eq!(process.current_state(), ProcessState::Shutdown);
        process.stop(StopStrategy::Graceful).await;
        assert_eq!(process.current_state(), ProcessState::Shutdown);
    }

    #[tokio::test]
    async fn start_failure_leaves_process_stopped_not_starting() {
        let process = Process::new(config("m3", vec!["/no/such/binary-swapgate"], 0), Arc::new(EventBus::new()));
        let result = process.ensure_ready().await;
        assert!(result.is_err());
        assert_eq!(process.current_state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn child_exit_during_starting_is_observed_as_stopped() {
        // `/bin/false` exits immediately and non-zero, and the health URL is
        // unreachable, so start_and_probe should fail with the child already
        // gone by the time the child-wait supervisor's poll catches it.
        let process = Process::new(config("m3", vec!["/bin/false"], 0), Arc::new(EventBus::new()));
        let result = process.ensure_ready().await;
        assert!(result.is_err());
        assert_ne!(process.current_state(), ProcessState::Starting);
    }

    #[tokio::test]
    async fn proxy_request_strips_sensitive_headers_through_the_real_pipeline() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/")
                .matches(|req| !req.headers.iter().flatten().any(|(k, _)| k.eq_ignore_ascii_case("x-internal-token")))
                .header_exists("content-type");
            then.status(200).body("ok");
        });

        let mut cfg = config("m5", vec!["/bin/true"], 0);
        cfg.model.proxy = server.base_url();
        cfg.sensitive_headers = vec!["X-Internal-Token".to_string()];
        let process = Process::new(cfg, Arc::new(EventBus::new()));

        // Drive the state machine straight to Ready without spawning a real
        // child, so only the forwarding half of the pipeline is exercised.
        process.state.cas(ProcessState::Stopped, ProcessState::Starting).await.unwrap();
        process.state.cas(ProcessState::Starting, ProcessState::Ready).await.unwrap();

        let req = actix_web::test::TestRequest::default()
            .insert_header(("X-Internal-Token", "also-secret"))
            .insert_header(("Content-Type", "application/json"))
            .to_http_request();
        let response = process.proxy_request(&req, Bytes::new()).await.unwrap();
        assert_eq!(response.status(), actix_web::http::StatusCode::OK);
        mock.assert();
    }

    #[tokio::test]
    async fn persistent_process_does_not_spawn_ttl_monitor() {
        let mut cfg = config("m4", vec!["/bin/true"], 1);
        cfg.persistent = true;
        let process = Process::new(cfg, Arc::new(EventBus::new()));
        // spawn_ttl_monitor returns immediately for a persistent config; this
        // exercises that path directly rather than via a full start_and_probe.
        process.spawn_ttl_monitor(Context::new());
    }
}
