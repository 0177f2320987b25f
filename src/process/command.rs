//! Spawning the child command and capturing its stdout/stderr.
//!
//! The spawn itself and the graceful/kill escalation are modeled on the
//! typestate command wrapper and `ProcessTerminator` found in
//! process-supervision code; stdout/stderr capture uses the same
//! dedicated-thread-plus-channel shape as that code's logging thread, since
//! `std::process::Child`'s pipes are synchronous and have no async analogue
//! without an extra dependency the teacher doesn't carry.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ModelConfig;
use crate::event::{Event, EventBus, LogSource};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn command: {0}")]
    Io(#[from] std::io::Error),
}

/// A spawned child, owned exclusively by the `Process` that started it.
pub struct SpawnedChild {
    pub child: tokio::process::Child,
    pub pid: u32,
}

/// Spawns `model.cmd` with `model.env` applied and stdout/stderr piped. Each
/// output stream gets its own blocking reader thread that forwards completed
/// lines as `LogData` events (the "last N kilobytes per Process" ring buffer
/// named by the resource policy is the excluded log-history collaborator's
/// storage; this thread is the producer it would consume from).
pub fn spawn(model_id: &str, model: &ModelConfig, events: Arc<EventBus>) -> Result<SpawnedChild, SpawnError> {
    let mut command = Command::new(&model.cmd[0]);
    command.args(&model.cmd[1..]);
    for (key, value) in &model.env {
        command.env(key, value);
    }
    if let Some(dir) = &model.working_dir {
        command.current_dir(dir);
    }
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());

    let mut tokio_command: tokio::process::Command = command.into();
    let mut child = tokio_command.spawn()?;
    let pid = child.id().unwrap_or(0);

    if let Some(stdout) = child.stdout.take() {
        if let Ok(std_stdout) = stdout.try_into_std() {
            spawn_log_reader(model_id.to_string(), std_stdout, events.clone());
        }
    }
    if let Some(stderr) = child.stderr.take() {
        if let Ok(std_stderr) = stderr.try_into_std() {
            spawn_log_reader(model_id.to_string(), std_stderr, events);
        }
    }

    Ok(SpawnedChild { child, pid })
}

fn spawn_log_reader<R>(model_id: String, reader: R, events: Arc<EventBus>)
where
    R: std::io::Read + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("swapgate-log-{model_id}"))
        .spawn(move || {
            let buffered = BufReader::new(reader);
            for line in buffered.lines() {
                match line {
                    Ok(text) => {
                        events.publish(Event::LogData {
                            source: LogSource::Upstream,
                            chunk: text,
                        });
                    }
                    Err(_) => break,
                }
            }
        })
        .expect("spawning a log reader thread should not fail under normal resource limits");
}

pub const CHILD_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn model(cmd: Vec<&str>) -> ModelConfig {
        ModelConfig {
            cmd: cmd.into_iter().map(String::from).collect(),
            cmd_stop: None,
            env: HashMap::new(),
            working_dir: None,
            proxy: "http://127.0.0.1:0".to_string(),
            health_check_url: "http://127.0.0.1:0/healthz".to_string(),
            ttl_secs: 0,
            use_model_name: None,
            aliases: vec![],
            concurrency_limit: None,
            unlisted: false,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn spawns_and_captures_stdout() {
        let events = Arc::new(EventBus::new());
        let mut sub = events.subscribe(crate::event::Topic::Logs);
        let cfg = model(vec!["/bin/echo", "hello-from-child"]);
        let mut spawned = spawn("m1", &cfg, events.clone()).expect("spawn should succeed");
        let status = spawned.child.wait().await.expect("wait should succeed");
        assert!(status.success());
        let event = tokio::time::timeout(Duration::from_millis(500), sub.recv())
            .await
            .expect("log line should arrive")
            .expect("subscription should still be open");
        match event {
            Event::LogData { chunk, .. } => assert_eq!(chunk, "hello-from-child"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_io_error() {
        let events = Arc::new(EventBus::new());
        let cfg = model(vec!["/no/such/binary-swapgate-test"]);
        let result = spawn("m1", &cfg, events);
        assert!(matches!(result, Err(SpawnError::Io(_))));
    }
}
