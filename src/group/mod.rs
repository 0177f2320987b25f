//! `ProcessGroup`: a set of Processes sharing a swap domain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{HttpRequest, HttpResponse};
use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;

use crate::error::ProxyError;
use crate::process::{Process, StopStrategy};

const VICTIM_STOP_WAIT: Duration = Duration::from_secs(30);

pub struct GroupConfig {
    pub id: String,
    pub swap: bool,
    pub exclusive: bool,
    pub persistent: bool,
    pub resource_tag: Option<String>,
}

/// Bookkeeping protected by `ProcessGroup.mutex`: exactly `lastUsedProcess`
/// and nothing else, per the lock table — never the members map (immutable
/// after construction) and never anything that would require holding the
/// lock across a `Stop` or `ProxyRequest` call.
struct Bookkeeping {
    last_used_process: Option<String>,
}

pub struct ProcessGroup {
    pub config: GroupConfig,
    members: HashMap<String, Arc<Process>>,
    aliases: HashMap<String, String>,
    bookkeeping: AsyncMutex<Bookkeeping>,
}

impl ProcessGroup {
    pub fn new(
        config: GroupConfig,
        members: HashMap<String, Arc<Process>>,
        aliases: HashMap<String, String>,
    ) -> Self {
        Self {
            config,
            members,
            aliases,
            bookkeeping: AsyncMutex::new(Bookkeeping { last_used_process: None }),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// `HasMember(name)`: membership query including alias resolution.
    pub fn has_member(&self, name: &str) -> bool {
        self.members.contains_key(name) || self.aliases.contains_key(name)
    }

    pub fn canonical_id(&self, name: &str) -> Option<&str> {
        if self.members.contains_key(name) {
            Some(name)
        } else {
            self.aliases.get(name).map(String::as_str)
        }
    }

    pub fn member(&self, model_id: &str) -> Option<&Arc<Process>> {
        self.members.get(model_id)
    }

    pub fn member_ids(&self) -> impl Iterator<Item = &str> {
        self.members.keys().map(String::as_str)
    }

    /// `ProxyRequest(modelId, w, r)`: applies the swap coordination
    /// algorithm (§4.2) then forwards lock-free.
    pub async fn proxy_request(
        &self,
        model_id: &str,
        req: &HttpRequest,
        body: Bytes,
    ) -> Result<HttpResponse, ProxyError> {
        let target = self.activate_member(model_id).await?;
        target.forward(req, body).await
    }

    /// Swap-coordinates and drives `model_id` to `Ready`, returning the
    /// member once it is. Split out from `proxy_request` so a caller holding
    /// a cross-group exclusivity permit can release it as soon as this
    /// resolves, instead of across the forwarded request too (§4.5).
    pub async fn activate_member(&self, model_id: &str) -> Result<Arc<Process>, ProxyError> {
        let target = self
            .members
            .get(model_id)
            .ok_or_else(|| ProxyError::NotFound { model_name: model_id.to_string() })?
            .clone();

        if self.config.swap {
            self.coordinate_swap(model_id).await;
        }

        target.ensure_ready().await?;
        Ok(target)
    }

    /// Swap coordination: under the mutex, read+set `lastUsedProcess` and
    /// capture the victim; release the mutex; stop the victim and wait for
    /// it to reach `Stopped` outside the lock. Concurrent callers racing for
    /// the same `modelId` converge once the winner has updated
    /// `lastUsedProcess`.
    async fn coordinate_swap(&self, model_id: &str) {
        let victim_id = {
            let mut book = self.bookkeeping.lock().await;
            let victim = match &book.last_used_process {
                Some(current) if current != model_id => Some(current.clone()),
                _ => None,
            };
            book.last_used_process = Some(model_id.to_string());
            victim
        };

        let Some(victim_id) = victim_id else { return };
        let Some(victim) = self.members.get(&victim_id) else { return };

        victim.stop(StopStrategy::Graceful).await;
        if !matches!(
            victim.current_state(),
            crate::process::state::ProcessState::Stopped | crate::process::state::ProcessState::Shutdown
        ) {
            let deadline = tokio::time::Instant::now() + VICTIM_STOP_WAIT;
            while tokio::time::Instant::now() < deadline {
                if matches!(
                    victim.current_state(),
                    crate::process::state::ProcessState::Stopped | crate::process::state::ProcessState::Shutdown
                ) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            if !matches!(victim.current_state(), crate::process::state::ProcessState::Stopped) {
                victim.stop(StopStrategy::Immediate).await;
            }
        }
    }

    pub async fn stop_member(&self, model_id: &str, strategy: StopStrategy) -> Result<(), ProxyError> {
        let member = self
            .members
            .get(model_id)
            .ok_or_else(|| ProxyError::NotFound { model_name: model_id.to_string() })?;
        member.stop(strategy).await;
        Ok(())
    }

    pub async fn stop_all(&self, strategy: StopStrategy) {
        for member in self.members.values() {
            member.stop(strategy).await;
        }
    }

    /// `Shutdown()`: drive all members to `Shutdown`.
    pub async fn shutdown(&self) {
        for member in self.members.values() {
            member.shutdown().await;
        }
    }
}
