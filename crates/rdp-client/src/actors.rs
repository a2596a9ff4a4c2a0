//! Execution actor discovery and caching.
//!
//! Code runs through a console actor belonging to the application's main
//! process or main window. Discovery tries the parent process first and falls
//! back to the tab list. The result is cached until its TTL lapses or the
//! [`ActorGeneration`] moves on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::bridge::protocol::{ActorId, ROOT_ACTOR, TargetInfo};
use crate::bridge::session::Requester;
use crate::error::{ClientError, Result};
use crate::retry::FailureClass;

/// Counter bumped whenever cached actors stop being trustworthy.
///
/// Shared between the session loop, which bumps it on invalidating events,
/// and the cache, which compares it against the value seen at resolution time.
#[derive(Debug, Clone, Default)]
pub struct ActorGeneration(Arc<AtomicU64>);

impl ActorGeneration {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryPath {
    Process,
    Tab,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedActor {
    pub actor: ActorId,
    pub target: Option<TargetInfo>,
    pub via: DiscoveryPath,
}

#[derive(Debug)]
struct CachedActor {
    resolved: ResolvedActor,
    cached_at: Instant,
    generation: u64,
}

#[derive(Debug)]
pub struct ActorCache {
    entry: Option<CachedActor>,
    ttl: Duration,
    generation: ActorGeneration,
}

impl ActorCache {
    pub fn new(ttl: Duration, generation: ActorGeneration) -> Self {
        Self {
            entry: None,
            ttl,
            generation,
        }
    }

    /// The cached actor if it is still within its TTL and no invalidation
    /// happened since it was stored. A stale entry is dropped.
    pub fn fresh(&mut self, now: Instant) -> Option<ResolvedActor> {
        let entry = self.entry.as_ref()?;
        let age = now.saturating_duration_since(entry.cached_at);
        let current = self.generation.current();

        if age >= self.ttl {
            tracing::debug!(actor = %entry.resolved.actor, ?age, "Cached actor expired");
        } else if entry.generation != current {
            tracing::debug!(actor = %entry.resolved.actor, "Cached actor invalidated");
        } else {
            return Some(entry.resolved.clone());
        }
        self.entry = None;
        None
    }

    /// Store a freshly resolved actor. `generation` must be read before
    /// discovery started, so that an invalidation racing the discovery
    /// leaves the entry stale.
    pub fn store(&mut self, resolved: ResolvedActor, now: Instant, generation: u64) {
        tracing::debug!(actor = %resolved.actor, via = ?resolved.via, "Caching execution actor");
        self.entry = Some(CachedActor {
            resolved,
            cached_at: now,
            generation,
        });
    }

    /// Returns whether anything was cached.
    pub fn clear(&mut self) -> bool {
        self.entry.take().is_some()
    }

    /// Cached entry regardless of freshness.
    pub fn peek(&self) -> Option<&ResolvedActor> {
        self.entry.as_ref().map(|e| &e.resolved)
    }

    pub fn cached_at(&self) -> Option<Instant> {
        self.entry.as_ref().map(|e| e.cached_at)
    }

    pub fn generation(&self) -> &ActorGeneration {
        &self.generation
    }
}

/// Which tab counts as the application's main window.
///
/// Tried in order: URL prefix, title substring, first tab.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSelector {
    pub url_prefix: Option<String>,
    pub title_contains: Option<String>,
}

impl TargetSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(prefix.into());
        self
    }

    pub fn with_title_contains(mut self, text: impl Into<String>) -> Self {
        self.title_contains = Some(text.into());
        self
    }

    pub fn select_tab<'a>(&self, tabs: &'a [Value]) -> Option<&'a Value> {
        let field = |tab: &'a Value, key: &str| tab.get(key).and_then(Value::as_str);

        if let Some(prefix) = &self.url_prefix
            && let Some(tab) = tabs
                .iter()
                .find(|t| field(*t, "url").is_some_and(|u| u.starts_with(prefix.as_str())))
        {
            return Some(tab);
        }
        if let Some(text) = &self.title_contains
            && let Some(tab) = tabs
                .iter()
                .find(|t| field(*t, "title").is_some_and(|u| u.contains(text.as_str())))
        {
            return Some(tab);
        }
        tabs.first()
    }
}

fn str_field<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

/// Resolve an execution actor, process path first.
///
/// Connection failures abort immediately so the retry wrapper can reconnect;
/// anything else moves on to the next path.
pub async fn discover(requester: &dyn Requester, selector: &TargetSelector) -> Result<ResolvedActor> {
    let process_err = match via_process(requester).await {
        Ok(resolved) => return Ok(resolved),
        Err(e) if e.class() == FailureClass::Connection => return Err(e),
        Err(e) => e,
    };
    tracing::debug!(error = %process_err, "Process discovery failed, trying tabs");

    let tab_err = match via_tabs(requester, selector).await {
        Ok(resolved) => return Ok(resolved),
        Err(e) if e.class() == FailureClass::Connection => return Err(e),
        Err(e) => e,
    };
    tracing::warn!(process_path = %process_err, tab_path = %tab_err, "No execution actor found");

    Err(ClientError::Resolution {
        process_path: process_err.to_string(),
        tab_path: tab_err.to_string(),
    })
}

async fn via_process(requester: &dyn Requester) -> Result<ResolvedActor> {
    let reply = requester
        .request(ROOT_ACTOR, "listProcesses", Value::Null)
        .await?;
    let processes = reply
        .get("processes")
        .and_then(Value::as_array)
        .ok_or_else(|| ClientError::malformed(ROOT_ACTOR, "listProcesses reply has no processes"))?;

    let parent = processes
        .iter()
        .find(|p| p.get("isParent").and_then(Value::as_bool).unwrap_or(false))
        .ok_or_else(|| ClientError::malformed(ROOT_ACTOR, "no parent process listed"))?;
    let descriptor = str_field(parent, "/actor")
        .ok_or_else(|| ClientError::malformed(ROOT_ACTOR, "parent process has no actor"))?;

    let target = requester
        .request(descriptor, "getTarget", Value::Null)
        .await?;
    let console = str_field(&target, "/process/consoleActor").ok_or_else(|| {
        ClientError::malformed(descriptor, "getTarget reply has no process.consoleActor")
    })?;

    Ok(ResolvedActor {
        actor: ActorId::from(console),
        target: target.get("process").map(TargetInfo::from_descriptor),
        via: DiscoveryPath::Process,
    })
}

async fn via_tabs(requester: &dyn Requester, selector: &TargetSelector) -> Result<ResolvedActor> {
    let reply = requester.request(ROOT_ACTOR, "listTabs", Value::Null).await?;
    let tabs = reply
        .get("tabs")
        .and_then(Value::as_array)
        .ok_or_else(|| ClientError::malformed(ROOT_ACTOR, "listTabs reply has no tabs"))?;
    let tab = selector
        .select_tab(tabs)
        .ok_or_else(|| ClientError::malformed(ROOT_ACTOR, "listTabs returned no tabs"))?;

    let resolved = |console: &str| ResolvedActor {
        actor: ActorId::from(console),
        target: Some(TargetInfo::from_descriptor(tab)),
        via: DiscoveryPath::Tab,
    };

    if let Some(console) = str_field(tab, "/consoleActor") {
        return Ok(resolved(console));
    }

    let tab_actor = str_field(tab, "/actor")
        .ok_or_else(|| ClientError::malformed(ROOT_ACTOR, "selected tab has no actor"))?;

    match requester.request(tab_actor, "getTarget", Value::Null).await {
        Ok(reply) => {
            if let Some(console) = str_field(&reply, "/frame/consoleActor") {
                return Ok(resolved(console));
            }
            tracing::debug!(%tab_actor, "getTarget reply has no frame.consoleActor");
        }
        Err(e) if e.class() == FailureClass::Connection => return Err(e),
        Err(e) => tracing::debug!(%tab_actor, error = %e, "getTarget failed, attaching"),
    }

    let reply = requester.request(tab_actor, "attach", Value::Null).await?;
    str_field(&reply, "/consoleActor")
        .map(resolved)
        .ok_or_else(|| ClientError::malformed(tab_actor, "attach reply has no consoleActor"))
}
