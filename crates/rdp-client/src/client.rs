//! Connection and retry engine.
//!
//! [`RdpClient`] is a cheap, cloneable handle. It owns at most one
//! [`Session`] at a time plus the actor cache, both behind a single async
//! mutex. Reconnecting replaces the session wholesale; anything in flight on
//! the old one is rejected, never resumed.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::actors::{self, ActorCache, ResolvedActor};
use crate::bridge::protocol::{ActorId, EvaluationReply, ROOT_ACTOR, RootInfo, TargetInfo};
use crate::bridge::session::{Requester, Session, SessionHandle, SessionShared};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::{ClientEvent, InvalidationReason};
use crate::grip::{self, RemoteValue};
use crate::retry::{FailureClass, FailureCounter};
use crate::status::{CLIENT_VERSION, ClientStatus, LinkPhase, LinkStatus};

/// Message types requested by [`RdpClient::console_messages`] when none are given.
pub const DEFAULT_MESSAGE_TYPES: &[&str] = &["PageError", "ConsoleAPI"];

/// Outcome of evaluating a script.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub result: RemoteValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exception_message: Option<String>,
}

impl Evaluation {
    pub fn is_exception(&self) -> bool {
        self.exception.is_some()
    }
}

struct ConnectionState {
    session: Option<Session>,
    root: Option<RootInfo>,
    actors: ActorCache,
    /// Set by connect/reconnect, cleared by disconnect. Keepalive only
    /// revives links the caller wants up.
    wanted: bool,
}

impl ConnectionState {
    fn live_handle(&self) -> Option<SessionHandle> {
        self.session
            .as_ref()
            .map(Session::handle)
            .filter(|h| !h.is_closed())
            .cloned()
    }
}

struct Inner {
    config: ClientConfig,
    shared: SessionShared,
    state: Mutex<ConnectionState>,
    failures: FailureCounter,
    next_session: AtomicU64,
    keepalive: CancellationToken,
    keepalive_started: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.keepalive.cancel();
        if let Some(session) = self.state.get_mut().session.take() {
            session.shutdown();
        }
    }
}

#[derive(Clone)]
pub struct RdpClient {
    inner: Arc<Inner>,
}

impl RdpClient {
    pub fn new(config: ClientConfig) -> Self {
        let shared = SessionShared::new();
        let actors = ActorCache::new(config.actor_ttl, shared.generation.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                shared,
                state: Mutex::new(ConnectionState {
                    session: None,
                    root: None,
                    actors,
                    wanted: false,
                }),
                failures: FailureCounter::default(),
                next_session: AtomicU64::new(0),
                keepalive: CancellationToken::new(),
                keepalive_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Open a session if none is live. Completes once the intro arrived.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.wanted = true;
        if state.live_handle().is_some() {
            return Ok(());
        }
        self.open_session(&mut state).await?;
        drop(state);
        self.spawn_keepalive();
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut state = self.inner.state.lock().await;
        state.wanted = false;
        self.teardown(&mut state, InvalidationReason::Disconnect).await;
    }

    /// Drop the current session and dial again, with backoff between
    /// attempts.
    pub async fn reconnect(&self) -> Result<()> {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock().await;
        state.wanted = true;
        self.teardown(&mut state, InvalidationReason::Reconnect).await;

        let attempts = config.max_reconnect_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            let delay = if attempt == 1 {
                config.reconnect_delay
            } else {
                config.retry.connection_backoff(attempt - 1)
            };
            tracing::info!(attempt, ?delay, "Reconnecting");
            self.emit(ClientEvent::Reconnecting { attempt, delay });
            tokio::time::sleep(delay).await;

            match self.open_session(&mut state).await {
                Ok(()) => {
                    drop(state);
                    self.spawn_keepalive();
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(ClientError::not_connected))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.shared.phase() == LinkPhase::Ready
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.shared.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.shared.status.subscribe()
    }

    /// Handle to the live session, for callers that need raw [`Requester`] access.
    pub async fn session_handle(&self) -> Result<SessionHandle> {
        self.inner
            .state
            .lock()
            .await
            .live_handle()
            .ok_or_else(ClientError::not_connected)
    }

    /// Send one request as-is. Not retried.
    pub async fn send_raw(&self, actor: &str, kind: &str, fields: Value) -> Result<Value> {
        let handle = self.session_handle().await?;
        handle.request(actor, kind, fields).await
    }

    /// The cached execution actor, or a freshly discovered one.
    pub async fn ensure_execution_actor(&self) -> Result<ResolvedActor> {
        let mut state = self.inner.state.lock().await;
        if let Some(resolved) = state.actors.fresh(Instant::now()) {
            return Ok(resolved);
        }
        let handle = state.live_handle().ok_or_else(ClientError::not_connected)?;

        // Read before discovery so a racing invalidation wins.
        let generation = state.actors.generation().current();
        let resolved = actors::discover(&handle, &self.inner.config.target).await?;
        tracing::info!(actor = %resolved.actor, via = ?resolved.via, "Resolved execution actor");
        state.actors.store(resolved.clone(), Instant::now(), generation);
        Ok(resolved)
    }

    /// Evaluate `code` in the application's main context.
    ///
    /// Goes through [`RdpClient::with_retry`]. A script that throws is not an
    /// error: the exception is returned in [`Evaluation::exception`].
    pub async fn evaluate(&self, code: &str) -> Result<Evaluation> {
        self.with_retry(|client| async move { client.evaluate_once(code).await })
            .await
    }

    async fn evaluate_once(&self, code: &str) -> Result<Evaluation> {
        let resolved = self.ensure_execution_actor().await?;
        let handle = self.session_handle().await?;
        let actor = resolved.actor.as_str();

        let packet = handle
            .request(actor, "evaluateJSAsync", json!({ "text": code }))
            .await?;
        let reply = EvaluationReply::from_packet(actor, &packet)?;

        let result = grip::resolve(&reply.result, &handle).await?;
        let exception = match &reply.exception {
            Some(grip) => Some(grip::resolve(grip, &handle).await?),
            None => None,
        };
        let exception_message = match &reply.exception_message {
            Some(grip) => Some(match grip::resolve(grip, &handle).await? {
                RemoteValue::String(text) => text,
                other => other.to_json().to_string(),
            }),
            None => None,
        };

        Ok(Evaluation {
            result,
            exception,
            exception_message,
        })
    }

    /// Console messages cached by the execution actor, oldest first.
    pub async fn console_messages(&self, types: &[&str]) -> Result<Vec<Value>> {
        let types = if types.is_empty() {
            DEFAULT_MESSAGE_TYPES
        } else {
            types
        };
        self.with_retry(|client| async move {
            let resolved = client.ensure_execution_actor().await?;
            let handle = client.session_handle().await?;
            let actor = resolved.actor.as_str();
            let reply = handle
                .request(actor, "getCachedMessages", json!({ "messageTypes": types }))
                .await?;
            reply
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .ok_or_else(|| ClientError::malformed(actor, "getCachedMessages reply has no messages"))
        })
        .await
    }

    /// Decode a grip without network access.
    pub fn decode_value(&self, grip: &Value) -> RemoteValue {
        grip::decode(grip)
    }

    /// Decode a grip, fetching long string contents over the live session.
    pub async fn resolve_value(&self, grip: &Value) -> Result<RemoteValue> {
        let handle = self.session_handle().await?;
        grip::resolve(grip, &handle).await
    }

    /// Run `operation`, retrying actor and connection failures.
    ///
    /// Actor failures clear the actor cache and retry after a short linear
    /// backoff. Connection failures back off exponentially and reconnect
    /// first. Everything else, request timeouts included, is returned as-is.
    pub async fn with_retry<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(RdpClient) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = &self.inner.config.retry;
        let mut attempt = 0u32;
        loop {
            let err = match operation(self.clone()).await {
                Ok(value) => {
                    self.inner.failures.reset();
                    return Ok(value);
                }
                Err(err) => err,
            };

            attempt += 1;
            let class = err.class();
            if !policy.should_retry(class, attempt) {
                if class != FailureClass::Unknown {
                    tracing::warn!(attempt, error = %err, "Retries exhausted");
                }
                return Err(err);
            }

            match class {
                FailureClass::Actor => {
                    self.invalidate_actors(InvalidationReason::NoSuchActor).await;
                    let delay = policy.actor_backoff(attempt);
                    tracing::info!(attempt, ?delay, error = %err, "Actor gone, retrying");
                    tokio::time::sleep(delay).await;
                }
                FailureClass::Connection => {
                    let failures = self.inner.failures.record();
                    let delay = policy.connection_backoff(failures);
                    tracing::warn!(attempt, failures, ?delay, error = %err, "Connection failure, reconnecting");
                    tokio::time::sleep(delay).await;
                    self.reconnect().await?;
                }
                FailureClass::Unknown => return Err(err),
            }
        }
    }

    pub async fn root_info(&self) -> Option<RootInfo> {
        self.inner.state.lock().await.root.clone()
    }

    pub async fn current_target(&self) -> Option<TargetInfo> {
        let state = self.inner.state.lock().await;
        state.actors.peek().and_then(|r| r.target.clone())
    }

    pub async fn cached_actor(&self) -> Option<ActorId> {
        let state = self.inner.state.lock().await;
        state.actors.peek().map(|r| r.actor.clone())
    }

    pub async fn status(&self) -> ClientStatus {
        let state = self.inner.state.lock().await;
        let cached = state.actors.peek();
        let actor_age_ms = state.actors.cached_at().map(|at| {
            u64::try_from(Instant::now().saturating_duration_since(at).as_millis())
                .unwrap_or(u64::MAX)
        });
        ClientStatus {
            version: CLIENT_VERSION,
            phase: self.inner.shared.phase(),
            address: self.inner.config.address(),
            application_type: state.root.as_ref().map(|r| r.application_type.clone()),
            execution_actor: cached.map(|r| r.actor.to_string()),
            discovered_via: cached.map(|r| r.via),
            target: cached.and_then(|r| r.target.clone()),
            actor_age_ms,
            consecutive_failures: self.inner.failures.current(),
        }
    }

    fn emit(&self, event: ClientEvent) {
        self.inner.shared.emit(event);
    }

    async fn invalidate_actors(&self, reason: InvalidationReason) {
        let mut state = self.inner.state.lock().await;
        if state.actors.clear() {
            tracing::debug!(reason = reason.name(), "Cleared cached actor");
            self.emit(ClientEvent::ActorsInvalidated { reason });
        }
    }

    async fn open_session(&self, state: &mut ConnectionState) -> Result<()> {
        if let Some(old) = state.session.take() {
            old.close().await;
        }
        let id = self.inner.next_session.fetch_add(1, Ordering::AcqRel) + 1;
        let session = Session::connect(&self.inner.config, id, self.inner.shared.clone()).await?;
        state.root = Some(session.root().clone());
        state.session = Some(session);
        Ok(())
    }

    /// Clear cached state and close the session. Pending requests are
    /// rejected before this returns.
    async fn teardown(&self, state: &mut ConnectionState, reason: InvalidationReason) {
        if state.actors.clear() {
            self.emit(ClientEvent::ActorsInvalidated {
                reason: reason.clone(),
            });
        }
        state.root = None;
        if let Some(session) = state.session.take() {
            tracing::info!(session = session.id(), reason = reason.name(), "Closing session");
            session.close().await;
        }
    }

    fn spawn_keepalive(&self) {
        let config = &self.inner.config;
        if !config.keepalive_enabled
            || config.keepalive_interval.is_zero()
            || self.inner.keepalive_started.swap(true, Ordering::AcqRel)
        {
            return;
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let token = self.inner.keepalive.clone();
        let interval = config.keepalive_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                RdpClient { inner }.keepalive_tick().await;
            }
            tracing::debug!("Keepalive task exiting");
        });
    }

    async fn keepalive_tick(&self) {
        let interval = self.inner.config.keepalive_interval;
        if self.inner.shared.activity.idle_for(Instant::now()) < interval {
            return;
        }

        let handle = {
            let state = self.inner.state.lock().await;
            if !state.wanted {
                return;
            }
            state.live_handle()
        };

        let probe = match handle {
            Some(handle) => handle.request(ROOT_ACTOR, "getRoot", Value::Null).await,
            None => Err(ClientError::not_connected()),
        };
        let err = match probe {
            Ok(_) => {
                tracing::trace!("Keepalive ok");
                return;
            }
            Err(err) if answered(&err) => {
                tracing::debug!(error = %err, "Keepalive answered with an error");
                return;
            }
            Err(err) => err,
        };

        tracing::warn!(error = %err, "Keepalive failed");
        self.emit(ClientEvent::KeepaliveFailed {
            error: err.to_string(),
        });
        match self.reconnect().await {
            Ok(()) => {
                tracing::info!("Keepalive reconnected");
                self.emit(ClientEvent::KeepaliveReconnected);
            }
            Err(e) => tracing::warn!(error = %e, "Keepalive reconnect failed"),
        }
    }
}

/// The server replied, so the link itself is fine.
fn answered(err: &ClientError) -> bool {
    matches!(
        err,
        ClientError::Protocol { .. }
            | ClientError::NoSuchActor { .. }
            | ClientError::MalformedResponse { .. }
    )
}
