//! A single connection to the debugging server.
//!
//! Flow:
//! 1. Open the socket (`Connecting`)
//! 2. Wait for the server's intro packet (`AwaitingIntro`)
//! 3. Spawn the session loop (`Ready`), which owns both socket halves and
//!    the [`Correlator`]
//! 4. On EOF, I/O error or shutdown: reject everything pending, bump the
//!    actor generation, publish `Disconnected`

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::actors::ActorGeneration;
use crate::bridge::codec::FrameCodec;
use crate::bridge::protocol::{self, Request, RootInfo};
use crate::config::ClientConfig;
use crate::correlator::{Correlator, Dispatch, ReplySender};
use crate::error::{ClientError, ConnectionFailure, Result};
use crate::events::{ClientEvent, EVENT_CHANNEL_CAPACITY, InvalidationReason};
use crate::status::{LinkPhase, LinkStatus};

const COMMAND_BUFFER: usize = 64;

/// Anything that can send a request and wait for its reply.
///
/// Implemented by [`SessionHandle`]; discovery and grip resolution only
/// depend on this, so they can be tested without a socket.
#[async_trait]
pub trait Requester: Send + Sync {
    async fn request(&self, to: &str, kind: &str, fields: Value) -> Result<Value>;
}

/// Time of the last successful round-trip on any session.
#[derive(Debug, Clone)]
pub struct LastActivity(Arc<StdMutex<Instant>>);

impl Default for LastActivity {
    fn default() -> Self {
        Self(Arc::new(StdMutex::new(Instant::now())))
    }
}

impl LastActivity {
    pub fn touch(&self) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = *self.0.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }
}

/// State shared between the client and every session it opens.
#[derive(Debug, Clone)]
pub struct SessionShared {
    pub events: broadcast::Sender<ClientEvent>,
    pub generation: ActorGeneration,
    pub status: Arc<watch::Sender<LinkStatus>>,
    pub activity: LastActivity,
}

impl Default for SessionShared {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionShared {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(LinkStatus::default());
        Self {
            events,
            generation: ActorGeneration::default(),
            status: Arc::new(status),
            activity: LastActivity::default(),
        }
    }

    pub fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn phase(&self) -> LinkPhase {
        self.status.borrow().phase
    }

    /// Claim the link for a new session.
    fn begin(&self, session: u64, phase: LinkPhase) {
        self.status.send_replace(LinkStatus { phase, session });
    }

    /// Move the link to `phase` if `session` still owns it. Returns whether
    /// anything changed.
    fn publish(&self, session: u64, phase: LinkPhase) -> bool {
        self.status.send_if_modified(|status| {
            if status.session != session || status.phase == phase {
                return false;
            }
            status.phase = phase;
            true
        })
    }
}

#[derive(Debug)]
struct Outgoing {
    request: Request,
    timeout: Duration,
    reply: ReplySender,
}

/// Cloneable sender side of a session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    commands: mpsc::Sender<Outgoing>,
    default_timeout: Duration,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn request_with_timeout(
        &self,
        to: &str,
        kind: &str,
        fields: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let (reply, response) = oneshot::channel();
        let request = Request::new(to, kind).with_fields(fields);
        tracing::debug!(session = self.id, actor = %to, %kind, "Sending request");

        self.commands
            .send(Outgoing {
                request,
                timeout,
                reply,
            })
            .await
            .map_err(|_| ClientError::closed("session has ended"))?;

        response
            .await
            .map_err(|_| ClientError::closed("session ended before the reply arrived"))?
    }
}

#[async_trait]
impl Requester for SessionHandle {
    async fn request(&self, to: &str, kind: &str, fields: Value) -> Result<Value> {
        self.request_with_timeout(to, kind, fields, self.default_timeout)
            .await
    }
}

pub struct Session {
    handle: SessionHandle,
    root: RootInfo,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    /// Dial the configured address and complete the intro handshake.
    pub async fn connect(config: &ClientConfig, id: u64, shared: SessionShared) -> Result<Self> {
        shared.begin(id, LinkPhase::Connecting);
        let result = Self::open(config, id, shared.clone()).await;
        if let Err(ref e) = result {
            tracing::warn!(session = id, error = %e, "Connect failed");
            shared.publish(id, LinkPhase::Disconnected);
        }
        result
    }

    async fn open(config: &ClientConfig, id: u64, shared: SessionShared) -> Result<Self> {
        let address = config.address();
        tracing::info!(session = id, %address, "Connecting");

        let stream = tokio::time::timeout(config.request_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| {
                ClientError::connection(
                    ConnectionFailure::TimedOut,
                    format!("connect to {address} timed out after {:?}", config.request_timeout),
                )
            })?
            .map_err(|e| ClientError::from_io(&e))?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Could not set TCP_NODELAY");
        }

        let (read_half, write_half) = stream.into_split();
        let reader = FramedRead::new(
            read_half,
            FrameCodec::with_max_frame_length(config.max_frame_length),
        );
        let writer = FramedWrite::new(
            write_half,
            FrameCodec::with_max_frame_length(config.max_frame_length),
        );
        Self::start(reader, writer, config.request_timeout, id, shared).await
    }

    /// Run the handshake on an already-open transport and spawn the loop.
    pub async fn start<R, W>(
        mut reader: FramedRead<R, FrameCodec>,
        writer: FramedWrite<W, FrameCodec>,
        timeout: Duration,
        id: u64,
        shared: SessionShared,
    ) -> Result<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        shared.begin(id, LinkPhase::AwaitingIntro);
        tracing::debug!(session = id, "Waiting for intro");

        let intro = tokio::time::timeout(timeout, async {
            loop {
                match reader.next().await {
                    Some(Ok(Ok(packet))) if protocol::is_intro(&packet) => {
                        return RootInfo::from_intro(&packet);
                    }
                    Some(Ok(Ok(packet))) => {
                        tracing::debug!(?packet, "Ignoring packet before intro");
                    }
                    Some(Ok(Err(e))) => {
                        shared.emit(ClientEvent::TransportError {
                            error: e.to_string(),
                        });
                    }
                    Some(Err(e)) => return Err(ClientError::from_io(&e)),
                    None => return Err(ClientError::closed("connection closed before intro")),
                }
            }
        })
        .await;

        let root = match intro {
            Ok(Ok(root)) => root,
            Ok(Err(e)) => {
                shared.publish(id, LinkPhase::Disconnected);
                return Err(e);
            }
            Err(_) => {
                shared.publish(id, LinkPhase::Disconnected);
                return Err(ClientError::Handshake(timeout));
            }
        };
        tracing::info!(
            session = id,
            application_type = %root.application_type,
            "Connected"
        );

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let shutdown = CancellationToken::new();

        // Ready must be published before the loop can observe EOF and
        // publish Disconnected.
        shared.activity.touch();
        shared.publish(id, LinkPhase::Ready);
        shared.emit(ClientEvent::Connected { root: root.clone() });

        let task = tokio::spawn(run_session_loop(
            id,
            reader,
            writer,
            commands_rx,
            shutdown.clone(),
            shared.clone(),
        ));

        Ok(Self {
            handle: SessionHandle {
                id,
                commands: commands_tx,
                default_timeout: timeout,
            },
            root,
            shutdown,
            task,
        })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn root(&self) -> &RootInfo {
        &self.root
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    /// Signal the session loop to stop without waiting for it.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Tear the session down and wait until every pending request has been
    /// rejected.
    pub async fn close(self) {
        self.shutdown();
        if let Err(e) = self.task.await {
            tracing::error!(session = self.handle.id, error = %e, "Session task failed");
        }
    }
}

async fn run_session_loop<R, W>(
    id: u64,
    mut reader: FramedRead<R, FrameCodec>,
    mut writer: FramedWrite<W, FrameCodec>,
    mut commands: mpsc::Receiver<Outgoing>,
    shutdown: CancellationToken,
    shared: SessionShared,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut correlator = Correlator::new();

    let reason = loop {
        let next_deadline = correlator.next_deadline();

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                break ClientError::closed("connection closed");
            }

            frame = reader.next() => {
                match frame {
                    Some(Ok(Ok(packet))) => route(id, &mut correlator, packet, &shared),
                    Some(Ok(Err(e))) => {
                        shared.emit(ClientEvent::TransportError { error: e.to_string() });
                    }
                    Some(Err(e)) => {
                        tracing::warn!(session = id, error = %e, "Read failed");
                        break ClientError::from_io(&e);
                    }
                    None => {
                        tracing::info!(session = id, "Server closed the connection");
                        break ClientError::closed("server closed the connection");
                    }
                }
            }

            command = commands.recv() => {
                let Some(Outgoing { request, timeout, reply }) = command else {
                    break ClientError::closed("client dropped");
                };
                correlator.register(request.to.clone(), request.kind.clone(), timeout, reply);
                if let Err(e) = writer.send(request.into_value()).await {
                    tracing::warn!(session = id, error = %e, "Write failed");
                    break ClientError::from_io(&e);
                }
            }

            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)), if next_deadline.is_some() => {
                correlator.expire(Instant::now());
            }
        }
    };

    let mut rejected = correlator.reject_all(&reason);
    commands.close();
    while let Ok(outgoing) = commands.try_recv() {
        let _ = outgoing.reply.send(Err(reason.clone()));
        rejected += 1;
    }
    shared.generation.bump();

    tracing::info!(session = id, rejected, %reason, "Session ended");
    if shared.publish(id, LinkPhase::Disconnected) {
        shared.emit(ClientEvent::Disconnected {
            reason: reason.to_string(),
        });
    }
}

fn route(id: u64, correlator: &mut Correlator, packet: Value, shared: &SessionShared) {
    match correlator.dispatch(packet) {
        Dispatch::Event { event, invalidates } => {
            if invalidates {
                let kind = event.kind.clone().unwrap_or_default();
                shared.generation.bump();
                tracing::debug!(session = id, event = %kind, "Invalidating cached actors");
                shared.emit(ClientEvent::ActorsInvalidated {
                    reason: InvalidationReason::Event(kind),
                });
            }
            shared.emit(ClientEvent::Remote(event));
        }
        Dispatch::Unsolicited(event) => shared.emit(ClientEvent::Remote(event)),
        Dispatch::Resolved { ok: true, .. } => shared.activity.touch(),
        Dispatch::Resolved { ok: false, .. } | Dispatch::Ack => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::DuplexStream;

    type ServerSide = (
        FramedRead<tokio::io::ReadHalf<DuplexStream>, FrameCodec>,
        FramedWrite<tokio::io::WriteHalf<DuplexStream>, FrameCodec>,
    );

    fn pipe() -> (
        FramedRead<tokio::io::ReadHalf<DuplexStream>, FrameCodec>,
        FramedWrite<tokio::io::WriteHalf<DuplexStream>, FrameCodec>,
        ServerSide,
    ) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (cr, cw) = tokio::io::split(client);
        let (sr, sw) = tokio::io::split(server);
        (
            FramedRead::new(cr, FrameCodec::new()),
            FramedWrite::new(cw, FrameCodec::new()),
            (
                FramedRead::new(sr, FrameCodec::new()),
                FramedWrite::new(sw, FrameCodec::new()),
            ),
        )
    }

    fn intro() -> Value {
        json!({"from": "root", "applicationType": "browser", "traits": {}})
    }

    async fn next_packet(
        reader: &mut FramedRead<tokio::io::ReadHalf<DuplexStream>, FrameCodec>,
    ) -> Value {
        reader.next().await.unwrap().unwrap().unwrap()
    }

    #[tokio::test]
    async fn handshake_then_request_reply() {
        let (reader, writer, (mut server_rx, mut server_tx)) = pipe();
        let shared = SessionShared::new();

        server_tx.send(json!({"from": "root", "tabs": []})).await.unwrap();
        server_tx.send(intro()).await.unwrap();
        let session = Session::start(reader, writer, Duration::from_secs(5), 1, shared.clone())
            .await
            .unwrap();
        assert_eq!(session.root().application_type, "browser");
        assert_eq!(shared.phase(), LinkPhase::Ready);

        let handle = session.handle().clone();
        let pending = tokio::spawn(async move {
            handle.request("root", "listTabs", Value::Null).await
        });

        let request = next_packet(&mut server_rx).await;
        assert_eq!(request, json!({"to": "root", "type": "listTabs"}));
        server_tx.send(json!({"from": "root", "tabs": [1]})).await.unwrap();

        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply["tabs"], json!([1]));
        session.close().await;
        assert_eq!(shared.phase(), LinkPhase::Disconnected);
    }

    #[tokio::test]
    async fn missing_intro_is_a_handshake_error() {
        let (reader, writer, _server) = pipe();
        let shared = SessionShared::new();
        let err = Session::start(reader, writer, Duration::from_millis(50), 1, shared.clone())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Handshake(_)));
        assert_eq!(shared.phase(), LinkPhase::Disconnected);
        assert_eq!(err.class(), crate::retry::FailureClass::Connection);
    }

    #[tokio::test]
    async fn close_rejects_pending_with_connection_closed() {
        let (reader, writer, (mut server_rx, mut server_tx)) = pipe();
        let shared = SessionShared::new();
        server_tx.send(intro()).await.unwrap();
        let session = Session::start(reader, writer, Duration::from_secs(5), 1, shared)
            .await
            .unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let handle = session.handle().clone();
            waiters.push(tokio::spawn(async move {
                handle.request("root", "getRoot", Value::Null).await
            }));
        }
        for _ in 0..3 {
            next_packet(&mut server_rx).await;
        }

        session.close().await;
        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(err.is_connection_closed(), "unexpected {err:?}");
        }
    }

    #[tokio::test]
    async fn request_deadline_rejects_with_timeout() {
        let (reader, writer, (mut server_rx, mut server_tx)) = pipe();
        let shared = SessionShared::new();
        server_tx.send(intro()).await.unwrap();
        let session = Session::start(reader, writer, Duration::from_secs(5), 1, shared)
            .await
            .unwrap();

        let handle = session.handle().clone();
        let pending = tokio::spawn(async move {
            handle
                .request_with_timeout("root", "getRoot", Value::Null, Duration::from_millis(30))
                .await
        });
        next_packet(&mut server_rx).await;

        let err = pending.await.unwrap().unwrap_err();
        assert!(matches!(err, ClientError::Timeout { ref kind, .. } if kind == "getRoot"));
        session.close().await;
    }

    #[tokio::test]
    async fn invalidating_event_bumps_generation() {
        let (reader, writer, (_server_rx, mut server_tx)) = pipe();
        let shared = SessionShared::new();
        let mut events = shared.events.subscribe();
        server_tx.send(intro()).await.unwrap();
        let session = Session::start(reader, writer, Duration::from_secs(5), 1, shared.clone())
            .await
            .unwrap();
        let before = shared.generation.current();

        server_tx
            .send(json!({"from": "tab1", "type": "tabNavigated", "url": "about:blank"}))
            .await
            .unwrap();

        loop {
            match events.recv().await.unwrap() {
                ClientEvent::ActorsInvalidated { reason } => {
                    assert_eq!(reason, InvalidationReason::Event("tabNavigated".into()));
                    break;
                }
                _ => continue,
            }
        }
        assert!(shared.generation.current() > before);
        session.close().await;
    }

    #[tokio::test]
    async fn server_eof_publishes_disconnected() {
        let (reader, writer, (server_rx, mut server_tx)) = pipe();
        let shared = SessionShared::new();
        let mut events = shared.events.subscribe();
        server_tx.send(intro()).await.unwrap();
        let session = Session::start(reader, writer, Duration::from_secs(5), 7, shared.clone())
            .await
            .unwrap();

        drop(server_tx);
        drop(server_rx);

        loop {
            if let ClientEvent::Disconnected { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(shared.phase(), LinkPhase::Disconnected);
        assert!(session.handle().request("root", "getRoot", Value::Null).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn server_closing_right_after_intro_ends_disconnected() {
        for id in 1..=200 {
            let (reader, writer, (server_rx, mut server_tx)) = pipe();
            let shared = SessionShared::new();
            let mut events = shared.events.subscribe();
            server_tx.send(intro()).await.unwrap();
            drop(server_tx);
            drop(server_rx);

            let session = Session::start(reader, writer, Duration::from_secs(5), id, shared.clone())
                .await
                .unwrap();

            let mut seen = Vec::new();
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    match events.recv().await.unwrap() {
                        ClientEvent::Connected { .. } => seen.push("connected"),
                        ClientEvent::Disconnected { .. } => {
                            seen.push("disconnected");
                            break;
                        }
                        _ => {}
                    }
                }
            })
            .await
            .expect("session never ended");

            assert_eq!(seen, ["connected", "disconnected"], "session {id}");
            assert_eq!(shared.phase(), LinkPhase::Disconnected, "session {id}");
            assert!(session.handle().is_closed());
        }
    }

    #[tokio::test]
    async fn stale_session_cannot_overwrite_newer_phase() {
        let shared = SessionShared::new();
        shared.begin(2, LinkPhase::Ready);
        assert!(!shared.publish(1, LinkPhase::Disconnected));
        assert_eq!(shared.phase(), LinkPhase::Ready);
        assert!(shared.publish(2, LinkPhase::Disconnected));
    }
}
