//! Test doubles: a scripted [`Requester`] and an in-process debugging server.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

use crate::bridge::codec::FrameCodec;
use crate::bridge::session::Requester;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::events::ClientEvent;
use crate::retry::RetryPolicy;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

type Call = (String, String, Value);

/// Answers requests from a script keyed by `(actor, type)`.
///
/// Each key holds a queue; the last entry is repeated once the queue is
/// down to one. Unscripted requests fail with `unrecognizedPacketType`.
#[derive(Default)]
pub struct ScriptedRequester {
    script: StdMutex<HashMap<(String, String), VecDeque<Result<Value>>>>,
    calls: StdMutex<Vec<Call>>,
}

impl ScriptedRequester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(self, to: &str, kind: &str, reply: Value) -> Self {
        self.push(to, kind, Ok(reply))
    }

    pub fn fail(self, to: &str, kind: &str, err: ClientError) -> Self {
        self.push(to, kind, Err(err))
    }

    fn push(self, to: &str, kind: &str, outcome: Result<Value>) -> Self {
        self.script
            .lock()
            .unwrap()
            .entry((to.to_string(), kind.to_string()))
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Requester for ScriptedRequester {
    async fn request(&self, to: &str, kind: &str, fields: Value) -> Result<Value> {
        self.calls
            .lock()
            .unwrap()
            .push((to.to_string(), kind.to_string(), fields));

        let mut script = self.script.lock().unwrap();
        let Some(queue) = script.get_mut(&(to.to_string(), kind.to_string())) else {
            return Err(ClientError::from_error_packet(
                to,
                Some("unrecognizedPacketType"),
                Some(&format!("no script for {to}.{kind}")),
            ));
        };
        match queue.len() {
            0 => unreachable!("script queues are never empty"),
            1 => queue[0].clone(),
            _ => queue.pop_front().unwrap(),
        }
    }
}

/// Wait for the first event matching `pred`, skipping others.
pub async fn next_event(
    events: &mut broadcast::Receiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(STEP_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Debugging server on an ephemeral localhost port.
pub struct FakeServer {
    listener: TcpListener,
    port: u16,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    /// A port nothing listens on.
    pub async fn unused_port() -> u16 {
        Self::bind().await.port
    }

    /// Short timeouts and delays, keepalive off.
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new("127.0.0.1", self.port)
            .with_request_timeout(Duration::from_secs(2))
            .with_reconnect_delay(Duration::from_millis(10))
            .with_retry(RetryPolicy {
                max_retries: 2,
                backoff_base: Duration::from_millis(10),
                backoff_max: Duration::from_millis(50),
                actor_retry_delay: Duration::from_millis(5),
            })
            .without_keepalive()
    }

    /// Accept a client and send the intro.
    pub async fn accept(&self) -> FakeConn {
        let mut conn = self.accept_silent().await;
        conn.send(json!({
            "from": "root",
            "applicationType": "browser",
            "testConnectionPrefix": "server1.conn0.",
            "traits": {"sources": true},
        }))
        .await;
        conn
    }

    /// Accept a client without sending the intro.
    pub async fn accept_silent(&self) -> FakeConn {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        FakeConn {
            framed: Framed::new(stream, FrameCodec::new()),
        }
    }
}

pub struct FakeConn {
    framed: Framed<TcpStream, FrameCodec>,
}

impl FakeConn {
    pub async fn send(&mut self, packet: Value) {
        self.framed.send(packet).await.unwrap();
    }

    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(STEP_TIMEOUT, self.framed.next())
            .await
            .expect("timed out waiting for a request")
            .expect("client closed the connection")
            .unwrap()
            .unwrap()
    }

    /// Receive the next request and check its type.
    pub async fn expect(&mut self, kind: &str) -> Value {
        let request = self.recv().await;
        assert_eq!(request["type"], kind, "unexpected request {request}");
        request
    }

    /// Assert nothing arrives for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(window, self.framed.next()).await {
            panic!("unexpected frame {frame:?}");
        }
    }

    /// Answer the process-path discovery with `console`.
    pub async fn serve_discovery(&mut self, console: &str) {
        self.expect("listProcesses").await;
        self.send(json!({
            "from": "root",
            "processes": [{"actor": "server1.conn0.process0", "id": 0, "isParent": true}],
        }))
        .await;

        let request = self.expect("getTarget").await;
        assert_eq!(request["to"], "server1.conn0.process0");
        self.send(json!({
            "from": "server1.conn0.process0",
            "process": {
                "actor": "server1.conn0.parentProcessTarget1",
                "consoleActor": console,
                "title": "Main Window",
                "url": "chrome://app/content/main.xhtml",
            },
        }))
        .await;
    }

    /// Answer one `evaluateJSAsync` with an ack and then `result`.
    /// Returns the request.
    pub async fn answer_evaluation(&mut self, console: &str, result: Value) -> Value {
        let request = self.expect("evaluateJSAsync").await;
        assert_eq!(request["to"], console);
        self.send(json!({"from": console, "resultID": "1-1"})).await;
        self.send(json!({
            "from": console,
            "type": "evaluationResult",
            "resultID": "1-1",
            "result": result,
        }))
        .await;
        request
    }
}
