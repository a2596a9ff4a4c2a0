//! Link phase and status snapshot types.

use serde::{Deserialize, Serialize};

use crate::actors::DiscoveryPath;
use crate::bridge::protocol::TargetInfo;

pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Connection state machine. Any transport error returns to `Disconnected`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkPhase {
    #[default]
    Disconnected,
    /// Opening the socket
    Connecting,
    /// Socket open, waiting for the server's intro packet
    AwaitingIntro,
    /// Intro received, requests accepted
    Ready,
}

/// Phase together with the session that published it. A session may only
/// move the link out of a phase it owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStatus {
    pub phase: LinkPhase,
    pub session: u64,
}

/// Point-in-time view of the client, for diagnostics output.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub version: &'static str,
    pub phase: LinkPhase,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_actor: Option<String>,
    /// Which discovery path produced the execution actor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discovered_via: Option<DiscoveryPath>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetInfo>,
    /// Age of the cached execution actor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_age_ms: Option<u64>,
    pub consecutive_failures: u32,
}

impl ClientStatus {
    pub fn is_connected(&self) -> bool {
        self.phase == LinkPhase::Ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_default_is_disconnected() {
        assert_eq!(LinkPhase::default(), LinkPhase::Disconnected);
        assert_eq!(LinkStatus::default().session, 0);
    }

    #[test]
    fn phase_serializes_screaming_snake_case() {
        insta::assert_json_snapshot!(
            [
                LinkPhase::Disconnected,
                LinkPhase::Connecting,
                LinkPhase::AwaitingIntro,
                LinkPhase::Ready,
            ],
            @r#"
        [
          "DISCONNECTED",
          "CONNECTING",
          "AWAITING_INTRO",
          "READY"
        ]
        "#
        );
    }

    #[test]
    fn phase_deserializes_screaming_snake_case() {
        assert_eq!(
            serde_json::from_str::<LinkPhase>("\"AWAITING_INTRO\"").unwrap(),
            LinkPhase::AwaitingIntro
        );
    }

    #[test]
    fn disconnected_status_omits_session_fields() {
        let status = ClientStatus {
            version: "0.0.0",
            phase: LinkPhase::Disconnected,
            address: "127.0.0.1:6000".to_string(),
            application_type: None,
            execution_actor: None,
            discovered_via: None,
            target: None,
            actor_age_ms: None,
            consecutive_failures: 2,
        };
        assert!(!status.is_connected());
        insta::assert_json_snapshot!(status, @r#"
        {
          "version": "0.0.0",
          "phase": "DISCONNECTED",
          "address": "127.0.0.1:6000",
          "consecutive_failures": 2
        }
        "#);
    }

    #[test]
    fn ready_status_includes_target() {
        let status = ClientStatus {
            version: "0.0.0",
            phase: LinkPhase::Ready,
            address: "127.0.0.1:6000".to_string(),
            application_type: Some("browser".to_string()),
            execution_actor: Some("server1.conn0.console3".to_string()),
            discovered_via: Some(DiscoveryPath::Process),
            target: Some(TargetInfo {
                title: "Main Window".to_string(),
                url: "chrome://app/content/main.xhtml".to_string(),
                window_id: Some(1),
            }),
            actor_age_ms: Some(1500),
            consecutive_failures: 0,
        };
        assert!(status.is_connected());
        insta::assert_json_snapshot!(status, @r#"
        {
          "version": "0.0.0",
          "phase": "READY",
          "address": "127.0.0.1:6000",
          "application_type": "browser",
          "execution_actor": "server1.conn0.console3",
          "discovered_via": "process",
          "target": {
            "title": "Main Window",
            "url": "chrome://app/content/main.xhtml",
            "window_id": 1
          },
          "actor_age_ms": 1500,
          "consecutive_failures": 0
        }
        "#);
    }
}
