//! Internal lifecycle event bus.
//!
//! Components publish [`BusEvent`]s from any thread; a single relay task
//! forwards each one to the owning process as exactly one [`HostEvent`].

use termhost_pty::{SessionId, StateTransition, TerminalKind};
use tokio::sync::mpsc;

use crate::ipc::{EventSink, HostEvent};

#[derive(Debug, Clone)]
pub enum BusEvent {
    AgentState {
        id: SessionId,
        transition: StateTransition,
    },
    AgentDetected {
        id: SessionId,
        agent: TerminalKind,
    },
    AgentExited {
        id: SessionId,
        agent: TerminalKind,
    },
    AgentSpawned {
        id: SessionId,
        agent: TerminalKind,
    },
    AgentOutput {
        id: SessionId,
        timestamp: i64,
    },
    AgentCompleted {
        id: SessionId,
    },
    AgentFailed {
        id: SessionId,
    },
    AgentKilled {
        id: SessionId,
        agent: TerminalKind,
        reason: Option<String>,
    },
    ArtifactDetected {
        id: SessionId,
        uri: String,
    },
    TerminalTrashed {
        id: SessionId,
        expires_at: i64,
    },
    TerminalRestored {
        id: SessionId,
    },
}

impl From<BusEvent> for HostEvent {
    fn from(event: BusEvent) -> Self {
        match event {
            BusEvent::AgentState { id, transition } => HostEvent::agent_state(id, &transition),
            BusEvent::AgentDetected { id, agent } => HostEvent::AgentDetected { id, agent },
            BusEvent::AgentExited { id, agent } => HostEvent::AgentExited { id, agent },
            BusEvent::AgentSpawned { id, agent } => HostEvent::AgentSpawned { id, agent },
            BusEvent::AgentOutput { id, timestamp } => HostEvent::AgentOutput { id, timestamp },
            BusEvent::AgentCompleted { id } => HostEvent::AgentCompleted { id },
            BusEvent::AgentFailed { id } => HostEvent::AgentFailed { id },
            BusEvent::AgentKilled { id, agent, reason } => {
                HostEvent::AgentKilled { id, agent, reason }
            }
            BusEvent::ArtifactDetected { id, uri } => HostEvent::ArtifactDetected { id, uri },
            BusEvent::TerminalTrashed { id, expires_at } => {
                HostEvent::TerminalTrashed { id, expires_at }
            }
            BusEvent::TerminalRestored { id } => HostEvent::TerminalRestored { id },
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<BusEvent>,
}

impl EventBus {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn publish(&self, event: BusEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("bus event dropped, relay has shut down");
        }
    }
}

/// Forward bus events to the sink until every publisher is gone.
pub async fn relay(mut rx: mpsc::UnboundedReceiver<BusEvent>, sink: EventSink) {
    while let Some(event) = rx.recv().await {
        sink.emit(event.into());
    }
}

const OSC8_PREFIX: &[u8] = b"\x1b]8;";

/// File URIs announced through OSC 8 hyperlinks in a chunk of output.
///
/// Agent CLIs link the files they write; each `file://` link target is
/// reported once per chunk. Links split across chunks are not seen.
pub fn artifact_links(chunk: &[u8]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut rest = chunk;

    while let Some(start) = find(rest, OSC8_PREFIX) {
        rest = &rest[start + OSC8_PREFIX.len()..];
        // `params;URI` terminated by BEL or ST.
        let Some(end) = rest.iter().position(|&b| b == 0x07 || b == 0x1b) else {
            break;
        };
        let body = &rest[..end];
        rest = &rest[end..];

        let Some(semi) = body.iter().position(|&b| b == b';') else {
            continue;
        };
        let uri = String::from_utf8_lossy(&body[semi + 1..]).into_owned();
        if uri.starts_with("file://") && !found.contains(&uri) {
            found.push(uri);
        }
    }
    found
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::Outbound;
    use termhost_pty::{AgentState, StateTrigger};

    #[test]
    fn test_every_event_maps_one_to_one() {
        let transition = StateTransition {
            previous: AgentState::Idle,
            state: AgentState::Busy,
            trigger: StateTrigger::Output,
            confidence: 0.7,
            timestamp: 10,
        };
        let event: HostEvent = BusEvent::AgentState {
            id: "t1".into(),
            transition,
        }
        .into();
        let json = serde_json::to_value(event).unwrap();
        assert_eq!(json["type"], "agent-state");
        assert_eq!(json["previous"], "idle");
        assert_eq!(json["state"], "busy");

        let json = serde_json::to_value(HostEvent::from(BusEvent::TerminalTrashed {
            id: "t1".into(),
            expires_at: 99,
        }))
        .unwrap();
        assert_eq!(json["type"], "terminal-trashed");
        assert_eq!(json["expiresAt"], 99);

        let json = serde_json::to_value(HostEvent::from(BusEvent::AgentKilled {
            id: "t1".into(),
            agent: TerminalKind::Codex,
            reason: None,
        }))
        .unwrap();
        assert_eq!(json["type"], "agent-killed");
        assert_eq!(json["agent"], "codex");
    }

    #[tokio::test]
    async fn test_relay_forwards_in_order() {
        let (bus, bus_rx) = EventBus::channel();
        let (sink, mut sink_rx) = EventSink::channel();

        bus.publish(BusEvent::AgentSpawned {
            id: "a".into(),
            agent: TerminalKind::Claude,
        });
        bus.publish(BusEvent::TerminalRestored { id: "b".into() });
        drop(bus);
        relay(bus_rx, sink).await;

        let mut kinds = Vec::new();
        while let Ok(Outbound::Event(event)) = sink_rx.try_recv() {
            kinds.push(serde_json::to_value(event).unwrap()["type"].clone());
        }
        assert_eq!(kinds, vec!["agent-spawned", "terminal-restored"]);
    }

    #[test]
    fn test_artifact_links() {
        let chunk = b"wrote \x1b]8;;file:///tmp/out.md\x07out.md\x1b]8;;\x07 and \
            \x1b]8;id=1;file:///tmp/b.rs\x1b\\b.rs\x1b]8;;\x1b\\ \
            \x1b]8;;https://example.com\x07link\x1b]8;;\x07 \
            \x1b]8;;file:///tmp/out.md\x07again\x1b]8;;\x07";
        assert_eq!(
            artifact_links(chunk),
            vec!["file:///tmp/out.md", "file:///tmp/b.rs"]
        );
    }

    #[test]
    fn test_artifact_links_ignores_plain_output() {
        assert!(artifact_links(b"ls -la\r\ntotal 0\r\n").is_empty());
        assert!(artifact_links(b"\x1b]8;;file:///unterminated").is_empty());
        assert!(artifact_links(b"").is_empty());
    }
}
