//! Read-only requests. Each answers with one event echoing the caller's
//! `requestId`.

use termhost_pty::session::now_ms;

use crate::ipc::HostEvent;
use crate::state::HostState;

pub fn get_snapshot(host: &HostState, id: &str, request_id: Option<String>) {
    let snapshot = host.registry().snapshot(id);
    host.sink.emit(HostEvent::Snapshot {
        request_id,
        id: id.to_string(),
        snapshot,
    });
}

pub fn get_all_snapshots(host: &HostState, request_id: Option<String>) {
    let snapshots = host.registry().all_snapshots();
    host.sink.emit(HostEvent::AllSnapshots {
        request_id,
        snapshots,
    });
}

pub fn get_terminal(host: &HostState, id: &str, request_id: Option<String>) {
    let terminal = host.registry().snapshot(id);
    host.sink.emit(HostEvent::TerminalInfo {
        request_id,
        id: id.to_string(),
        terminal,
    });
}

pub fn get_terminals_for_project(host: &HostState, project_id: String, request_id: Option<String>) {
    let ids = host.registry().terminals_for_project(&project_id);
    host.sink.emit(HostEvent::TerminalsForProject {
        request_id,
        project_id,
        ids,
    });
}

/// Buffered output lines, newest last. Without `max_lines` the whole
/// retained history is returned.
pub fn replay_history(
    host: &HostState,
    id: &str,
    max_lines: Option<usize>,
    request_id: Option<String>,
) {
    let max_lines = max_lines.unwrap_or(host.config.sessions.history_lines);
    let lines = host.registry().history(id, max_lines);
    host.sink.emit(HostEvent::ReplayHistoryResult {
        request_id,
        id: id.to_string(),
        lines,
    });
}

pub fn get_serialized_state(host: &HostState, id: &str, request_id: Option<String>) {
    let state = host.registry().serialized_state(id);
    host.sink.emit(HostEvent::SerializedState {
        request_id,
        id: id.to_string(),
        state,
    });
}

pub fn get_terminal_info(host: &HostState, id: &str, request_id: Option<String>) {
    let info = host.registry().diagnostics(id);
    let status = host.controller.status(id);
    host.sink.emit(HostEvent::TerminalDiagnosticInfo {
        request_id,
        id: id.to_string(),
        info,
        status,
    });
}

pub fn health_check(host: &HostState, request_id: Option<String>) {
    let sessions = host.registry().len();
    host.sink.emit(HostEvent::Pong {
        request_id,
        timestamp: now_ms(),
        sessions,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::terminal;
    use crate::config::HostConfig;
    use crate::state::test_support::*;
    use termhost_pty::SpawnOptions;

    fn options(project: &str) -> SpawnOptions {
        SpawnOptions {
            shell: Some("/bin/sh".to_string()),
            project_id: Some(project.to_string()),
            ..SpawnOptions::default()
        }
    }

    #[tokio::test]
    async fn test_queries_echo_request_id() {
        let mut t = test_host(HostConfig::default());
        terminal::spawn(&t.host, Some("t1".into()), options("p1")).unwrap();
        terminal::spawn(&t.host, Some("t2".into()), options("p2")).unwrap();
        let _ = event_types(&mut t.events);

        get_snapshot(&t.host, "t1", Some("r1".into()));
        get_all_snapshots(&t.host, Some("r2".into()));
        get_terminals_for_project(&t.host, "p2".into(), Some("r3".into()));
        health_check(&t.host, Some("r4".into()));

        let events = event_types(&mut t.events);
        assert_eq!(events[0]["type"], "snapshot");
        assert_eq!(events[0]["requestId"], "r1");
        assert_eq!(events[0]["snapshot"]["projectId"], "p1");
        assert_eq!(events[1]["type"], "all-snapshots");
        assert_eq!(events[1]["snapshots"].as_array().unwrap().len(), 2);
        assert_eq!(events[2]["type"], "terminals-for-project");
        assert_eq!(events[2]["ids"], serde_json::json!(["t2"]));
        assert_eq!(events[3]["type"], "pong");
        assert_eq!(events[3]["requestId"], "r4");
        assert_eq!(events[3]["sessions"], 2);

        t.host.registry().kill_all();
    }

    #[tokio::test]
    async fn test_unknown_terminal_answers_null() {
        let mut t = test_host(HostConfig::default());
        get_terminal(&t.host, "nope", None);
        replay_history(&t.host, "nope", Some(10), None);
        get_serialized_state(&t.host, "nope", None);
        get_terminal_info(&t.host, "nope", None);

        let events = event_types(&mut t.events);
        assert_eq!(events[0]["type"], "terminal-info");
        assert!(events[0]["terminal"].is_null());
        assert_eq!(events[1]["type"], "replay-history-result");
        assert!(events[1]["lines"].is_null());
        assert_eq!(events[2]["type"], "serialized-state");
        assert!(events[2]["state"].is_null());
        assert_eq!(events[3]["type"], "terminal-diagnostic-info");
        assert!(events[3]["info"].is_null());
        assert!(events[3]["status"].is_null());
    }

    #[tokio::test]
    async fn test_terminal_info_reports_flow_status() {
        let mut t = test_host(HostConfig::default());
        terminal::spawn(&t.host, Some("t1".into()), options("p1")).unwrap();
        let _ = event_types(&mut t.events);

        get_terminal_info(&t.host, "t1", Some("r1".into()));
        let events = event_types(&mut t.events);
        assert_eq!(events[0]["status"], "running");
        assert_eq!(events[0]["info"]["alive"], true);

        t.host.registry().kill_all();
    }
}
