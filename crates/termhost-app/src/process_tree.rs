//! Agent CLI detection by walking each session's process tree.

use std::collections::{HashMap, HashSet, VecDeque};

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

use termhost_pty::{SessionId, TerminalKind};

use crate::bus::BusEvent;

/// Snapshot of parent/child links and process names.
#[derive(Debug, Default)]
pub struct ProcessTable {
    children: HashMap<u32, Vec<u32>>,
    names: HashMap<u32, String>,
}

impl ProcessTable {
    pub fn from_system(system: &System) -> Self {
        let mut table = Self::default();
        for (pid, process) in system.processes() {
            let pid = pid.as_u32();
            table
                .names
                .insert(pid, process.name().to_string_lossy().into_owned());
            if let Some(parent) = process.parent() {
                table.children.entry(parent.as_u32()).or_default().push(pid);
            }
        }
        table
    }

    #[cfg(test)]
    /// Build from `(pid, parent, name)` rows.
    pub fn from_rows(rows: &[(u32, Option<u32>, &str)]) -> Self {
        let mut table = Self::default();
        for &(pid, parent, name) in rows {
            table.names.insert(pid, name.to_string());
            if let Some(parent) = parent {
                table.children.entry(parent).or_default().push(pid);
            }
        }
        table
    }

    /// The first agent CLI found below `root`, nearest first.
    ///
    /// `root` itself is not considered: it is the session's own shell.
    pub fn detect_agent(&self, root: u32) -> Option<TerminalKind> {
        let mut seen = HashSet::from([root]);
        let mut queue: VecDeque<u32> = self.children_of(root).collect();

        while let Some(pid) = queue.pop_front() {
            if !seen.insert(pid) {
                continue;
            }
            if let Some(kind) = self
                .names
                .get(&pid)
                .and_then(|name| TerminalKind::from_process_name(name))
            {
                return Some(kind);
            }
            queue.extend(self.children_of(pid));
        }
        None
    }

    fn children_of(&self, pid: u32) -> impl Iterator<Item = u32> + '_ {
        self.children.get(&pid).into_iter().flatten().copied()
    }
}

/// Tracks which agent each session was last seen running.
pub struct ProcessScanner {
    system: System,
    known: HashMap<SessionId, TerminalKind>,
}

impl Default for ProcessScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessScanner {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            known: HashMap::new(),
        }
    }

    /// Refresh the process list and report changes for `sessions`
    /// (`(id, root pid)` pairs). Blocking; run off the async runtime.
    pub fn scan(&mut self, sessions: &[(SessionId, u32)]) -> Vec<BusEvent> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );
        let table = ProcessTable::from_system(&self.system);
        self.diff(&table, sessions)
    }

    pub fn diff(&mut self, table: &ProcessTable, sessions: &[(SessionId, u32)]) -> Vec<BusEvent> {
        let mut events = Vec::new();
        let live: HashSet<&str> = sessions.iter().map(|(id, _)| id.as_str()).collect();
        self.known.retain(|id, _| live.contains(id.as_str()));

        for (id, root) in sessions {
            let detected = table.detect_agent(*root);
            let previous = self.known.get(id).copied();
            if detected == previous {
                continue;
            }
            if let Some(agent) = previous {
                events.push(BusEvent::AgentExited {
                    id: id.clone(),
                    agent,
                });
            }
            match detected {
                Some(agent) => {
                    self.known.insert(id.clone(), agent);
                    events.push(BusEvent::AgentDetected {
                        id: id.clone(),
                        agent,
                    });
                }
                None => {
                    self.known.remove(id);
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(events: &[BusEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                BusEvent::AgentDetected { id, agent } => format!("+{id}:{}", agent.as_str()),
                BusEvent::AgentExited { id, agent } => format!("-{id}:{}", agent.as_str()),
                other => format!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_detect_nested_agent() {
        let table = ProcessTable::from_rows(&[
            (100, Some(1), "zsh"),
            (200, Some(100), "node"),
            (300, Some(200), "claude"),
            (400, Some(1), "codex"),
        ]);
        assert_eq!(table.detect_agent(100), Some(TerminalKind::Claude));
        assert_eq!(table.detect_agent(200), Some(TerminalKind::Claude));
        assert_eq!(table.detect_agent(300), None, "root itself is ignored");
        assert_eq!(table.detect_agent(999), None);
    }

    #[test]
    fn test_nearest_agent_wins() {
        let table = ProcessTable::from_rows(&[
            (10, Some(1), "bash"),
            (11, Some(10), "sh"),
            (12, Some(11), "gemini"),
            (13, Some(10), "opencode"),
        ]);
        assert_eq!(table.detect_agent(10), Some(TerminalKind::Opencode));
    }

    #[test]
    fn test_diff_reports_changes_only() {
        let mut scanner = ProcessScanner::new();
        let sessions = vec![("t1".to_string(), 100)];

        let shell_only = ProcessTable::from_rows(&[(100, None, "zsh")]);
        assert!(scanner.diff(&shell_only, &sessions).is_empty());

        let with_claude = ProcessTable::from_rows(&[(100, None, "zsh"), (101, Some(100), "claude")]);
        assert_eq!(summary(&scanner.diff(&with_claude, &sessions)), vec!["+t1:claude"]);
        assert!(scanner.diff(&with_claude, &sessions).is_empty());

        let with_codex = ProcessTable::from_rows(&[(100, None, "zsh"), (102, Some(100), "codex")]);
        assert_eq!(
            summary(&scanner.diff(&with_codex, &sessions)),
            vec!["-t1:claude", "+t1:codex"]
        );

        assert_eq!(summary(&scanner.diff(&shell_only, &sessions)), vec!["-t1:codex"]);
    }

    #[test]
    fn test_diff_forgets_removed_sessions() {
        let mut scanner = ProcessScanner::new();
        let table = ProcessTable::from_rows(&[(100, None, "sh"), (101, Some(100), "gemini")]);
        let sessions = vec![("t1".to_string(), 100)];
        assert_eq!(scanner.diff(&table, &sessions).len(), 1);

        // Session gone: no exit event, and a new session with the same id starts fresh.
        assert!(scanner.diff(&table, &[]).is_empty());
        assert_eq!(summary(&scanner.diff(&table, &sessions)), vec!["+t1:gemini"]);
    }

    #[test]
    fn test_scan_live_system() {
        let mut scanner = ProcessScanner::new();
        let own = std::process::id();
        assert!(scanner.scan(&[("self".to_string(), own)]).is_empty());
    }
}
