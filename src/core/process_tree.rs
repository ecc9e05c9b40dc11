//! The process-tree monitor.
//!
//! Polls `ps -eo pid,ppid,stat,lstart,command`, parses it with a fixed
//! regex contract (`LANG=C` is load-bearing — it keeps `lstart`'s
//! weekday/month names in fixed English form), extracts the transitive
//! descendants of the registered pids, and diffs against the previous
//! snapshot.
//!
//! This talks to `ps` directly rather than going through a general-purpose
//! process-listing crate: a GUI process inspector can tolerate some
//! normalization, but the exact textual contract here (defunct-row
//! suppression, a single joined `lstart` string, diff-against-previous
//! semantics) needs the raw output.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;

/// One row of `ps` output, after parsing.
///
/// `lstart` is kept as the single whitespace-joined timestamp string `ps`
/// prints (`Mon Jan 12 01:02:03 2024`) rather than split into components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub pid: String,
    pub ppid: String,
    pub stat: String,
    pub lstart: String,
    pub command: String,
}

impl Row {
    fn diff_line(&self, prefix: char) -> String {
        format!(
            "{prefix} {} {} {} {} {}",
            self.pid, self.ppid, self.stat, self.lstart, self.command
        )
    }
}

fn row_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\s*(\d+)\s+(\d+)\s+(\S+)\s+([A-Za-z]+\s+[A-Za-z]+\s+\d+\s+\d+:\d+:\d+\s+\d+)\s+(.*)",
        )
        .expect("process row regex is a fixed pattern")
    })
}

/// Parses raw `ps` stdout into pid -> Row, discarding unmatched lines (the
/// header) and defunct/zombie rows (`command` wrapped in parens).
fn parse_rows(output: &str) -> HashMap<String, Row> {
    let re = row_regex();
    let mut rows = HashMap::new();
    for line in output.lines() {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let command = caps[5].to_string();
        if command.starts_with('(') && command.ends_with(')') {
            log::debug!("poll: ignoring defunct row: {command}");
            continue;
        }
        let pid = caps[1].to_string();
        rows.insert(
            pid.clone(),
            Row {
                pid,
                ppid: caps[2].to_string(),
                stat: caps[3].to_string(),
                lstart: caps[4].to_string(),
                command,
            },
        );
    }
    rows
}

/// Builds the ppid -> [pid] child index over all parsed rows.
fn child_index(rows: &HashMap<String, Row>) -> HashMap<String, Vec<String>> {
    let mut children: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows.values() {
        children.entry(row.ppid.clone()).or_default().push(row.pid.clone());
    }
    children
}

/// Collects `pid` and its transitive descendants into `out`, guarding
/// against cycles (which a well-formed `ps -e` snapshot shouldn't produce,
/// but nothing promises that).
fn collect_subtree(
    pid: &str,
    rows: &HashMap<String, Row>,
    children: &HashMap<String, Vec<String>>,
    out: &mut HashMap<String, Row>,
) {
    if out.contains_key(pid) {
        return;
    }
    let Some(row) = rows.get(pid) else {
        return;
    };
    out.insert(pid.to_string(), row.clone());
    if let Some(kids) = children.get(pid) {
        for kid in kids {
            collect_subtree(kid, rows, children, out);
        }
    }
}

/// The union of the transitive descendants of every registered pid.
fn select_registered(rows: &HashMap<String, Row>, registered: &[i64]) -> HashMap<String, Row> {
    let children = child_index(rows);
    let mut out = HashMap::new();
    for pid in registered {
        collect_subtree(&pid.to_string(), rows, &children, &mut out);
    }
    out
}

/// Diffs `current` against `previous`, in three phases: additions, then
/// removals, then edits. Order *within* a phase is unspecified.
fn diff_snapshots(previous: &HashMap<String, Row>, current: &HashMap<String, Row>) -> Vec<String> {
    let mut lines = Vec::new();
    for (pid, row) in current {
        if !previous.contains_key(pid) {
            lines.push(row.diff_line('+'));
        }
    }
    for pid in previous.keys() {
        if !current.contains_key(pid) {
            lines.push(format!("- {pid}"));
        }
    }
    for (pid, row) in current {
        if let Some(prev) = previous.get(pid) {
            if prev != row {
                lines.push(row.diff_line('~'));
            }
        }
    }
    lines
}

/// Owns the registered set and the previous poll's snapshot.
pub struct Monitor {
    registered: Vec<i64>,
    last: HashMap<String, Row>,
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            registered: Vec::new(),
            last: HashMap::new(),
        }
    }

    /// Idempotent: re-registering an already-registered pid is a no-op.
    pub fn register(&mut self, pid: i64) {
        if !self.registered.contains(&pid) {
            self.registered.push(pid);
        }
    }

    pub fn deregister(&mut self, pid: i64) {
        self.registered.retain(|&p| p != pid);
    }

    /// Clears the registered set and the previous snapshot. The caller is
    /// responsible for also clearing the autopoll-armed flag.
    pub fn reset(&mut self) {
        self.registered.clear();
        self.last.clear();
    }

    /// Runs `ps -eo pid,ppid,stat,lstart,command` once, parses it, computes
    /// the diff against the last successful poll, and — only on success —
    /// replaces the stored snapshot. Returns `None` if `ps` could not be run
    /// or exited non-zero; the snapshot is left untouched in that case so no
    /// spurious diff appears on the next successful poll.
    pub async fn poll(&mut self) -> Option<Vec<String>> {
        let output = Command::new("ps")
            .args(["-eo", "pid,ppid,stat,lstart,command"])
            .env("LANG", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                log::warn!("poll: failed to spawn ps: {e}");
                return None;
            }
        };

        if !output.status.success() {
            log::warn!("poll: ps exited with {:?}", output.status.code());
            return None;
        }

        let text = String::from_utf8_lossy(&output.stdout);
        let rows = parse_rows(&text);
        let current = select_registered(&rows, &self.registered);
        let diff = diff_snapshots(&self.last, &current);
        self.last = current;
        Some(diff)
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS_OUTPUT: &str = "\
  PID  PPID STAT                 STARTED COMMAND
    1     0 Ss   Mon Jan  1 00:00:00 2024 /sbin/init
  100     1 Ss   Mon Jan  1 00:00:01 2024 /bin/bash
  101   100 S    Mon Jan  1 00:00:02 2024 sleep 100
  102     1 Z    Mon Jan  1 00:00:03 2024 (defunct)
";

    #[test]
    fn parse_rows_skips_header_and_defunct() {
        let rows = parse_rows(PS_OUTPUT);
        assert_eq!(rows.len(), 3);
        assert!(!rows.contains_key("102"));
        assert_eq!(rows["100"].command, "/bin/bash");
        assert_eq!(rows["100"].lstart, "Mon Jan  1 00:00:01 2024");
    }

    #[test]
    fn select_registered_includes_transitive_descendants() {
        let rows = parse_rows(PS_OUTPUT);
        let selected = select_registered(&rows, &[100]);
        assert_eq!(selected.len(), 2);
        assert!(selected.contains_key("100"));
        assert!(selected.contains_key("101"));
        assert!(!selected.contains_key("1"));
    }

    #[test]
    fn select_registered_is_the_union_of_all_roots() {
        let rows = parse_rows(PS_OUTPUT);
        let selected = select_registered(&rows, &[1, 100]);
        assert_eq!(selected.len(), 3);
    }

    #[test]
    fn diff_reports_additions_removals_and_edits_in_order() {
        let mut previous = HashMap::new();
        previous.insert(
            "1".to_string(),
            Row {
                pid: "1".into(),
                ppid: "0".into(),
                stat: "Ss".into(),
                lstart: "Mon Jan  1 00:00:00 2024".into(),
                command: "/sbin/init".into(),
            },
        );
        previous.insert(
            "2".to_string(),
            Row {
                pid: "2".into(),
                ppid: "1".into(),
                stat: "S".into(),
                lstart: "Mon Jan  1 00:00:01 2024".into(),
                command: "old".into(),
            },
        );

        let mut current = HashMap::new();
        current.insert(
            "1".to_string(),
            Row {
                pid: "1".into(),
                ppid: "0".into(),
                stat: "Z".into(), // edited
                lstart: "Mon Jan  1 00:00:00 2024".into(),
                command: "/sbin/init".into(),
            },
        );
        current.insert(
            "3".to_string(), // added
            Row {
                pid: "3".into(),
                ppid: "1".into(),
                stat: "R".into(),
                lstart: "Mon Jan  1 00:00:02 2024".into(),
                command: "new".into(),
            },
        );
        // "2" is removed.

        let diff = diff_snapshots(&previous, &current);
        assert_eq!(diff.len(), 3);
        assert!(diff[0].starts_with('+'));
        assert!(diff[1].starts_with("- 2"));
        assert!(diff[2].starts_with('~'));
    }

    #[test]
    fn empty_diff_when_snapshot_is_unchanged() {
        let rows = parse_rows(PS_OUTPUT);
        let snapshot = select_registered(&rows, &[1]);
        let diff = diff_snapshots(&snapshot, &snapshot.clone());
        assert!(diff.is_empty());
    }

    #[test]
    fn register_is_idempotent() {
        let mut monitor = Monitor::new();
        monitor.register(42);
        monitor.register(42);
        assert_eq!(monitor.registered, vec![42]);
        monitor.deregister(42);
        assert!(monitor.registered.is_empty());
    }

    #[test]
    fn reset_clears_registered_set_and_snapshot() {
        let mut monitor = Monitor::new();
        monitor.register(1);
        monitor.last.insert(
            "1".to_string(),
            Row {
                pid: "1".into(),
                ppid: "0".into(),
                stat: "S".into(),
                lstart: "Mon Jan  1 00:00:00 2024".into(),
                command: "x".into(),
            },
        );
        monitor.reset();
        assert!(monitor.registered.is_empty());
        assert!(monitor.last.is_empty());
    }
}
