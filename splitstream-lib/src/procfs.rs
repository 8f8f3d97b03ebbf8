//! Stateless snapshot queries against `/proc`.
//!
//! Every operation tolerates PIDs that disappear mid-enumeration: the
//! kernel may reap a process between `read_dir` and the follow-up read,
//! and a vanished entry is never an error here.

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

pub type Pid = i32;

/// Transitive descendant walks are bounded to guard against a transiently
/// inconsistent parent chain; a real process tree never gets this deep.
const MAX_DESCENDANT_DEPTH: usize = 32;

/// Abstraction over process-table queries.
///
/// Production code uses [`ProcFs`]. Tests use a stateful mock (see the
/// `mocks` module).
pub trait ProcOps: Send + Sync {
    /// All currently known PIDs.
    fn pids(&self) -> Vec<Pid>;

    /// Resolved executable path of `pid`, or an empty string when the
    /// process is gone, is a kernel thread, or the symlink is unreadable.
    fn path_for_pid(&self, pid: Pid) -> String;

    /// Parent PID of `pid`, if its status file is readable.
    fn parent_pid_of(&self, pid: Pid) -> Option<Pid>;

    /// Transitive closure of children of `pid`, excluding `pid` itself.
    fn descendants_of(&self, pid: Pid) -> Vec<Pid>;
}

/// Production [`ProcOps`] reading the procfs mount.
///
/// The root is relocatable so tests can point it at a fabricated tree.
#[derive(Clone, Debug)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/proc"),
        }
    }
}

impl ProcFs {
    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    fn status_ppid(content: &str) -> Option<Pid> {
        content
            .lines()
            .find_map(|line| line.strip_prefix("PPid:"))
            .and_then(|rest| rest.trim().parse().ok())
    }
}

impl ProcOps for ProcFs {
    fn pids(&self) -> Vec<Pid> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(%error, root = %self.root.display(), "unable to enumerate process table");
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.starts_with(|c: char| c.is_ascii_digit() && c != '0'))
            .filter_map(|name| name.parse().ok())
            .collect()
    }

    fn path_for_pid(&self, pid: Pid) -> String {
        match fs::read_link(self.root.join(pid.to_string()).join("exe")) {
            Ok(target) => target.to_string_lossy().into_owned(),
            Err(_) => String::new(),
        }
    }

    fn parent_pid_of(&self, pid: Pid) -> Option<Pid> {
        let content = fs::read_to_string(self.root.join(pid.to_string()).join("status")).ok()?;
        Self::status_ppid(&content)
    }

    fn descendants_of(&self, pid: Pid) -> Vec<Pid> {
        descendants_with(self, pid)
    }
}

/// Breadth-first walk of the child graph under `pid`.
///
/// Shared between the real probe and the mock so both honor the same
/// depth bound and revisit guard.
pub(crate) fn descendants_with<P: ProcOps + ?Sized>(ops: &P, pid: Pid) -> Vec<Pid> {
    let all = ops.pids();
    let mut seen: HashSet<Pid> = HashSet::from([pid]);
    let mut frontier = vec![pid];
    let mut found = Vec::new();

    for _ in 0..MAX_DESCENDANT_DEPTH {
        let next: Vec<Pid> = all
            .iter()
            .copied()
            .filter(|candidate| !seen.contains(candidate))
            .filter(|candidate| ops.parent_pid_of(*candidate).is_some_and(|parent| frontier.contains(&parent)))
            .collect();
        if next.is_empty() {
            break;
        }
        seen.extend(next.iter().copied());
        found.extend(next.iter().copied());
        frontier = next;
    }

    found
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::symlink;
    use std::path::Path;

    fn add_proc_entry(root: &Path, pid: Pid, exe: Option<&str>, ppid: Option<Pid>) -> anyhow::Result<()> {
        let dir = root.join(pid.to_string());
        fs::create_dir(&dir)?;
        if let Some(exe) = exe {
            symlink(exe, dir.join("exe"))?;
        }
        if let Some(ppid) = ppid {
            fs::write(dir.join("status"), format!("Name:\tfoo\nPPid:\t{ppid}\nThreads:\t1\n"))?;
        }
        Ok(())
    }

    #[test]
    fn enumerates_only_numeric_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        add_proc_entry(dir.path(), 1, None, None)?;
        add_proc_entry(dir.path(), 1234, None, None)?;
        fs::create_dir(dir.path().join("sys"))?;
        fs::write(dir.path().join("uptime"), "1.0 1.0")?;

        let probe = ProcFs::with_root(dir.path().to_path_buf());
        let mut pids = probe.pids();
        pids.sort_unstable();

        assert_eq!(pids, vec![1, 1234]);
        Ok(())
    }

    #[test]
    fn resolves_exe_and_is_silent_on_failure() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        add_proc_entry(dir.path(), 100, Some("/usr/bin/foo"), None)?;
        add_proc_entry(dir.path(), 200, None, None)?;

        let probe = ProcFs::with_root(dir.path().to_path_buf());
        assert_eq!(probe.path_for_pid(100), "/usr/bin/foo");
        // kernel thread / reaped process resolves to empty, not an error
        assert_eq!(probe.path_for_pid(200), "");
        assert_eq!(probe.path_for_pid(999), "");
        Ok(())
    }

    #[test]
    fn parses_ppid_from_status() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        add_proc_entry(dir.path(), 300, None, Some(1))?;
        add_proc_entry(dir.path(), 400, None, None)?;

        let probe = ProcFs::with_root(dir.path().to_path_buf());
        assert_eq!(probe.parent_pid_of(300), Some(1));
        assert_eq!(probe.parent_pid_of(400), None);
        assert_eq!(probe.parent_pid_of(999), None);
        Ok(())
    }

    #[test]
    fn walks_descendants_transitively() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        add_proc_entry(dir.path(), 1, None, None)?;
        add_proc_entry(dir.path(), 10, None, Some(1))?;
        add_proc_entry(dir.path(), 11, None, Some(10))?;
        add_proc_entry(dir.path(), 12, None, Some(11))?;
        add_proc_entry(dir.path(), 20, None, Some(1))?;
        add_proc_entry(dir.path(), 30, None, Some(2))?;

        let probe = ProcFs::with_root(dir.path().to_path_buf());
        let mut descendants = probe.descendants_of(10);
        descendants.sort_unstable();

        assert_eq!(descendants, vec![11, 12]);
        assert!(probe.descendants_of(12).is_empty());
        Ok(())
    }

    #[test]
    fn descendants_survive_a_parent_cycle() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        // transiently inconsistent snapshot: 50 and 51 claim each other
        add_proc_entry(dir.path(), 50, None, Some(51))?;
        add_proc_entry(dir.path(), 51, None, Some(50))?;

        let probe = ProcFs::with_root(dir.path().to_path_buf());
        assert_eq!(probe.descendants_of(50), vec![51]);
        Ok(())
    }
}
