//! Cgroup membership writes.
//!
//! Membership is changed by writing the decimal PID as ASCII into the
//! group's `cgroup.procs` file. A PID exists in exactly one cgroup per
//! hierarchy, so "removal" from a specialized group is expressed as a
//! write into the shared parent, which the kernel treats as a transfer.
//!
//! Every write recurses over the PID's descendants observed in `/proc`:
//! exec events are delivered for the exec'd PID only, and children forked
//! before a rule existed would otherwise stay behind in the old group.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::params::CgroupPaths;
use crate::procfs::{Pid, ProcOps};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cgroup procs file missing: {0}")]
    MissingProcsFile(PathBuf),
}

/// Abstraction over cgroup membership transfers.
///
/// Errors are absorbed here: a failed write leaves the PID where it was
/// and the next reconciliation pass retries. Production code uses
/// [`CgroupWriter`]. Tests use a stateful mock (see the `mocks` module).
pub trait CgroupOps: Send + Sync {
    /// Move `pid` and all of its current descendants into the cgroup
    /// behind `procs_file`.
    fn assign_with_descendants(&self, pid: Pid, procs_file: &Path);
}

/// Production [`CgroupOps`] writing through a [`ProcOps`] snapshot.
#[derive(Clone, Debug)]
pub struct CgroupWriter<P: ProcOps> {
    proc: P,
}

impl<P: ProcOps> CgroupWriter<P> {
    pub fn new(proc: P) -> Self {
        Self { proc }
    }

    fn write_pid(pid: Pid, procs_file: &Path) {
        let result = OpenOptions::new()
            .append(true)
            .open(procs_file)
            .and_then(|mut file| writeln!(file, "{pid}"));
        match result {
            Ok(()) => {}
            // the process was reaped between enumeration and write
            Err(error) if error.raw_os_error() == Some(libc::ESRCH) => {}
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(pid, procs_file = %procs_file.display(), "cgroup procs file not found");
            }
            Err(error) => {
                tracing::warn!(pid, %error, procs_file = %procs_file.display(), "failed to write pid to cgroup");
            }
        }
    }
}

impl<P: ProcOps> CgroupOps for CgroupWriter<P> {
    fn assign_with_descendants(&self, pid: Pid, procs_file: &Path) {
        Self::write_pid(pid, procs_file);
        for descendant in self.proc.descendants_of(pid) {
            Self::write_pid(descendant, procs_file);
        }
    }
}

/// Startup check that the pre-mounted hierarchy is actually in place.
pub fn verify_cgroup_setup(paths: &CgroupPaths) -> Result<(), Error> {
    for procs_file in [paths.exclusions_procs(), paths.vpn_only_procs(), paths.parent_procs()] {
        if !procs_file.is_file() {
            return Err(Error::MissingProcsFile(procs_file));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;
    use std::fs;

    use crate::mocks::MockProcOps;

    fn procs_file(dir: &Path) -> anyhow::Result<PathBuf> {
        let file = dir.join("cgroup.procs");
        fs::write(&file, "")?;
        Ok(file)
    }

    fn written_pids(file: &Path) -> anyhow::Result<HashSet<Pid>> {
        Ok(fs::read_to_string(file)?
            .lines()
            .map(|line| line.parse())
            .collect::<Result<_, _>>()?)
    }

    #[test]
    fn writes_pid_and_descendants() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = procs_file(dir.path())?;

        let proc = MockProcOps::new();
        proc.add_process(3000, "/usr/bin/foo", None);
        proc.add_process(3001, "/usr/bin/child", Some(3000));
        proc.add_process(3002, "/usr/bin/grandchild", Some(3001));
        proc.add_process(4000, "/usr/bin/other", None);

        let writer = CgroupWriter::new(proc);
        writer.assign_with_descendants(3000, &file);

        assert_eq!(written_pids(&file)?, HashSet::from([3000, 3001, 3002]));
        Ok(())
    }

    #[test]
    fn missing_procs_file_is_swallowed() {
        let writer = CgroupWriter::new(MockProcOps::new());
        // must not panic or error out
        writer.assign_with_descendants(1234, Path::new("/nonexistent/cgroup.procs"));
    }

    #[test]
    fn verify_setup_reports_missing_group() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = CgroupPaths {
            exclusions: dir.path().join("bypass"),
            vpn_only: dir.path().join("vpnonly"),
            parent: dir.path().to_path_buf(),
        };

        fs::create_dir(&paths.exclusions)?;
        fs::create_dir(&paths.vpn_only)?;
        procs_file(&paths.exclusions)?;
        procs_file(dir.path())?;

        // vpn-only group has no procs file yet
        assert!(matches!(
            verify_cgroup_setup(&paths),
            Err(Error::MissingProcsFile(path)) if path == paths.vpn_only_procs()
        ));

        procs_file(&paths.vpn_only)?;
        verify_cgroup_setup(&paths)?;
        Ok(())
    }
}
