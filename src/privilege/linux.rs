//! Linux backend: capabilities stand in for token privileges.
//!
//! The restricted child is a plain fork/exec of the same binary. Between fork
//! and exec the child:
//!
//! 1. sets `PR_SET_NO_NEW_PRIVS`, so exec can never regain privileges;
//! 2. asks to be killed when the supervising parent dies;
//! 3. drops deleted capabilities from the bounding set (only possible while
//!    `CAP_SETPCAP` is effective);
//! 4. clears the ambient set;
//! 5. shrinks the inheritable, effective and permitted sets to the keep-list.
//!
//! The parent process is single-threaded when it launches, so the capability
//! calls in the pre-exec hook do not race another thread's allocator lock.

use super::{ATTRIBUTE_ENABLED, Privilege, PrivilegeSource, ReExecConfig, compute_deletion_set};
use crate::constants::{EXIT_FAILURE, EXIT_SIGNAL_BASE};
use crate::error::{Error, Result};
use crate::supervisor::{ChildInvocation, RestrictedLauncher};
use caps::{CapSet, Capability, CapsHashSet};
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};

/// Reads the calling thread's capability sets.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapabilitySource;

impl PrivilegeSource for CapabilitySource {
    fn lookup(&self, name: &str) -> Result<Privilege> {
        let cap: Capability =
            name.to_ascii_uppercase()
                .parse()
                .map_err(|_| Error::UnknownPrivilege {
                    name: name.to_string(),
                })?;
        Ok(to_privilege(cap, 0))
    }

    fn held(&self) -> Result<Vec<Privilege>> {
        let permitted = read_set(CapSet::Permitted)?;
        let effective = read_set(CapSet::Effective)?;
        Ok(permitted
            .into_iter()
            .map(|cap| {
                let attributes = if effective.contains(&cap) {
                    ATTRIBUTE_ENABLED
                } else {
                    0
                };
                to_privilege(cap, attributes)
            })
            .collect())
    }
}

fn to_privilege(cap: Capability, attributes: u32) -> Privilege {
    Privilege::new(u64::from(cap.index()), cap.to_string(), attributes)
}

fn read_set(set: CapSet) -> Result<CapsHashSet> {
    caps::read(None, set).map_err(|e| Error::TokenQueryFailed {
        reason: format!("read {set:?} capabilities: {e}"),
    })
}

/// Maps privilege identities back to capabilities.
fn capabilities_for<'a>(privileges: impl IntoIterator<Item = &'a Privilege>) -> CapsHashSet {
    let all = caps::all();
    privileges
        .into_iter()
        .filter_map(|p| all.iter().copied().find(|c| u64::from(c.index()) == p.id))
        .collect()
}

/// Runs the child with every non-allow-listed capability removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CapabilityLauncher;

impl RestrictedLauncher for CapabilityLauncher {
    fn launch(&self, config: &ReExecConfig, invocation: &ChildInvocation) -> Result<i32> {
        let source = CapabilitySource;
        let deletions = compute_deletion_set(&source, config.keep())?;
        let held = source.held()?;

        let deleted = capabilities_for(&deletions);
        let retained: CapsHashSet = capabilities_for(&held)
            .into_iter()
            .filter(|c| !deleted.contains(c))
            .collect();
        let can_drop_bounding = read_set(CapSet::Effective)?.contains(&Capability::CAP_SETPCAP);
        if !can_drop_bounding && !deleted.is_empty() {
            warn!("CAP_SETPCAP not effective, bounding set left unchanged");
        }

        info!(
            deleted = deletions.len(),
            retained = retained.len(),
            "launching restricted child"
        );
        for p in &deletions {
            debug!(privilege = %p.name, "deleting capability");
        }

        let bounding: Vec<Capability> = deleted.iter().copied().collect();
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .env_clear()
            .envs(invocation.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        // SAFETY: the hook only issues prctl/capset syscalls and returns
        // preformatted errors; the parent holds no locks across fork.
        unsafe {
            cmd.pre_exec(move || restrict_current(&bounding, &retained, can_drop_bounding));
        }

        let mut child = cmd.spawn().map_err(|e| Error::SpawnFailed {
            program: invocation.program.display().to_string(),
            reason: e.to_string(),
        })?;
        debug!(pid = child.id(), "restricted child started");

        let status = child.wait().map_err(|e| Error::WaitFailed(e.to_string()))?;
        Ok(exit_code(status))
    }
}

fn restrict_current(
    bounding: &[Capability],
    retained: &CapsHashSet,
    can_drop_bounding: bool,
) -> io::Result<()> {
    let eperm = |_| io::Error::from_raw_os_error(libc::EPERM);

    // SAFETY: prctl with integer arguments has no memory effects.
    if unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: as above.
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }

    if can_drop_bounding {
        for cap in bounding {
            caps::drop(None, CapSet::Bounding, *cap).map_err(eperm)?;
        }
    }
    // Kernels without ambient capabilities have nothing to clear.
    let _ = caps::clear(None, CapSet::Ambient);

    caps::set(None, CapSet::Inheritable, retained).map_err(eperm)?;
    caps::set(None, CapSet::Effective, retained).map_err(eperm)?;
    caps::set(None, CapSet::Permitted, retained).map_err(eperm)?;
    Ok(())
}

/// Converts a wait status into the exit code to propagate.
///
/// Signal deaths map to `128 + signal`, the shell convention.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => EXIT_SIGNAL_BASE + signal,
        (None, None) => EXIT_FAILURE,
    }
}
