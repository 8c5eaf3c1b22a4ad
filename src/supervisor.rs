//! # Re-exec Supervisor
//!
//! Runs a dangerous action with reduced privileges by re-executing the
//! current binary as a restricted child.
//!
//! ## Process Model
//!
//! ```text
//! streamproc tar2ext4                 (unrestricted, full token)
//!   └─ streamproc --reexec tar2ext4   (restricted: only the keep-list)
//!        └─ action()                  (tar parsing, disk writes)
//! ```
//!
//! The parent never runs the action. It starts exactly one child, passes on
//! the standard streams and an explicit allow-listed environment, waits, and
//! returns the child's exit code. The child sees the `--reexec` marker and
//! runs the action directly.
//!
//! If the restricted context cannot be built the parent fails. There is no
//! fallback that runs the action unrestricted.

use crate::config::ProcessConfig;
use crate::constants::{EXIT_SUCCESS, REEXEC_FLAG};
use crate::error::Result;
use crate::privilege::ReExecConfig;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Which side of the re-exec boundary this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Initial invocation; must re-exec before doing work.
    Unrestricted,
    /// Re-executed child; runs the action.
    Restricted,
}

impl ExecMode {
    /// Derives the mode from the presence of the re-exec marker flag.
    pub fn from_reexec_flag(present: bool) -> Self {
        if present {
            Self::Restricted
        } else {
            Self::Unrestricted
        }
    }
}

/// Everything needed to start the restricted child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildInvocation {
    /// Executable to run (the current binary).
    pub program: PathBuf,
    /// Arguments, beginning with the re-exec marker.
    pub args: Vec<OsString>,
    /// Complete child environment.
    pub env: Vec<(String, String)>,
}

impl ChildInvocation {
    /// Returns true if the argument list carries the re-exec marker.
    pub fn has_reexec_flag(&self) -> bool {
        self.args.iter().any(|a| a == REEXEC_FLAG)
    }
}

/// Starts a child in a restricted security context and waits for it.
pub trait RestrictedLauncher {
    /// Builds the restricted context from `config`, runs `invocation` in it,
    /// and returns the child's exit code.
    fn launch(&self, config: &ReExecConfig, invocation: &ChildInvocation) -> Result<i32>;
}

impl<L: RestrictedLauncher + ?Sized> RestrictedLauncher for &L {
    fn launch(&self, config: &ReExecConfig, invocation: &ChildInvocation) -> Result<i32> {
        (**self).launch(config, invocation)
    }
}

/// Decides between re-executing and running the action.
#[derive(Debug)]
pub struct Supervisor<L> {
    config: ReExecConfig,
    mode: ExecMode,
    launcher: L,
}

impl<L: RestrictedLauncher> Supervisor<L> {
    /// Creates a supervisor.
    pub fn new(config: ReExecConfig, mode: ExecMode, launcher: L) -> Self {
        Self {
            config,
            mode,
            launcher,
        }
    }

    /// Returns this process's side of the boundary.
    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    /// Returns the privilege keep-list.
    pub fn config(&self) -> &ReExecConfig {
        &self.config
    }

    /// Builds the child invocation: `program --reexec args...` with only the
    /// forwarded environment.
    pub fn child_invocation(
        &self,
        program: &Path,
        args: &[OsString],
        process: &ProcessConfig,
    ) -> ChildInvocation {
        let args = std::iter::once(OsString::from(REEXEC_FLAG))
            .chain(args.iter().filter(|a| *a != REEXEC_FLAG).cloned())
            .collect();
        ChildInvocation {
            program: program.to_path_buf(),
            args,
            env: process.forwarded_env(),
        }
    }

    /// Runs `action` with reduced privileges.
    ///
    /// Unrestricted: spawns one restricted child and returns its exit code
    /// without running `action`. Restricted: runs `action` and returns 0.
    pub fn run_restricted<F>(
        &self,
        program: &Path,
        args: &[OsString],
        process: &ProcessConfig,
        action: F,
    ) -> Result<i32>
    where
        F: FnOnce() -> Result<()>,
    {
        match self.mode {
            ExecMode::Restricted => {
                debug!("running action in restricted context");
                action()?;
                Ok(EXIT_SUCCESS)
            }
            ExecMode::Unrestricted => {
                let invocation = self.child_invocation(program, args, process);
                info!(
                    program = %invocation.program.display(),
                    keep = ?self.config.keep(),
                    "re-executing with reduced privileges"
                );
                let code = self.launcher.launch(&self.config, &invocation)?;
                debug!(code, "restricted child exited");
                Ok(code)
            }
        }
    }
}
