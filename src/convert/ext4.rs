//! External tar-to-ext4 converter process.

use super::{Ext4Converter, Tar2Ext4Option};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

/// Runs a converter executable: tar on stdin, ext4 image on stdout.
#[derive(Debug, Clone)]
pub struct ProcessExt4Converter {
    program: PathBuf,
}

impl ProcessExt4Converter {
    /// Uses `program`, resolved on `PATH` when not absolute.
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
        }
    }

    /// Returns the converter executable.
    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Ext4Converter for ProcessExt4Converter {
    fn convert(
        &self,
        source: &mut dyn Read,
        dest: &mut File,
        options: &[Tar2Ext4Option],
    ) -> io::Result<()> {
        let args: Vec<String> = options.iter().map(Tar2Ext4Option::to_arg).collect();
        debug!(program = %self.program.display(), args = ?args, "starting ext4 converter");

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(dest.try_clone()?))
            .stderr(Stdio::inherit())
            .spawn()?;

        // Dropping stdin after the copy signals EOF to the converter.
        let copied = match child.stdin.take() {
            Some(mut stdin) => io::copy(source, &mut stdin),
            None => Ok(0),
        };
        let status = child.wait()?;

        if !status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {status}",
                self.program.display()
            )));
        }
        // A converter may stop at the end-of-archive marker and exit before
        // the trailing padding is written; the caller drains the remainder.
        match copied {
            Ok(bytes) => debug!(bytes, "ext4 converter finished"),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!("ext4 converter exited before end of input");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}
