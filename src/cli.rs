//! Command-line surface.
//!
//! containerd invokes the stream processor with the configured arguments; the
//! layer arrives on stdin and the options through the payload channel. The
//! hidden `--reexec` flag is only ever set by the supervisor on its child.

use crate::constants::DEFAULT_EXT4_CONVERTER;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Privilege-restricted containerd stream processor.
#[derive(Debug, Parser)]
#[command(name = "streamproc", version, about, long_about = None)]
pub struct Cli {
    /// Marks the restricted child process.
    #[arg(long = "reexec", hide = true, global = true)]
    pub reexec: bool,

    /// Log filter (overrides RUST_LOG), e.g. `debug` or `streamproc=trace`.
    #[arg(long, global = true, value_name = "FILTER")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// Conversions the stream processor can perform.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Convert a tar layer into an ext4 virtual disk (LCOW).
    #[command(name = "tar2ext4")]
    Tar2Ext4 {
        /// ext4 converter executable.
        #[arg(long, value_name = "PATH", default_value = DEFAULT_EXT4_CONVERTER)]
        converter: PathBuf,
    },

    /// Import a tar layer as a Windows container layer directory (WCOW).
    #[command(name = "wclayer")]
    WcLayer,

    /// Decompress a layer stream onto stdout.
    Decompress,
}

impl Command {
    /// Returns the subcommand name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Tar2Ext4 { .. } => "tar2ext4",
            Self::WcLayer => "wclayer",
            Self::Decompress => "decompress",
        }
    }
}
