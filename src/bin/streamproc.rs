//! streamproc - containerd stream processor for Windows container layers
//!
//! ## Usage
//!
//! ```sh
//! streamproc tar2ext4 [--converter <PATH>]   # LCOW: tar -> ext4 VHD
//! streamproc wclayer                         # WCOW: tar -> layer directory
//! streamproc decompress                      # compressed tar -> plain tar
//! ```
//!
//! The layer is read from stdin. `STREAM_PROCESSOR_MEDIATYPE` and
//! `STREAM_PROCESSOR_PIPE` describe it. The process re-executes itself with
//! reduced privileges before touching the stream, and exits with the
//! restricted child's exit code.

use clap::Parser;
use std::ffi::OsString;
use streamproc::{
    Cli, DEFAULT_LOG_FILTER, Dispatcher, EXIT_FAILURE, ExecMode, PlatformLauncher, ProcessConfig,
    ReExecConfig, Result, Supervisor,
};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn init_tracing(level: Option<&str>) {
    let filter = level
        .and_then(|l| EnvFilter::try_new(l).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

fn run(cli: Cli) -> Result<i32> {
    let config = ProcessConfig::from_env();
    let program = std::env::current_exe()?;
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();

    let supervisor = Supervisor::new(
        ReExecConfig::default(),
        ExecMode::from_reexec_flag(cli.reexec),
        PlatformLauncher::default(),
    );
    let command = cli.command;
    supervisor.run_restricted(&program, &args, &config, || {
        Dispatcher::new(config.clone()).run(&command)
    })
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("streamproc: {}", e);
            std::process::exit(EXIT_FAILURE);
        }
    }
}
