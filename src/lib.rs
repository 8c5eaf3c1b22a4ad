//! # streamproc
//!
//! **Privilege-Restricted containerd Stream Processor**
//!
//! containerd hands layer diffs for Windows containers to a stream processor:
//! the layer tar arrives on stdin, the media type and the options channel
//! arrive through the environment. This crate turns that stream into the
//! Windows-native on-disk form. LCOW layers become an ext4 virtual disk and
//! WCOW layers become a layer directory.
//!
//! The tar stream is untrusted. Before a single byte of it is parsed, the
//! process re-executes itself with every privilege except an explicit
//! allow-list removed.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                  streamproc (unrestricted parent)                   │
//! │  ProcessConfig::from_env ─► Supervisor::run_restricted              │
//! │      privilege::compute_deletion_set(held \ keep)                   │
//! │      RestrictedLauncher: restricted token / capabilities            │
//! ├──────────────────────────────┬──────────────────────────────────────┤
//! │                              │ spawn exactly one child, wait        │
//! │                              ▼                                      │
//! │              streamproc --reexec (restricted child)                 │
//! │  ┌─────────────────────────────────────────────────────────────┐    │
//! │  │ Dispatcher                                                  │    │
//! │  │   PayloadChannel::fetch ─► Envelope ─► Tar2Ext4Options /    │    │
//! │  │                                        WcLayerImportOptions │    │
//! │  │   tar2ext4 ─► Ext4Converter ─► VHD                          │    │
//! │  │   wclayer  ─► LayerImporter ─► layer directory              │    │
//! │  │   decompress ─► stdout                                      │    │
//! │  │   drain stdin to EOF                                        │    │
//! │  └─────────────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Security Model
//!
//! | Boundary            | Protection                                         |
//! |---------------------|----------------------------------------------------|
//! | Privileges          | Allow-list only; unknown names fail closed         |
//! | Environment         | Child sees only forwarded variables                |
//! | Options channel     | Dial timeout, cancellation, 1 MiB cap              |
//! | Layer extraction    | Traversal rejection, size and entry-count limits   |
//! | Unsupported OS      | Launch fails; the action never runs unrestricted   |
//!
//! # Example
//!
//! ```rust,ignore
//! use streamproc::{Dispatcher, ProcessConfig, ProcessExt4Converter};
//!
//! let config = ProcessConfig::from_env();
//! let mut stdin = std::io::stdin().lock();
//! Dispatcher::new(config).tar2ext4(&mut stdin, &ProcessExt4Converter::new("tar2ext4"))?;
//! ```

pub mod channel;
pub mod cli;
pub mod config;
pub mod constants;
pub mod convert;
pub mod error;
pub mod mediatype;
pub mod payload;
pub mod privilege;
pub mod supervisor;

// Re-exports
pub use channel::{CancelHandle, ChannelHandle, DialContext, PayloadChannel};
pub use cli::{Cli, Command};
pub use config::ProcessConfig;
pub use constants::*;
pub use convert::{
    Dispatcher, DirectoryImporter, Ext4Converter, LayerImporter, ProcessExt4Converter,
    Tar2Ext4Option, ext4_options,
};
pub use error::{Error, Result};
pub use mediatype::{Compression, MediaType, add_extension};
pub use payload::{Envelope, OptionsPayload, PayloadType, Tar2Ext4Options, WcLayerImportOptions};
pub use privilege::{
    PlatformLauncher, Privilege, PrivilegeSource, ReExecConfig, compute_deletion_set,
};
pub use supervisor::{ChildInvocation, ExecMode, RestrictedLauncher, Supervisor};
