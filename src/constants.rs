//! # Stream Processor Constants
//!
//! Defines the environment contract with containerd, protocol identifiers,
//! timeouts, and extraction limits for the stream processor. These constants
//! are the **single source of truth** for values that cross a process or
//! privilege boundary.
//!
//! ## Security Rationale
//!
//! The stream processor consumes an untrusted tar stream. Every bound here
//! limits how much damage a malicious layer or a misbehaving peer can do:
//! - The payload cap bounds memory spent on the options message
//! - The dial timeout bounds how long we wait on a peer that never answers
//! - Extraction limits bound disk and inode usage for layer import
//!
//! ## Cross-References
//!
//! - [`crate::config`]: Reads the environment variables declared here
//! - [`crate::channel`]: Uses the dial timeout and payload cap
//! - [`crate::supervisor`]: Uses the hidden re-exec flag and keep-list
//! - [`crate::convert`]: Uses extraction limits and media types

use std::time::Duration;

// =============================================================================
// Environment Contract
// =============================================================================
//
// containerd launches stream processors with the layer on stdin and two
// environment variables describing it. Both must be forwarded explicitly
// across the re-exec boundary; nothing else from the parent environment is.
// =============================================================================

/// Media type of the incoming stream, as configured in containerd.
pub const ENV_MEDIA_TYPE: &str = "STREAM_PROCESSOR_MEDIATYPE";

/// Address of the single-use named channel carrying the options payload.
///
/// On Windows this is a named pipe path (`\\.\pipe\...`); on Unix it is the
/// filesystem path of a Unix-domain stream socket.
pub const ENV_PAYLOAD_PIPE: &str = "STREAM_PROCESSOR_PIPE";

/// Log filter variable, forwarded so the restricted child logs identically.
pub const ENV_LOG_FILTER: &str = "RUST_LOG";

/// Log filter used when neither `--log-level` nor `RUST_LOG` is set.
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Executable search path, forwarded so the child can locate converters.
pub const ENV_SEARCH_PATH: &str = "PATH";

/// Variables Windows processes cannot start without.
///
/// **Rationale**: A process created with an environment block that lacks
/// `SYSTEMROOT` fails to load several system DLLs (notably Winsock).
#[cfg(windows)]
pub const CRITICAL_ENV: &[&str] = &["SYSTEMROOT"];

/// Variables Windows processes cannot start without (none on Unix).
#[cfg(not(windows))]
pub const CRITICAL_ENV: &[&str] = &[];

// =============================================================================
// Re-exec Boundary
// =============================================================================

/// Hidden flag marking a process that already runs with reduced privileges.
///
/// Only the supervisor sets it when spawning its child. It is not part of the
/// documented command-line surface.
pub const REEXEC_FLAG: &str = "--reexec";

/// Privileges retained by the restricted child on Windows.
///
/// `SeChangeNotifyPrivilege` (bypass traverse checking) is needed to open
/// paths whose intermediate directories the caller cannot list.
#[cfg(windows)]
pub const DEFAULT_KEEP_PRIVILEGES: &[&str] = &["SeChangeNotifyPrivilege"];

/// Capabilities retained by the restricted child on Unix.
///
/// Linux has no capability equivalent of traverse checking, so everything is
/// dropped.
#[cfg(not(windows))]
pub const DEFAULT_KEEP_PRIVILEGES: &[&str] = &[];

// =============================================================================
// Payload Channel
// =============================================================================

/// Timeout for connecting to the payload channel (10 seconds).
///
/// **Security**: containerd creates the channel before starting us, so a
/// connection that takes longer indicates a missing or hostile peer.
pub const PAYLOAD_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between attempts while a named pipe server reports busy.
pub const PIPE_BUSY_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Maximum options payload size (1 MiB).
///
/// **Security**: Options messages are a few hundred bytes. The cap prevents a
/// peer from making us buffer an unbounded message before decoding.
pub const MAX_PAYLOAD_SIZE: usize = 1024 * 1024;

// =============================================================================
// Payload Type URLs
// =============================================================================
//
// The envelope follows protobuf `Any`: a type URL naming the message plus the
// encoded message bytes.
// =============================================================================

/// Prefix shared by all payload type URLs.
pub const TYPE_URL_PREFIX: &str = "type.googleapis.com/";

/// Type URL of the ext4 conversion options.
pub const TAR2EXT4_OPTIONS_TYPE_URL: &str = "type.googleapis.com/streamproc.v1.Tar2Ext4Options";

/// Type URL of the Windows layer import options.
pub const WCLAYER_IMPORT_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/streamproc.v1.WcLayerImportOptions";

// =============================================================================
// Media Types
// =============================================================================
//
// Reference: <https://github.com/opencontainers/image-spec/blob/main/media-types.md>
// =============================================================================

/// OCI layer media type (uncompressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// OCI layer media type (gzip-compressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI layer media type (zstd-compressed tar archive).
pub const OCI_LAYER_MEDIA_TYPE_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";

/// Layer converted to a virtual hard disk.
pub const MICROSOFT_LAYER_MEDIA_TYPE_VHD: &str = "application/vnd.microsoft.image.layer.v1.vhd";

/// Extension marking a Linux-container-on-Windows layer.
pub const EXTENSION_LCOW: &str = "lcow";

/// Extension marking a Windows-container-on-Windows layer.
pub const EXTENSION_WCOW: &str = "wcow";

/// Extension marking a layer intended for a hypervisor-isolated container.
pub const EXTENSION_ISOLATED: &str = "isolated";

/// Compression extension for gzip streams.
pub const EXTENSION_GZIP: &str = "gzip";

/// Compression extension for zstd streams.
pub const EXTENSION_ZSTD: &str = "zstd";

// =============================================================================
// Conversion
// =============================================================================

/// Default executable used for tar to ext4 conversion (resolved on `PATH`).
pub const DEFAULT_EXT4_CONVERTER: &str = "tar2ext4";

/// Maximum total bytes extracted into a layer directory (64 GiB).
///
/// **Security**: Bounds disk usage from compression bombs. Windows base
/// layers are large (tens of GiB uncompressed), so the limit is generous.
pub const MAX_LAYER_EXTRACT_SIZE: u64 = 64 * 1024 * 1024 * 1024;

/// Maximum number of entries per layer during import.
///
/// **Security**: Prevents inode exhaustion from layers holding millions of
/// tiny files.
pub const MAX_ENTRIES_PER_LAYER: usize = 1_000_000;

/// Prefix of OCI whiteout files.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Name of the opaque directory whiteout marker.
pub const WHITEOUT_OPAQUE: &str = ".wh..wh..opq";

// =============================================================================
// Exit Codes
// =============================================================================

/// Successful conversion.
pub const EXIT_SUCCESS: i32 = 0;

/// Generic failure (conversion, payload, or privilege setup error).
pub const EXIT_FAILURE: i32 = 1;

/// Offset added to a signal number when a child dies from a signal.
pub const EXIT_SIGNAL_BASE: i32 = 128;
