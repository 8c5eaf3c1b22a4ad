//! # Payload Channel
//!
//! Fetches the serialized options payload from the single-use named channel
//! containerd creates for each stream processor invocation.
//!
//! ## Protocol
//!
//! ```text
//! containerd                                 streamproc
//!     │ create channel at $STREAM_PROCESSOR_PIPE   │
//!     │ spawn ───────────────────────────────────► │
//!     │ ◄───────────────────────────────── connect │  (bounded by DialContext)
//!     │ write envelope, close ───────────────────► │  read to EOF
//!     │                                            │  close
//! ```
//!
//! One connection carries exactly one message. There is no framing: the
//! message ends when the peer closes its end.
//!
//! ## Transports
//!
//! | Platform | Channel                    | Address                 |
//! |----------|----------------------------|-------------------------|
//! | Windows  | Named pipe (client side)   | `\\.\pipe\<name>`       |
//! | Unix     | Unix-domain stream socket  | Filesystem socket path  |
//!
//! ## Invariants
//!
//! - [`PayloadChannel::fetch`] consumes the channel, so the payload is read
//!   at most once per process.
//! - An unset address is not an error: it means no payload was supplied and
//!   `fetch` returns `Ok(None)`.
//! - A context that is already cancelled fails before any connection attempt.

use crate::config::ProcessConfig;
use crate::constants::{MAX_PAYLOAD_SIZE, PAYLOAD_DIAL_TIMEOUT};
use crate::error::{Error, Result};
use crate::payload::{PayloadType, decode_options};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::debug;

// =============================================================================
// Channel Handle
// =============================================================================

/// Address of a payload channel, as passed across the process boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelHandle {
    address: String,
}

impl ChannelHandle {
    /// Wraps a channel address.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    /// Returns the channel address.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl std::fmt::Display for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

// =============================================================================
// Dial Context
// =============================================================================

/// Deadline and cancellation signal bounding channel operations.
#[derive(Debug, Clone)]
pub struct DialContext {
    timeout: Duration,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`DialContext`] created alongside it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signals cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Default for DialContext {
    fn default() -> Self {
        Self::new(PAYLOAD_DIAL_TIMEOUT)
    }
}

impl DialContext {
    /// Creates a context that only times out.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            cancel: None,
        }
    }

    /// Creates a context plus the handle that cancels it.
    pub fn with_cancel(timeout: Duration) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                timeout,
                cancel: Some(rx),
            },
            CancelHandle { tx },
        )
    }

    /// Returns the per-operation timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns true if cancellation was signalled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolves once cancellation is signalled; never resolves otherwise.
    async fn cancelled(&self) {
        if let Some(rx) = &self.cancel {
            let mut rx = rx.clone();
            if rx.wait_for(|cancelled| *cancelled).await.is_ok() {
                return;
            }
        }
        std::future::pending::<()>().await
    }

    /// Runs `fut` unless the context is cancelled or the timeout elapses first.
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_cancelled() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }

        tokio::select! {
            biased;
            () = self.cancelled() => Err(Error::Cancelled {
                operation: operation.to_string(),
            }),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(Error::Timeout {
                    operation: operation.to_string(),
                    duration: self.timeout,
                }),
            },
        }
    }
}

// =============================================================================
// Payload Channel
// =============================================================================

/// The process's single-use options channel.
#[derive(Debug)]
pub struct PayloadChannel {
    handle: Option<ChannelHandle>,
}

impl PayloadChannel {
    /// Creates a channel for `handle`; `None` means no payload was supplied.
    pub fn new(handle: Option<ChannelHandle>) -> Self {
        Self { handle }
    }

    /// Creates the channel named by the process configuration.
    pub fn from_config(config: &ProcessConfig) -> Self {
        Self::new(config.payload_pipe.clone())
    }

    /// Returns the channel address, if any.
    pub fn handle(&self) -> Option<&ChannelHandle> {
        self.handle.as_ref()
    }

    /// Reads the raw payload bytes.
    ///
    /// Returns `Ok(None)` when no channel address was supplied. Otherwise
    /// connects within `ctx`, reads until the peer closes, and closes the
    /// connection on every path.
    pub async fn fetch(self, ctx: &DialContext) -> Result<Option<Vec<u8>>> {
        let Some(handle) = self.handle else {
            debug!("no payload channel configured");
            return Ok(None);
        };
        let address = handle.address;

        debug!(address = %address, "dialing payload channel");
        let stream = ctx
            .run("dial payload channel", async {
                transport::dial(&address)
                    .await
                    .map_err(|source| Error::ChannelDial {
                        address: address.clone(),
                        source,
                    })
            })
            .await?;

        let bytes = ctx
            .run("read payload channel", read_to_eof(stream, &address))
            .await?;

        debug!(address = %address, size = bytes.len(), "payload received");
        Ok(Some(bytes))
    }

    /// Reads the payload and decodes it as the options type `T`.
    pub async fn fetch_options<T: PayloadType>(self, ctx: &DialContext) -> Result<Option<T>> {
        match self.fetch(ctx).await? {
            Some(bytes) => decode_options(&bytes).map(Some),
            None => Ok(None),
        }
    }
}

/// Reads one message, rejecting anything over the payload cap.
async fn read_to_eof<S>(stream: S, address: &str) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    stream
        .take(MAX_PAYLOAD_SIZE as u64 + 1)
        .read_to_end(&mut buf)
        .await
        .map_err(|source| Error::ChannelRead {
            address: address.to_string(),
            source,
        })?;

    if buf.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::PayloadTooLarge {
            size: buf.len(),
            limit: MAX_PAYLOAD_SIZE,
        });
    }
    Ok(buf)
}

// =============================================================================
// Transports
// =============================================================================

#[cfg(windows)]
mod transport {
    use crate::constants::PIPE_BUSY_RETRY_INTERVAL;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeClient};
    use windows_sys::Win32::Foundation::ERROR_PIPE_BUSY;

    /// Opens the named pipe, waiting while the server has no free instance.
    pub(super) async fn dial(address: &str) -> std::io::Result<NamedPipeClient> {
        loop {
            match ClientOptions::new().open(address) {
                Ok(client) => return Ok(client),
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY as i32) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(PIPE_BUSY_RETRY_INTERVAL).await;
        }
    }
}

#[cfg(unix)]
mod transport {
    use tokio::net::UnixStream;

    /// Connects to the Unix-domain socket at `address`.
    pub(super) async fn dial(address: &str) -> std::io::Result<UnixStream> {
        UnixStream::connect(address).await
    }
}
