//! # Options Payload Envelope
//!
//! Conversion options reach the stream processor as a self-describing
//! envelope, wire-compatible with protobuf `Any`:
//!
//! ```text
//! Envelope {
//!     type_url: "type.googleapis.com/streamproc.v1.Tar2Ext4Options",  // field 1
//!     value:    <encoded Tar2Ext4Options>                              // field 2
//! }
//! ```
//!
//! The set of options messages is closed. [`OptionsPayload`] is the tagged
//! union over it, and decoding never falls back to a default variant: an
//! unknown type URL is [`Error::UnknownPayloadType`], and asking for one
//! message while the envelope holds another is
//! [`Error::InvalidPayloadType`].

use crate::constants::{
    MAX_PAYLOAD_SIZE, TAR2EXT4_OPTIONS_TYPE_URL, WCLAYER_IMPORT_OPTIONS_TYPE_URL,
};
use crate::error::{Error, Result};
use prost::Message;

// =============================================================================
// Wire Messages
// =============================================================================

/// Self-describing envelope (protobuf `Any` layout).
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Names the message held in `value`.
    #[prost(string, tag = "1")]
    pub type_url: String,
    /// Encoded message bytes.
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Options for converting a tar stream into an ext4 virtual disk.
#[derive(Clone, PartialEq, Message)]
pub struct Tar2Ext4Options {
    /// Convert OCI whiteout files into overlay whiteouts.
    #[prost(bool, tag = "1")]
    pub convert_whiteout: bool,
    /// Append a fixed VHD footer so the file attaches as a disk.
    #[prost(bool, tag = "2")]
    pub append_vhd_footer: bool,
    /// Append a dm-verity hash tree.
    #[prost(bool, tag = "3")]
    pub append_dm_verity: bool,
    /// Store small file contents inline in inodes.
    #[prost(bool, tag = "4")]
    pub inline_data: bool,
    /// Upper bound for the disk size in bytes; 0 uses the converter default.
    #[prost(int64, tag = "5")]
    pub maximum_disk_size: i64,
    /// Destination virtual disk path.
    #[prost(string, tag = "6")]
    pub vhd_path: String,
}

/// Options for importing a tar stream as a Windows container layer.
#[derive(Clone, PartialEq, Message)]
pub struct WcLayerImportOptions {
    /// Destination layer directory.
    #[prost(string, tag = "1")]
    pub root_path: String,
    /// Parent layer directories, nearest parent first.
    #[prost(string, repeated, tag = "2")]
    pub parents: Vec<String>,
}

// =============================================================================
// Typed Payloads
// =============================================================================

/// A message that can travel inside an [`Envelope`].
pub trait PayloadType: Message + Default + Sized {
    /// Type URL written into the envelope.
    const TYPE_URL: &'static str;
}

impl PayloadType for Tar2Ext4Options {
    const TYPE_URL: &'static str = TAR2EXT4_OPTIONS_TYPE_URL;
}

impl PayloadType for WcLayerImportOptions {
    const TYPE_URL: &'static str = WCLAYER_IMPORT_OPTIONS_TYPE_URL;
}

impl Envelope {
    /// Wraps a message with its type URL.
    pub fn pack<T: PayloadType>(message: &T) -> Self {
        Self {
            type_url: T::TYPE_URL.to_string(),
            value: message.encode_to_vec(),
        }
    }

    /// Decodes an envelope from raw channel bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::PayloadTooLarge {
                size: bytes.len(),
                limit: MAX_PAYLOAD_SIZE,
            });
        }
        Self::decode(bytes).map_err(|e| Error::MalformedPayload(format!("envelope: {e}")))
    }

    /// Encodes the envelope for the channel.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decodes the held message as `T`, failing if the type URL differs.
    pub fn unpack<T: PayloadType>(&self) -> Result<T> {
        if self.type_url != T::TYPE_URL {
            return Err(Error::InvalidPayloadType {
                expected: T::TYPE_URL.to_string(),
                actual: self.type_url.clone(),
            });
        }
        T::decode(self.value.as_slice())
            .map_err(|e| Error::MalformedPayload(format!("{}: {e}", self.type_url)))
    }
}

/// Closed set of options messages.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionsPayload {
    /// ext4 conversion options.
    Tar2Ext4(Tar2Ext4Options),
    /// Windows layer import options.
    WcLayerImport(WcLayerImportOptions),
}

impl OptionsPayload {
    /// Resolves an envelope by its type tag.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self> {
        match envelope.type_url.as_str() {
            TAR2EXT4_OPTIONS_TYPE_URL => Ok(Self::Tar2Ext4(envelope.unpack()?)),
            WCLAYER_IMPORT_OPTIONS_TYPE_URL => Ok(Self::WcLayerImport(envelope.unpack()?)),
            other => Err(Error::UnknownPayloadType(other.to_string())),
        }
    }

    /// Decodes raw channel bytes into the tagged union.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::from_envelope(&Envelope::from_bytes(bytes)?)
    }

    /// Wraps the payload in an envelope.
    pub fn to_envelope(&self) -> Envelope {
        match self {
            Self::Tar2Ext4(opts) => Envelope::pack(opts),
            Self::WcLayerImport(opts) => Envelope::pack(opts),
        }
    }

    /// Returns the type URL of the held message.
    pub fn type_url(&self) -> &'static str {
        match self {
            Self::Tar2Ext4(_) => Tar2Ext4Options::TYPE_URL,
            Self::WcLayerImport(_) => WcLayerImportOptions::TYPE_URL,
        }
    }
}

/// Decodes raw channel bytes directly into the options type a command expects.
pub fn decode_options<T: PayloadType>(bytes: &[u8]) -> Result<T> {
    Envelope::from_bytes(bytes)?.unpack()
}

/// Encodes options into envelope bytes, as containerd's side of the channel does.
pub fn encode_options<T: PayloadType>(options: &T) -> Vec<u8> {
    Envelope::pack(options).to_bytes()
}
