//! # Conversion Dispatcher
//!
//! Routes the layer stream on stdin to one conversion, configured by the
//! options payload.
//!
//! ## Flow
//!
//! ```text
//! Dispatcher::run(command)
//!   ├─ fetch options from the payload channel (before any conversion)
//!   ├─ tar2ext4:   create VHD ─► Ext4Converter ─► sync
//!   ├─ wclayer:    LayerImporter(root, parents)
//!   ├─ decompress: gzip/none ─► stdout
//!   └─ drain stdin to EOF (always)
//! ```
//!
//! ## Draining
//!
//! containerd writes the whole layer into our stdin and treats a closed
//! pipe as a failed unpack. Whatever happens, every remaining byte is read
//! and discarded before returning. When both the conversion and the drain
//! fail, the conversion error is reported.

mod decompress;
mod ext4;
mod wclayer;

pub use decompress::copy_decompressed;
pub use ext4::ProcessExt4Converter;
pub use wclayer::DirectoryImporter;

use crate::channel::{DialContext, PayloadChannel};
use crate::cli::Command;
use crate::config::ProcessConfig;
use crate::error::{Error, Result};
use crate::mediatype::MediaType;
use crate::payload::{PayloadType, Tar2Ext4Options, WcLayerImportOptions};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

// =============================================================================
// Ext4 Options
// =============================================================================

/// One option passed to the ext4 converter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tar2Ext4Option {
    /// Convert OCI whiteouts to overlay whiteouts.
    ConvertWhiteout,
    /// Append a VHD footer.
    AppendVhdFooter,
    /// Append a dm-verity hash tree.
    AppendDmVerity,
    /// Inline small file data.
    InlineData,
    /// Cap the disk size in bytes.
    MaximumDiskSize(i64),
}

impl Tar2Ext4Option {
    /// Renders the option as a converter command-line flag.
    pub fn to_arg(&self) -> String {
        match self {
            Self::ConvertWhiteout => "--convert-whiteout".to_string(),
            Self::AppendVhdFooter => "--append-vhd-footer".to_string(),
            Self::AppendDmVerity => "--append-dm-verity".to_string(),
            Self::InlineData => "--inline-data".to_string(),
            Self::MaximumDiskSize(size) => format!("--maximum-disk-size={size}"),
        }
    }
}

/// Translates payload options into converter options.
///
/// Boolean options appear only when true; the disk size only when non-zero.
pub fn ext4_options(options: &Tar2Ext4Options) -> Vec<Tar2Ext4Option> {
    let flags = [
        (options.convert_whiteout, Tar2Ext4Option::ConvertWhiteout),
        (options.append_vhd_footer, Tar2Ext4Option::AppendVhdFooter),
        (options.append_dm_verity, Tar2Ext4Option::AppendDmVerity),
        (options.inline_data, Tar2Ext4Option::InlineData),
    ];
    let mut out: Vec<_> = flags
        .into_iter()
        .filter_map(|(set, opt)| set.then_some(opt))
        .collect();
    if options.maximum_disk_size != 0 {
        out.push(Tar2Ext4Option::MaximumDiskSize(options.maximum_disk_size));
    }
    out
}

// =============================================================================
// Converter Seams
// =============================================================================

/// Writes an ext4 image built from a tar stream.
pub trait Ext4Converter {
    /// Converts `source` into `dest`.
    fn convert(
        &self,
        source: &mut dyn Read,
        dest: &mut File,
        options: &[Tar2Ext4Option],
    ) -> io::Result<()>;
}

/// Imports a tar stream as a Windows container layer.
pub trait LayerImporter {
    /// Imports `source` into `root` on top of `parents`, returning bytes written.
    fn import(&self, source: &mut dyn Read, root: &Path, parents: &[PathBuf]) -> Result<u64>;
}

// =============================================================================
// Conversions
// =============================================================================

/// Reads and discards `source` to EOF.
pub fn drain<R: Read>(source: &mut R) -> io::Result<u64> {
    io::copy(source, &mut io::sink())
}

/// Drains `source`, keeping `result` unless only the drain failed.
fn finish<R: Read, T>(source: &mut R, result: Result<T>) -> Result<T> {
    match (result, drain(source)) {
        (Ok(value), Ok(drained)) => {
            if drained > 0 {
                debug!(bytes = drained, "discarded trailing input");
            }
            Ok(value)
        }
        (Ok(_), Err(e)) => Err(Error::conversion("drain input stream", e)),
        (Err(e), drain_result) => {
            if let Err(drain_err) = drain_result {
                warn!(error = %drain_err, "failed to drain input after conversion error");
            }
            Err(e)
        }
    }
}

/// Converts a tar stream into the ext4 VHD named by `options.vhd_path`.
pub fn tar_to_ext4<R: Read>(
    source: &mut R,
    options: &Tar2Ext4Options,
    converter: &dyn Ext4Converter,
) -> Result<()> {
    if options.vhd_path.is_empty() {
        return Err(Error::MissingOption { option: "vhd_path" });
    }
    if options.maximum_disk_size < 0 {
        return Err(Error::InvalidOption {
            option: "maximum_disk_size",
            reason: format!("negative size {}", options.maximum_disk_size),
        });
    }

    let path = Path::new(&options.vhd_path);
    let mut file = File::create(path)
        .map_err(|e| Error::conversion(format!("create {}", path.display()), e))?;

    let opts = ext4_options(options);
    info!(vhd = %path.display(), options = ?opts, "converting tar stream to ext4");
    converter
        .convert(source, &mut file, &opts)
        .map_err(|e| Error::conversion("convert tar to ext4", e))?;

    file.sync_all()
        .map_err(|e| Error::conversion(format!("sync {}", path.display()), e))
}

/// Imports a tar stream as the Windows layer named by `options.root_path`.
pub fn import_layer<R: Read>(
    source: &mut R,
    options: &WcLayerImportOptions,
    importer: &dyn LayerImporter,
) -> Result<u64> {
    if options.root_path.is_empty() {
        return Err(Error::MissingOption { option: "root_path" });
    }
    let root = PathBuf::from(&options.root_path);
    let parents: Vec<PathBuf> = options.parents.iter().map(PathBuf::from).collect();

    info!(root = %root.display(), parents = parents.len(), "importing windows layer");
    let written = importer.import(source, &root, &parents)?;
    info!(root = %root.display(), bytes = written, "layer imported");
    Ok(written)
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Runs one conversion for this process.
///
/// Consumed by every conversion method, so the payload channel is read at
/// most once.
#[derive(Debug)]
pub struct Dispatcher {
    config: ProcessConfig,
    dial: DialContext,
}

impl Dispatcher {
    /// Creates a dispatcher with the default dial timeout.
    pub fn new(config: ProcessConfig) -> Self {
        Self::with_dial_context(config, DialContext::default())
    }

    /// Creates a dispatcher bounded by `dial`.
    pub fn with_dial_context(config: ProcessConfig, dial: DialContext) -> Self {
        Self { config, dial }
    }

    /// Returns the process configuration.
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Fetches and decodes the options payload; no payload yields defaults.
    fn fetch_options<T: PayloadType>(&self) -> Result<T> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let channel = PayloadChannel::from_config(&self.config);
        let options = runtime.block_on(channel.fetch_options::<T>(&self.dial))?;
        if options.is_none() {
            debug!(type_url = T::TYPE_URL, "no payload supplied, using default options");
        }
        Ok(options.unwrap_or_default())
    }

    /// Converts `source` to an ext4 VHD.
    pub fn tar2ext4<R: Read>(self, source: &mut R, converter: &dyn Ext4Converter) -> Result<()> {
        let result = self
            .fetch_options::<Tar2Ext4Options>()
            .and_then(|options| tar_to_ext4(source, &options, converter));
        finish(source, result)
    }

    /// Imports `source` as a Windows layer.
    pub fn wclayer<R: Read>(self, source: &mut R, importer: &dyn LayerImporter) -> Result<u64> {
        let result = self
            .fetch_options::<WcLayerImportOptions>()
            .and_then(|options| import_layer(source, &options, importer));
        finish(source, result)
    }

    /// Decompresses `source` into `sink` according to the media type.
    pub fn decompress<R: Read, W: Write>(self, source: &mut R, sink: &mut W) -> Result<u64> {
        let result = self
            .config
            .media_type
            .as_deref()
            .map(MediaType::parse)
            .transpose()
            .and_then(|mt| copy_decompressed(source, sink, mt.map(|m| m.compression())));
        finish(source, result)
    }

    /// Runs `command` against stdin, writing any stream output to stdout.
    pub fn run(self, command: &Command) -> Result<()> {
        info!(
            command = command.name(),
            media_type = self.config.media_type.as_deref().unwrap_or("<unset>"),
            "dispatching conversion"
        );
        if let Some(mt) = &self.config.media_type
            && let Err(e) = MediaType::parse(mt)
        {
            warn!(error = %e, "unrecognized media type");
        }

        let stdin = io::stdin();
        let mut input = stdin.lock();
        match command {
            Command::Tar2Ext4 { converter } => {
                self.tar2ext4(&mut input, &ProcessExt4Converter::new(converter))
            }
            Command::WcLayer => self
                .wclayer(&mut input, &DirectoryImporter::default())
                .map(|_| ()),
            Command::Decompress => {
                let stdout = io::stdout();
                let mut output = stdout.lock();
                self.decompress(&mut input, &mut output).map(|_| ())
            }
        }
    }
}
