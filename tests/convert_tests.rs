//! Tests for the conversion dispatcher and the default converters.
//!
//! Includes security tests for layer import:
//! - Path traversal protection
//! - Whiteout handling against parent layers
//! - Size and entry-count limits

use std::cell::RefCell;
use std::fs::{self, File};
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use streamproc::convert::{drain, import_layer, tar_to_ext4};
use streamproc::{
    DirectoryImporter, Dispatcher, Error, Ext4Converter, LayerImporter, ProcessConfig,
    Tar2Ext4Option, Tar2Ext4Options, WcLayerImportOptions, ext4_options,
};
use tempfile::TempDir;

// =============================================================================
// Fakes
// =============================================================================

/// Records the options it was given and consumes up to `consume` bytes.
struct RecordingConverter {
    consume: usize,
    fail: bool,
    seen: RefCell<Option<Vec<Tar2Ext4Option>>>,
}

impl RecordingConverter {
    fn new(consume: usize, fail: bool) -> Self {
        Self {
            consume,
            fail,
            seen: RefCell::new(None),
        }
    }
}

impl Ext4Converter for RecordingConverter {
    fn convert(
        &self,
        source: &mut dyn Read,
        dest: &mut File,
        options: &[Tar2Ext4Option],
    ) -> io::Result<()> {
        *self.seen.borrow_mut() = Some(options.to_vec());
        let mut buf = vec![0u8; self.consume];
        let n = source.read(&mut buf)?;
        dest.write_all(&buf[..n])?;
        if self.fail {
            return Err(io::Error::other("converter crashed"));
        }
        Ok(())
    }
}

/// Consumes nothing and succeeds.
struct NoopImporter;

impl LayerImporter for NoopImporter {
    fn import(
        &self,
        _source: &mut dyn Read,
        _root: &Path,
        _parents: &[PathBuf],
    ) -> streamproc::Result<u64> {
        Ok(0)
    }
}

fn input(len: usize) -> Cursor<Vec<u8>> {
    Cursor::new((0..len).map(|i| (i % 251) as u8).collect())
}

fn fully_consumed(cursor: &Cursor<Vec<u8>>) -> bool {
    cursor.position() as usize == cursor.get_ref().len()
}

fn ext4_opts(dir: &TempDir, maximum_disk_size: i64) -> Tar2Ext4Options {
    Tar2Ext4Options {
        maximum_disk_size,
        vhd_path: dir.path().join("layer.vhd").to_string_lossy().into_owned(),
        ..Default::default()
    }
}

// =============================================================================
// Option Translation
// =============================================================================

#[test]
fn test_zero_disk_size_passes_no_limit() {
    let dir = TempDir::new().unwrap();
    let converter = RecordingConverter::new(16, false);
    tar_to_ext4(&mut input(64), &ext4_opts(&dir, 0), &converter).unwrap();

    let seen = converter.seen.borrow().clone().unwrap();
    assert!(
        !seen
            .iter()
            .any(|o| matches!(o, Tar2Ext4Option::MaximumDiskSize(_)))
    );
}

#[test]
fn test_disk_size_passed_through_exactly() {
    let dir = TempDir::new().unwrap();
    let converter = RecordingConverter::new(16, false);
    tar_to_ext4(&mut input(64), &ext4_opts(&dir, 1_073_741_824), &converter).unwrap();

    let seen = converter.seen.borrow().clone().unwrap();
    assert!(seen.contains(&Tar2Ext4Option::MaximumDiskSize(1_073_741_824)));
}

#[test]
fn test_boolean_options_only_when_set() {
    let opts = Tar2Ext4Options {
        convert_whiteout: true,
        inline_data: true,
        ..Default::default()
    };
    assert_eq!(
        ext4_options(&opts),
        vec![Tar2Ext4Option::ConvertWhiteout, Tar2Ext4Option::InlineData]
    );
    assert!(ext4_options(&Tar2Ext4Options::default()).is_empty());
}

#[test]
fn test_converter_output_lands_in_vhd() {
    let dir = TempDir::new().unwrap();
    let opts = ext4_opts(&dir, 0);
    tar_to_ext4(&mut input(8), &opts, &RecordingConverter::new(8, false)).unwrap();
    assert_eq!(fs::read(&opts.vhd_path).unwrap().len(), 8);
}

#[test]
fn test_missing_vhd_path() {
    let err = tar_to_ext4(
        &mut input(8),
        &Tar2Ext4Options::default(),
        &RecordingConverter::new(8, false),
    )
    .unwrap_err();
    assert!(matches!(err, Error::MissingOption { option: "vhd_path" }));
}

#[test]
fn test_negative_disk_size_rejected() {
    let dir = TempDir::new().unwrap();
    let err = tar_to_ext4(&mut input(8), &ext4_opts(&dir, -1), &RecordingConverter::new(8, false))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOption { .. }));
}

#[test]
fn test_converter_failure_names_operation() {
    let dir = TempDir::new().unwrap();
    let err = tar_to_ext4(&mut input(8), &ext4_opts(&dir, 0), &RecordingConverter::new(8, true))
        .unwrap_err();
    assert!(err.to_string().contains("convert tar to ext4"), "got {err}");
}

// =============================================================================
// External Converter Process
// =============================================================================

#[cfg(unix)]
mod process_converter {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use streamproc::ProcessExt4Converter;

    // Writing an executable while another test forks can leave the write
    // handle open in the child and fail the exec with ETXTBSY.
    static SPAWN: Mutex<()> = Mutex::new(());

    fn script(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("fake-tar2ext4");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn run(
        body: &str,
        opts: &Tar2Ext4Options,
        data: &mut Cursor<Vec<u8>>,
        dir: &TempDir,
    ) -> streamproc::Result<()> {
        let _guard = SPAWN.lock().unwrap_or_else(|e| e.into_inner());
        let converter = ProcessExt4Converter::new(script(dir, body));
        tar_to_ext4(data, opts, &converter)
    }

    #[test]
    fn test_flags_on_argv_and_output_in_vhd() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args");
        let body = format!("printf '%s\\n' \"$@\" > '{}'\ncat", args_file.display());
        let opts = Tar2Ext4Options {
            convert_whiteout: true,
            append_vhd_footer: true,
            ..ext4_opts(&dir, 1_073_741_824)
        };

        let mut data = input(4096);
        run(&body, &opts, &mut data, &dir).unwrap();

        let args = fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args.lines().collect::<Vec<_>>(),
            [
                "--convert-whiteout",
                "--append-vhd-footer",
                "--maximum-disk-size=1073741824"
            ]
        );
        assert_eq!(fs::read(&opts.vhd_path).unwrap(), *data.get_ref());
    }

    #[test]
    fn test_nonzero_exit_is_conversion_error() {
        let dir = TempDir::new().unwrap();
        let mut data = input(4096);
        let err = run("cat >/dev/null\nexit 3", &ext4_opts(&dir, 0), &mut data, &dir).unwrap_err();

        assert!(err.to_string().contains("convert tar to ext4"), "got {err}");
        assert!(fully_consumed(&data));
    }

    #[test]
    fn test_early_successful_exit_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let mut data = input(4 << 20);
        run("head -c 512 >/dev/null\nexit 0", &ext4_opts(&dir, 0), &mut data, &dir).unwrap();

        assert!(fully_consumed(&data), "trailing input drained");
    }

    #[test]
    fn test_missing_program_fails() {
        let dir = TempDir::new().unwrap();
        let converter = ProcessExt4Converter::new(dir.path().join("no-such-converter"));
        let err = tar_to_ext4(&mut input(8), &ext4_opts(&dir, 0), &converter).unwrap_err();
        assert!(err.to_string().contains("convert tar to ext4"), "got {err}");
    }
}

// =============================================================================
// Draining
// =============================================================================

#[test]
fn test_stdin_drained_regardless_of_outcome() {
    let dir = TempDir::new().unwrap();
    let mut source = input(10_000);
    let converter = RecordingConverter::new(100, false);

    // No payload channel: defaults carry an empty vhd_path, so the
    // conversion fails and the input must still be drained.
    let err = Dispatcher::new(ProcessConfig::default())
        .tar2ext4(&mut source, &converter)
        .unwrap_err();
    assert!(matches!(err, Error::MissingOption { .. }));
    assert!(fully_consumed(&source));

    // Direct conversion with a path succeeds and leaves the rest for drain.
    let mut source = input(10_000);
    tar_to_ext4(&mut source, &ext4_opts(&dir, 0), &converter).unwrap();
    assert!(!fully_consumed(&source));
    drain(&mut source).unwrap();
    assert!(fully_consumed(&source));
}

#[test]
fn test_stdin_drained_after_importer_returns() {
    let mut source = input(4096);
    let err = Dispatcher::new(ProcessConfig::default())
        .wclayer(&mut source, &NoopImporter)
        .unwrap_err();
    assert!(matches!(err, Error::MissingOption { option: "root_path" }));
    assert!(fully_consumed(&source));
}

#[test]
fn test_decompress_passthrough_drains() {
    let config = ProcessConfig {
        media_type: Some("application/vnd.oci.image.layer.v1.tar".to_string()),
        ..Default::default()
    };
    let mut source = input(5000);
    let mut out: Vec<u8> = Vec::new();
    let written = Dispatcher::new(config)
        .decompress(&mut source, &mut out)
        .unwrap();
    assert_eq!(written, 5000);
    assert_eq!(out, source.get_ref().clone());
    assert!(fully_consumed(&source));
}

#[test]
fn test_decompress_gzip_sniffed() {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(b"plain tar bytes").unwrap();
    let compressed = encoder.finish().unwrap();

    let mut source = Cursor::new(compressed);
    let mut out: Vec<u8> = Vec::new();
    Dispatcher::new(ProcessConfig::default())
        .decompress(&mut source, &mut out)
        .unwrap();
    assert_eq!(out, b"plain tar bytes");
    assert!(fully_consumed(&source));
}

#[test]
fn test_decompress_zstd_unsupported_still_drains() {
    let config = ProcessConfig {
        media_type: Some("application/vnd.oci.image.layer.v1.tar+zstd".to_string()),
        ..Default::default()
    };
    let mut source = input(300);
    let err = Dispatcher::new(config)
        .decompress(&mut source, &mut Vec::<u8>::new())
        .unwrap_err();
    assert!(matches!(err, Error::UnsupportedCompression(_)));
    assert!(fully_consumed(&source));
}

// =============================================================================
// Payload-Driven Dispatch
// =============================================================================

#[cfg(unix)]
mod payload {
    use super::*;
    use std::os::unix::net::UnixListener;
    use std::thread::JoinHandle;
    use streamproc::payload::encode_options;
    use streamproc::{ChannelHandle, PayloadType};

    fn serve_once<T: PayloadType>(dir: &TempDir, options: &T) -> (ChannelHandle, JoinHandle<()>) {
        let path = dir.path().join("payload.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let bytes = encode_options(options);
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&bytes).unwrap();
        });
        (ChannelHandle::new(path.to_string_lossy()), server)
    }

    #[test]
    fn test_tar2ext4_uses_payload_options() {
        let dir = TempDir::new().unwrap();
        let options = ext4_opts(&dir, 1_073_741_824);
        let (handle, server) = serve_once(&dir, &options);
        let config = ProcessConfig {
            payload_pipe: Some(handle),
            ..Default::default()
        };

        let converter = RecordingConverter::new(10, false);
        let mut source = input(1000);
        Dispatcher::new(config)
            .tar2ext4(&mut source, &converter)
            .unwrap();
        server.join().unwrap();

        assert!(
            converter
                .seen
                .borrow()
                .as_ref()
                .unwrap()
                .contains(&Tar2Ext4Option::MaximumDiskSize(1_073_741_824))
        );
        assert!(Path::new(&options.vhd_path).exists());
        assert!(fully_consumed(&source));
    }

    #[test]
    fn test_wrong_payload_type_fails_before_conversion() {
        let dir = TempDir::new().unwrap();
        let (handle, server) = serve_once(&dir, &WcLayerImportOptions::default());
        let config = ProcessConfig {
            payload_pipe: Some(handle),
            ..Default::default()
        };

        let converter = RecordingConverter::new(10, false);
        let mut source = input(100);
        let err = Dispatcher::new(config)
            .tar2ext4(&mut source, &converter)
            .unwrap_err();
        server.join().unwrap();

        assert!(matches!(err, Error::InvalidPayloadType { .. }));
        assert!(converter.seen.borrow().is_none(), "converter must not run");
        assert!(fully_consumed(&source));
    }
}

// =============================================================================
// Layer Import
// =============================================================================

fn tar_with(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

/// Builds a single-entry archive with a raw, unvalidated name.
fn tar_with_raw_name(name: &[u8]) -> Vec<u8> {
    let mut header = tar::Header::new_old();
    header.as_old_mut().name[..name.len()].copy_from_slice(name);
    header.set_size(4);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();

    let mut builder = tar::Builder::new(Vec::new());
    builder.append(&header, &b"evil"[..]).unwrap();
    builder.into_inner().unwrap()
}

fn wclayer_opts(root: &Path, parents: &[&Path]) -> WcLayerImportOptions {
    WcLayerImportOptions {
        root_path: root.to_string_lossy().into_owned(),
        parents: parents
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect(),
    }
}

#[test]
fn test_import_extracts_files() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("layer");
    let data = tar_with(&[("Files/hello.txt", b"hello"), ("Files/sub/x.bin", b"12345678")]);

    let written = import_layer(
        &mut Cursor::new(data),
        &wclayer_opts(&root, &[]),
        &DirectoryImporter::default(),
    )
    .unwrap();

    assert_eq!(written, 13);
    assert_eq!(fs::read(root.join("Files/hello.txt")).unwrap(), b"hello");
    assert!(root.join("Files/sub/x.bin").exists());
}

#[test]
fn test_import_rejects_parent_dir_traversal() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("layer");
    let err = import_layer(
        &mut Cursor::new(tar_with_raw_name(b"../escape.txt")),
        &wclayer_opts(&root, &[]),
        &DirectoryImporter::default(),
    )
    .unwrap_err();

    assert!(matches!(err, Error::PathTraversal { .. }), "got {err:?}");
    assert!(!dir.path().join("escape.txt").exists());
}

#[test]
fn test_import_rejects_absolute_path() {
    let dir = TempDir::new().unwrap();
    let err = import_layer(
        &mut Cursor::new(tar_with_raw_name(b"/etc/evil")),
        &wclayer_opts(&dir.path().join("layer"), &[]),
        &DirectoryImporter::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::PathTraversal { .. }), "got {err:?}");
}

#[test]
fn test_whiteout_recorded_only_when_parent_has_target() {
    let dir = TempDir::new().unwrap();
    let parent = dir.path().join("parent");
    fs::create_dir_all(parent.join("Files")).unwrap();
    fs::write(parent.join("Files/old.txt"), b"old").unwrap();

    let root = dir.path().join("layer");
    let data = tar_with(&[
        ("Files/.wh.old.txt", b""),
        ("Files/.wh.never-existed", b""),
        ("Files/new.txt", b"new"),
    ]);
    import_layer(
        &mut Cursor::new(data),
        &wclayer_opts(&root, &[&parent]),
        &DirectoryImporter::default(),
    )
    .unwrap();

    assert!(root.join("Files/.wh.old.txt").exists());
    assert!(!root.join("Files/.wh.never-existed").exists());
    assert!(root.join("Files/new.txt").exists());
    assert!(parent.join("Files/old.txt").exists(), "parents stay untouched");
}

#[cfg(unix)]
#[test]
fn test_whiteout_through_symlink_cannot_escape_root() {
    let dir = TempDir::new().unwrap();
    let outside = TempDir::new().unwrap();
    fs::write(outside.path().join("victim"), b"keep me").unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    let mut link = tar::Header::new_gnu();
    link.set_entry_type(tar::EntryType::Symlink);
    link.set_size(0);
    link.set_mode(0o777);
    link.set_link_name(outside.path()).unwrap();
    builder.append_data(&mut link, "link", io::empty()).unwrap();
    let mut whiteout = tar::Header::new_gnu();
    whiteout.set_entry_type(tar::EntryType::Regular);
    whiteout.set_size(0);
    whiteout.set_mode(0o644);
    builder
        .append_data(&mut whiteout, "link/.wh.victim", io::empty())
        .unwrap();
    let data = builder.into_inner().unwrap();

    let err = import_layer(
        &mut Cursor::new(data),
        &wclayer_opts(&dir.path().join("layer"), &[]),
        &DirectoryImporter::default(),
    )
    .unwrap_err();

    assert!(matches!(err, Error::PathTraversal { .. }), "got {err:?}");
    assert_eq!(fs::read(outside.path().join("victim")).unwrap(), b"keep me");
}

#[test]
fn test_missing_parent_rejected() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("missing");
    let err = import_layer(
        &mut Cursor::new(tar_with(&[])),
        &wclayer_opts(&dir.path().join("layer"), &[&missing]),
        &DirectoryImporter::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::InvalidParentLayer { .. }));
}

#[test]
fn test_size_limit_enforced() {
    let dir = TempDir::new().unwrap();
    let data = tar_with(&[("a", &[0u8; 600]), ("b", &[0u8; 600])]);
    let err = import_layer(
        &mut Cursor::new(data),
        &wclayer_opts(&dir.path().join("layer"), &[]),
        &DirectoryImporter::with_limits(1000, 100),
    )
    .unwrap_err();
    assert!(matches!(err, Error::LayerTooLarge { what: "size", .. }));
}

#[test]
fn test_entry_limit_enforced() {
    let dir = TempDir::new().unwrap();
    let data = tar_with(&[("a", b"1"), ("b", b"2"), ("c", b"3")]);
    let err = import_layer(
        &mut Cursor::new(data),
        &wclayer_opts(&dir.path().join("layer"), &[]),
        &DirectoryImporter::with_limits(1 << 20, 2),
    )
    .unwrap_err();
    assert!(matches!(err, Error::LayerTooLarge { what: "entry count", .. }));
}
