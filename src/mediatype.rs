//! # Media Type Canonicalization
//!
//! Container media types carry platform flavoring as `+`-joined extension
//! tokens after the base type:
//!
//! ```text
//! application/vnd.microsoft.image.layer.v1.vhd+isolated+wcow
//! └──────────────── base ────────────────────┘ └─ extensions ─┘
//! ```
//!
//! Downstream consumers match media types by exact string equality, so every
//! producer must emit the same bytes for the same logical type. The canonical
//! form is the base followed by the deduplicated extensions in lexicographic
//! order. Adding an extension that is already present changes nothing, and the
//! order in which extensions are added never shows in the output.

use crate::constants::{EXTENSION_GZIP, EXTENSION_ZSTD};
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Separator between the base type and each extension.
const EXTENSION_SEPARATOR: char = '+';

/// Adds the single extension token `ext` to `media_type`.
///
/// If `ext` is already present, or empty, `media_type` is returned
/// unchanged. Otherwise the existing extensions plus `ext` are sorted and
/// rejoined after the base. Works on raw strings and never fails.
///
/// ```
/// use streamproc::mediatype::add_extension;
///
/// let mt = add_extension("application/vnd.microsoft.image.layer.v1.vhd", "wcow");
/// assert_eq!(mt, "application/vnd.microsoft.image.layer.v1.vhd+wcow");
/// assert_eq!(add_extension(&mt, "isolated"), "application/vnd.microsoft.image.layer.v1.vhd+isolated+wcow");
/// ```
pub fn add_extension(media_type: &str, ext: &str) -> String {
    let mut parts = media_type.split(EXTENSION_SEPARATOR);
    let base = parts.next().unwrap_or_default();
    let mut extensions: Vec<&str> = parts.collect();
    if ext.is_empty() || extensions.contains(&ext) {
        return media_type.to_string();
    }
    extensions.push(ext);
    extensions.sort_unstable();
    join(base, extensions.into_iter())
}

fn join<'a>(base: &str, extensions: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::from(base);
    for ext in extensions {
        out.push(EXTENSION_SEPARATOR);
        out.push_str(ext);
    }
    out
}

/// Compression declared by a media type's extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar stream.
    None,
    /// gzip-compressed stream.
    Gzip,
    /// zstd-compressed stream.
    Zstd,
}

/// A parsed media type in canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaType {
    base: String,
    extensions: BTreeSet<String>,
}

impl MediaType {
    /// Creates a media type with no extensions.
    pub fn new(base: impl Into<String>) -> Result<Self> {
        let base = base.into();
        validate_base(&base)?;
        Ok(Self {
            base,
            extensions: BTreeSet::new(),
        })
    }

    /// Parses `base[+ext...]`, canonicalizing the extension order.
    pub fn parse(s: &str) -> Result<Self> {
        let mut parts = s.trim().split(EXTENSION_SEPARATOR);
        let base = parts.next().unwrap_or_default();
        validate_base(base).map_err(|_| Error::InvalidMediaType {
            media_type: s.to_string(),
            reason: "missing type/subtype base".to_string(),
        })?;

        Ok(Self {
            base: base.to_string(),
            extensions: parts
                .filter(|p| !p.is_empty())
                .map(str::to_string)
                .collect(),
        })
    }

    /// Returns the base type without extensions.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Returns the extensions in canonical order.
    pub fn extensions(&self) -> impl Iterator<Item = &str> {
        self.extensions.iter().map(String::as_str)
    }

    /// Returns true if `ext` is present.
    pub fn has_extension(&self, ext: &str) -> bool {
        self.extensions.contains(ext)
    }

    /// Adds an extension in place. Returns false if it was already present.
    pub fn add_extension(&mut self, ext: &str) -> bool {
        let mut added = false;
        for token in ext.split(EXTENSION_SEPARATOR).filter(|p| !p.is_empty()) {
            added |= self.extensions.insert(token.to_string());
        }
        added
    }

    /// Returns the media type with `ext` added.
    #[must_use]
    pub fn with_extension(mut self, ext: &str) -> Self {
        self.add_extension(ext);
        self
    }

    /// Returns the compression declared by the extensions.
    pub fn compression(&self) -> Compression {
        if self.has_extension(EXTENSION_GZIP) {
            Compression::Gzip
        } else if self.has_extension(EXTENSION_ZSTD) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

fn validate_base(base: &str) -> Result<()> {
    match base.split_once('/') {
        Some((kind, sub)) if !kind.is_empty() && !sub.is_empty() => Ok(()),
        _ => Err(Error::InvalidMediaType {
            media_type: base.to_string(),
            reason: "base must be type/subtype".to_string(),
        }),
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&join(&self.base, self.extensions()))
    }
}

impl FromStr for MediaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
