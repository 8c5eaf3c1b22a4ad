//! # Privilege Reduction
//!
//! Models the privileges held by the current security context and computes
//! which ones to strip before running attacker-influenced conversion code.
//!
//! ## Policy
//!
//! The policy is "everything except an explicit allow-list": the caller names
//! the few privileges to keep, and every other privilege the process holds is
//! deleted. New privileges introduced by future OS releases are dropped
//! without anyone having to list them.
//!
//! ## Identity
//!
//! Privileges compare by their numeric identity ([`PrivilegeId`]), never by
//! name. Names are resolved through a system table before anything is
//! subtracted, so two spellings of the same privilege cannot slip through.
//!
//! ## Backends
//!
//! | Platform | Privilege            | Restricted context                  |
//! |----------|----------------------|-------------------------------------|
//! | Windows  | Token privilege LUID | `CreateRestrictedToken` primary token |
//! | Linux    | Capability           | Capability sets + no_new_privs      |
//! | Other    | n/a                  | Unsupported (fails closed)          |

use crate::constants::DEFAULT_KEEP_PRIVILEGES;
use crate::error::Result;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(windows)]
pub mod windows;

/// Numeric privilege identity (LUID on Windows, capability index on Linux).
pub type PrivilegeId = u64;

/// Attribute bit: privilege is currently enabled.
pub const ATTRIBUTE_ENABLED: u32 = 0x0000_0002;

/// Attribute bit: privilege is enabled by default.
pub const ATTRIBUTE_ENABLED_BY_DEFAULT: u32 = 0x0000_0001;

/// A privilege held by (or resolvable for) a security context.
///
/// Equality and hashing use `id` only.
#[derive(Debug, Clone)]
pub struct Privilege {
    /// Numeric identity.
    pub id: PrivilegeId,
    /// Human-readable name, e.g. `SeChangeNotifyPrivilege` or `CAP_CHOWN`.
    pub name: String,
    /// Attribute flags as reported by the OS.
    pub attributes: u32,
}

impl Privilege {
    /// Creates a privilege.
    pub fn new(id: PrivilegeId, name: impl Into<String>, attributes: u32) -> Self {
        Self {
            id,
            name: name.into(),
            attributes,
        }
    }

    /// Returns true if the privilege is enabled.
    pub fn is_enabled(&self) -> bool {
        self.attributes & ATTRIBUTE_ENABLED != 0
    }
}

impl PartialEq for Privilege {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Privilege {}

impl Hash for Privilege {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Read access to a security context's privileges.
pub trait PrivilegeSource {
    /// Resolves a privilege name through the system table.
    ///
    /// Fails with [`crate::Error::UnknownPrivilege`] for unrecognized names.
    fn lookup(&self, name: &str) -> Result<Privilege>;

    /// Enumerates the privileges currently held.
    fn held(&self) -> Result<Vec<Privilege>>;
}

/// Returns every held privilege whose identity is not in the resolved keep-list.
///
/// All keep names are resolved before the held set is queried, so an unknown
/// name aborts without touching the token. The result has set semantics; its
/// order is unspecified.
pub fn compute_deletion_set<S>(source: &S, keep: &[String]) -> Result<Vec<Privilege>>
where
    S: PrivilegeSource + ?Sized,
{
    let keep_ids = keep
        .iter()
        .map(|name| source.lookup(name).map(|p| p.id))
        .collect::<Result<HashSet<PrivilegeId>>>()?;

    let mut seen = HashSet::new();
    Ok(source
        .held()?
        .into_iter()
        .filter(|p| !keep_ids.contains(&p.id) && seen.insert(p.id))
        .collect())
}

/// Privileges to retain across the re-exec boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReExecConfig {
    keep: Vec<String>,
}

impl Default for ReExecConfig {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP_PRIVILEGES.iter().copied())
    }
}

impl ReExecConfig {
    /// Creates a config retaining exactly `keep`.
    pub fn new<I, S>(keep: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keep: keep.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns the allow-listed privilege names.
    pub fn keep(&self) -> &[String] {
        &self.keep
    }
}

// =============================================================================
// Platform Launcher Selection
// =============================================================================

/// Launcher that runs the child under a restricted primary token.
#[cfg(windows)]
pub type PlatformLauncher = windows::TokenLauncher;

/// Launcher that runs the child with a reduced capability set.
#[cfg(target_os = "linux")]
pub type PlatformLauncher = linux::CapabilityLauncher;

/// Launcher for platforms without a privilege-reduction backend.
#[cfg(not(any(windows, target_os = "linux")))]
pub type PlatformLauncher = UnsupportedLauncher;

/// Refuses to launch anything, so the dangerous work never runs unrestricted.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedLauncher;

impl crate::supervisor::RestrictedLauncher for UnsupportedLauncher {
    fn launch(
        &self,
        _config: &ReExecConfig,
        _invocation: &crate::supervisor::ChildInvocation,
    ) -> Result<i32> {
        Err(crate::error::Error::NotSupported(format!(
            "privilege reduction is not implemented for {}",
            std::env::consts::OS
        )))
    }
}
