//! Windows backend: restricted primary tokens.
//!
//! ## Sequence
//!
//! ```text
//! OpenProcessToken(current)            ── query | duplicate | assign_primary
//!   ├─ LookupPrivilegeValueW(keep...)  ── resolve allow-list to LUIDs
//!   ├─ GetTokenInformation(Privileges) ── enumerate held LUIDs
//!   └─ CreateRestrictedToken(delete = held \ keep)
//! CreateProcessAsUserW(restricted, inherit std handles, explicit env block)
//! WaitForSingleObject + GetExitCodeProcess
//! ```
//!
//! Every kernel handle is wrapped in [`OwnedHandle`] the moment it is
//! obtained, so each is closed exactly once on every path.

use super::{Privilege, PrivilegeSource, ReExecConfig, compute_deletion_set};
use crate::error::{Error, Result};
use crate::supervisor::{ChildInvocation, RestrictedLauncher};
use std::ffi::OsStr;
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::path::Path;
use tracing::{debug, info};
use windows_sys::Win32::Foundation::{
    HANDLE, HANDLE_FLAG_INHERIT, INVALID_HANDLE_VALUE, LUID, SetHandleInformation, WAIT_FAILED,
};
use windows_sys::Win32::Security::{
    CreateRestrictedToken, GetTokenInformation, LUID_AND_ATTRIBUTES, LookupPrivilegeNameW,
    LookupPrivilegeValueW, TOKEN_ADJUST_DEFAULT, TOKEN_ASSIGN_PRIMARY, TOKEN_DUPLICATE,
    TOKEN_PRIVILEGES, TOKEN_QUERY, TokenPrivileges,
};
use windows_sys::Win32::System::Console::{
    GetStdHandle, STD_ERROR_HANDLE, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows_sys::Win32::System::Threading::{
    CREATE_UNICODE_ENVIRONMENT, CreateProcessAsUserW, GetCurrentProcess, GetExitCodeProcess,
    INFINITE, OpenProcessToken, PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOW,
    WaitForSingleObject,
};

/// Longest privilege name `LookupPrivilegeNameW` is asked to return.
const MAX_PRIVILEGE_NAME: usize = 256;

// =============================================================================
// LUID Helpers
// =============================================================================

/// Packs a LUID into a privilege identity.
pub fn luid_to_id(luid: LUID) -> u64 {
    (u64::from(luid.HighPart as u32) << 32) | u64::from(luid.LowPart)
}

/// Unpacks a privilege identity into a LUID.
pub fn id_to_luid(id: u64) -> LUID {
    LUID {
        LowPart: id as u32,
        HighPart: (id >> 32) as u32 as i32,
    }
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

// =============================================================================
// Token Source
// =============================================================================

/// Opens the current process token with the rights needed to derive a
/// restricted primary token from it.
pub fn open_process_token() -> Result<OwnedHandle> {
    let mut token: HANDLE = std::ptr::null_mut();
    let access = TOKEN_QUERY | TOKEN_DUPLICATE | TOKEN_ASSIGN_PRIMARY | TOKEN_ADJUST_DEFAULT;
    // SAFETY: GetCurrentProcess returns a pseudo-handle; `token` is a valid out pointer.
    let ok = unsafe { OpenProcessToken(GetCurrentProcess(), access, &mut token) };
    if ok == 0 {
        return Err(Error::TokenOpenFailed {
            reason: io::Error::last_os_error().to_string(),
        });
    }
    // SAFETY: the call succeeded, so `token` is an owned, open handle.
    Ok(unsafe { OwnedHandle::from_raw_handle(token) })
}

/// Privilege view of an open access token.
#[derive(Debug)]
pub struct TokenSource<'a> {
    token: &'a OwnedHandle,
}

impl<'a> TokenSource<'a> {
    /// Borrows `token` for privilege queries.
    pub fn new(token: &'a OwnedHandle) -> Self {
        Self { token }
    }
}

impl PrivilegeSource for TokenSource<'_> {
    fn lookup(&self, name: &str) -> Result<Privilege> {
        let wname = wide(OsStr::new(name));
        let mut luid = LUID {
            LowPart: 0,
            HighPart: 0,
        };
        // SAFETY: `wname` is NUL-terminated and outlives the call.
        let ok = unsafe { LookupPrivilegeValueW(std::ptr::null(), wname.as_ptr(), &mut luid) };
        if ok == 0 {
            return Err(Error::UnknownPrivilege {
                name: name.to_string(),
            });
        }
        Ok(Privilege::new(luid_to_id(luid), name, 0))
    }

    fn held(&self) -> Result<Vec<Privilege>> {
        let raw = self.token.as_raw_handle();
        let query_failed = |what: &str| Error::TokenQueryFailed {
            reason: format!("{what}: {}", io::Error::last_os_error()),
        };

        let mut needed = 0u32;
        // SAFETY: sizing call with a null buffer; only `needed` is written.
        unsafe {
            GetTokenInformation(raw, TokenPrivileges, std::ptr::null_mut(), 0, &mut needed);
        }
        if needed == 0 {
            return Err(query_failed("size token privileges"));
        }

        // u64 storage keeps the LUID_AND_ATTRIBUTES array aligned.
        let mut buf = vec![0u64; (needed as usize).div_ceil(8)];
        // SAFETY: `buf` spans at least `needed` bytes.
        let ok = unsafe {
            GetTokenInformation(raw, TokenPrivileges, buf.as_mut_ptr().cast(), needed, &mut needed)
        };
        if ok == 0 {
            return Err(query_failed("read token privileges"));
        }

        let header = buf.as_ptr().cast::<TOKEN_PRIVILEGES>();
        // SAFETY: the kernel wrote a TOKEN_PRIVILEGES header followed by
        // PrivilegeCount entries, all inside `buf`.
        let entries = unsafe {
            let count = (*header).PrivilegeCount as usize;
            let first = std::ptr::addr_of!((*header).Privileges).cast::<LUID_AND_ATTRIBUTES>();
            std::slice::from_raw_parts(first, count)
        };

        entries
            .iter()
            .map(|entry| {
                let name = privilege_name(&entry.Luid)?;
                Ok(Privilege::new(luid_to_id(entry.Luid), name, entry.Attributes))
            })
            .collect()
    }
}

fn privilege_name(luid: &LUID) -> Result<String> {
    let mut buf = [0u16; MAX_PRIVILEGE_NAME];
    let mut len = buf.len() as u32;
    // SAFETY: `buf` holds `len` u16s; `len` receives the written length.
    let ok = unsafe { LookupPrivilegeNameW(std::ptr::null(), luid, buf.as_mut_ptr(), &mut len) };
    if ok == 0 {
        return Err(Error::TokenQueryFailed {
            reason: format!("lookup privilege name: {}", io::Error::last_os_error()),
        });
    }
    Ok(String::from_utf16_lossy(&buf[..len as usize]))
}

// =============================================================================
// Restricted Token
// =============================================================================

/// Derives a primary token with `deletions` removed from `token`.
pub fn create_restricted_token(token: &OwnedHandle, deletions: &[Privilege]) -> Result<OwnedHandle> {
    let entries: Vec<LUID_AND_ATTRIBUTES> = deletions
        .iter()
        .map(|p| LUID_AND_ATTRIBUTES {
            Luid: id_to_luid(p.id),
            Attributes: 0,
        })
        .collect();

    let mut restricted: HANDLE = std::ptr::null_mut();
    // SAFETY: `entries` outlives the call; no SIDs are disabled or restricted.
    let ok = unsafe {
        CreateRestrictedToken(
            token.as_raw_handle(),
            0,
            0,
            std::ptr::null(),
            entries.len() as u32,
            if entries.is_empty() {
                std::ptr::null()
            } else {
                entries.as_ptr()
            },
            0,
            std::ptr::null(),
            &mut restricted,
        )
    };
    if ok == 0 {
        return Err(Error::RestrictedTokenFailed {
            reason: io::Error::last_os_error().to_string(),
        });
    }
    // SAFETY: the call succeeded, so `restricted` is an owned, open handle.
    Ok(unsafe { OwnedHandle::from_raw_handle(restricted) })
}

// =============================================================================
// Child Process
// =============================================================================

/// Appends `arg` to `out`, quoted so `CommandLineToArgvW` recovers it exactly.
pub fn append_quoted_arg(out: &mut Vec<u16>, arg: &OsStr) {
    const QUOTE: u16 = b'"' as u16;
    const BACKSLASH: u16 = b'\\' as u16;

    let units: Vec<u16> = arg.encode_wide().collect();
    let needs_quotes = units.is_empty()
        || units
            .iter()
            .any(|&c| c == b' ' as u16 || c == b'\t' as u16 || c == b'\n' as u16 || c == QUOTE);
    if !needs_quotes {
        out.extend_from_slice(&units);
        return;
    }

    out.push(QUOTE);
    let mut backslashes = 0usize;
    for &c in &units {
        match c {
            BACKSLASH => backslashes += 1,
            QUOTE => {
                out.extend(std::iter::repeat_n(BACKSLASH, backslashes * 2 + 1));
                out.push(QUOTE);
                backslashes = 0;
            }
            _ => {
                out.extend(std::iter::repeat_n(BACKSLASH, backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat_n(BACKSLASH, backslashes * 2));
    out.push(QUOTE);
}

/// Builds the NUL-terminated command line for `program args...`.
pub fn command_line(program: &Path, args: &[std::ffi::OsString]) -> Vec<u16> {
    let mut out = Vec::new();
    append_quoted_arg(&mut out, program.as_os_str());
    for arg in args {
        out.push(b' ' as u16);
        append_quoted_arg(&mut out, arg);
    }
    out.push(0);
    out
}

/// Builds a Unicode environment block, sorted case-insensitively by name.
pub fn environment_block(env: &[(String, String)]) -> Vec<u16> {
    let mut vars: Vec<&(String, String)> = env.iter().collect();
    vars.sort_by_key(|(k, _)| k.to_uppercase());

    let mut block = Vec::new();
    for (k, v) in vars {
        block.extend(OsStr::new(&format!("{k}={v}")).encode_wide());
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    block
}

/// Marks a standard handle inheritable and returns it.
fn inheritable_std_handle(which: u32) -> HANDLE {
    // SAFETY: GetStdHandle has no preconditions.
    let handle = unsafe { GetStdHandle(which) };
    if !handle.is_null() && handle != INVALID_HANDLE_VALUE {
        // SAFETY: `handle` is a live handle owned by this process.
        unsafe {
            SetHandleInformation(handle, HANDLE_FLAG_INHERIT, HANDLE_FLAG_INHERIT);
        }
    }
    handle
}

fn spawn_as_user(token: &OwnedHandle, invocation: &ChildInvocation) -> Result<OwnedHandle> {
    let application = wide(invocation.program.as_os_str());
    let mut cmdline = command_line(&invocation.program, &invocation.args);
    let env_block = environment_block(&invocation.env);

    // SAFETY: STARTUPINFOW and PROCESS_INFORMATION are plain C structs for
    // which all-zero is a valid initial state.
    let mut startup: STARTUPINFOW = unsafe { std::mem::zeroed() };
    startup.cb = std::mem::size_of::<STARTUPINFOW>() as u32;
    startup.dwFlags = STARTF_USESTDHANDLES;
    startup.hStdInput = inheritable_std_handle(STD_INPUT_HANDLE);
    startup.hStdOutput = inheritable_std_handle(STD_OUTPUT_HANDLE);
    startup.hStdError = inheritable_std_handle(STD_ERROR_HANDLE);
    let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

    // SAFETY: every buffer is NUL-terminated and outlives the call.
    let ok = unsafe {
        CreateProcessAsUserW(
            token.as_raw_handle(),
            application.as_ptr(),
            cmdline.as_mut_ptr(),
            std::ptr::null(),
            std::ptr::null(),
            1,
            CREATE_UNICODE_ENVIRONMENT,
            env_block.as_ptr().cast(),
            std::ptr::null(),
            &startup,
            &mut info,
        )
    };
    if ok == 0 {
        return Err(Error::SpawnFailed {
            program: invocation.program.display().to_string(),
            reason: io::Error::last_os_error().to_string(),
        });
    }

    // SAFETY: on success both handles are open and owned by us.
    let (process, _thread) = unsafe {
        (
            OwnedHandle::from_raw_handle(info.hProcess),
            OwnedHandle::from_raw_handle(info.hThread),
        )
    };
    debug!(pid = info.dwProcessId, "restricted child started");
    Ok(process)
}

fn wait_for_exit(process: &OwnedHandle) -> Result<i32> {
    let raw = process.as_raw_handle();
    // SAFETY: `raw` is a live process handle.
    if unsafe { WaitForSingleObject(raw, INFINITE) } == WAIT_FAILED {
        return Err(Error::WaitFailed(io::Error::last_os_error().to_string()));
    }
    let mut code = 0u32;
    // SAFETY: `code` is a valid out pointer.
    if unsafe { GetExitCodeProcess(raw, &mut code) } == 0 {
        return Err(Error::WaitFailed(io::Error::last_os_error().to_string()));
    }
    Ok(code as i32)
}

/// Runs the child under a restricted copy of the current process token.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenLauncher;

impl RestrictedLauncher for TokenLauncher {
    fn launch(&self, config: &ReExecConfig, invocation: &ChildInvocation) -> Result<i32> {
        let token = open_process_token()?;
        let deletions = compute_deletion_set(&TokenSource::new(&token), config.keep())?;
        info!(deleted = deletions.len(), "creating restricted token");
        for p in &deletions {
            debug!(privilege = %p.name, "deleting privilege");
        }

        let restricted = create_restricted_token(&token, &deletions)?;
        drop(token);

        let process = spawn_as_user(&restricted, invocation)?;
        drop(restricted);

        wait_for_exit(&process)
    }
}
