//! Process-level helpers: cooperative cancellation, POSIX id lookups,
//! ownership changes.

use std::ffi::CStr;
use std::ffi::CString;
use std::io;
use std::mem::MaybeUninit;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use rustix::fs::{AtFlags, CWD};

/// Cancellation token threaded through the engine. The walk checks it at
/// each file boundary; in-flight syscalls are never interrupted.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

static SIGNAL_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

extern "C" fn on_signal(_sig: libc::c_int) {
    if let Some(flag) = SIGNAL_FLAG.get() {
        flag.store(true, Ordering::SeqCst);
    }
}

/// Route SIGINT and SIGTERM into `token`. Only the first installed token is
/// wired up; later calls are no-ops.
pub fn install_signal_handler(token: &CancelToken) {
    SIGNAL_FLAG.get_or_init(|| token.flag.clone());
    let handler: extern "C" fn(libc::c_int) = on_signal;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

pub fn effective_uid() -> u32 {
    rustix::process::geteuid().as_raw()
}

pub fn effective_gid() -> u32 {
    rustix::process::getegid().as_raw()
}

pub fn hostname() -> io::Result<String> {
    Ok(hostname::get()?.to_string_lossy().into_owned())
}

/// Looks up the GID for a group name with `getgrnam_r`, growing the scratch
/// buffer on ERANGE.
pub fn lookup_group_by_name(name: &str) -> io::Result<Option<u32>> {
    let Ok(c_name) = CString::new(name) else {
        return Ok(None);
    };

    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut grp = MaybeUninit::<libc::group>::zeroed();
        let mut result: *mut libc::group = ptr::null_mut();
        // SAFETY: all pointers are valid for the duration of the call; the
        // scratch buffer backs the returned strings.
        let errno = unsafe {
            libc::getgrnam_r(
                c_name.as_ptr(),
                grp.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };

        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: non-null result means getgrnam_r initialized `grp`.
            let grp = unsafe { grp.assume_init() };
            return Ok(Some(grp.gr_gid as u32));
        }

        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }

        return Err(io::Error::from_raw_os_error(errno));
    }
}

/// Looks up the name of a GID with `getgrgid_r`.
pub fn lookup_group_name(gid: u32) -> io::Result<Option<String>> {
    let mut buffer = vec![0_u8; 1024];
    loop {
        let mut grp = MaybeUninit::<libc::group>::zeroed();
        let mut result: *mut libc::group = ptr::null_mut();
        // SAFETY: see lookup_group_by_name.
        let errno = unsafe {
            libc::getgrgid_r(
                gid as libc::gid_t,
                grp.as_mut_ptr(),
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                &mut result,
            )
        };

        if errno == 0 {
            if result.is_null() {
                return Ok(None);
            }
            // SAFETY: non-null result means getgrgid_r initialized `grp`,
            // and gr_name points into our scratch buffer.
            let name = unsafe { CStr::from_ptr(grp.assume_init().gr_name) };
            return Ok(Some(name.to_string_lossy().into_owned()));
        }

        if errno == libc::ERANGE {
            buffer.resize(buffer.len().saturating_mul(2), 0);
            continue;
        }

        return Err(io::Error::from_raw_os_error(errno));
    }
}

fn raw_uid(uid: u32) -> rustix::fs::Uid {
    // SAFETY: any u32 is a representable uid.
    unsafe { rustix::fs::Uid::from_raw(uid) }
}

fn raw_gid(gid: u32) -> rustix::fs::Gid {
    // SAFETY: any u32 is a representable gid.
    unsafe { rustix::fs::Gid::from_raw(gid) }
}

pub fn chown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    rustix::fs::chownat(
        CWD,
        path,
        Some(raw_uid(uid)),
        Some(raw_gid(gid)),
        AtFlags::empty(),
    )
    .map_err(io::Error::from)
}

/// chown that does not follow symlinks.
pub fn lchown(path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    rustix::fs::chownat(
        CWD,
        path,
        Some(raw_uid(uid)),
        Some(raw_gid(gid)),
        AtFlags::SYMLINK_NOFOLLOW,
    )
    .map_err(io::Error::from)
}
