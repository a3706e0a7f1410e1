//! Activation-socket acquisition.
//!
//! launchd creates the listening socket and passes it to us by file
//! descriptor. The canonical retrieval path is the Darwin-only C API
//! `launch_activate_socket`, reached through the platform's dynamic loader;
//! when that yields nothing, a bounded scan of the standard launchd FD range
//! serves as fallback. The source is a trait so tests can hand the provider
//! a fabricated descriptor instead of running under launchd.

use std::ffi::{CString, c_char, c_int};
use std::net::TcpListener;
use std::os::fd::RawFd;
use std::os::unix::io::FromRawFd;

use tracing::{debug, info};

use crate::constants::LAUNCHD_SOCKET_NAME;
use crate::error::VirbyError;

/// Inclusive FD range launchd conventionally places inherited sockets in.
const FALLBACK_FD_RANGE: std::ops::RangeInclusive<RawFd> = 3..=10;

/// Launcher env vars recorded as diagnostic hints; never authoritative.
const LAUNCHER_ENV_HINTS: [&str; 3] = ["LISTEN_FDS", "LISTEN_PID", "LAUNCH_DAEMON_SOCKET_NAME"];

type LaunchActivateSocketFn =
    unsafe extern "C" fn(*const c_char, *mut *mut c_int, *mut libc::size_t) -> c_int;

/// Where inherited socket FDs come from.
pub trait ActivationSocketSource {
    /// File descriptors registered under `name`. Empty when unavailable.
    fn activate(&self, name: &str) -> Vec<RawFd>;
}

/// Production source: `launch_activate_socket` out of libSystem.
pub struct LaunchdSource;

impl ActivationSocketSource for LaunchdSource {
    fn activate(&self, name: &str) -> Vec<RawFd> {
        let Ok(socket_name) = CString::new(name) else {
            return Vec::new();
        };

        unsafe {
            let handle = libc::dlopen(c"/usr/lib/libSystem.B.dylib".as_ptr(), libc::RTLD_LAZY);
            if handle.is_null() {
                debug!("libSystem not loadable, launchd activation unavailable");
                return Vec::new();
            }

            let symbol = libc::dlsym(handle, c"launch_activate_socket".as_ptr());
            if symbol.is_null() {
                debug!("launch_activate_socket not available");
                return Vec::new();
            }
            let launch_activate_socket: LaunchActivateSocketFn = std::mem::transmute(symbol);

            let mut fds: *mut c_int = std::ptr::null_mut();
            let mut count: libc::size_t = 0;
            let rc = launch_activate_socket(socket_name.as_ptr(), &mut fds, &mut count);
            if rc != 0 {
                debug!(rc, "launch_activate_socket returned an error");
                return Vec::new();
            }
            if count == 0 || fds.is_null() {
                debug!("launch_activate_socket returned no file descriptors");
                return Vec::new();
            }

            let out = std::slice::from_raw_parts(fds, count).to_vec();
            // The fd array is malloc'd by launchd and ours to free.
            libc::free(fds.cast::<libc::c_void>());
            debug!(fds = ?out, "launch_activate_socket returned file descriptors");
            out
        }
    }
}

/// Fixed-FD source for tests and development outside launchd.
pub struct StaticFdSource(pub Vec<RawFd>);

impl ActivationSocketSource for StaticFdSource {
    fn activate(&self, _name: &str) -> Vec<RawFd> {
        self.0.clone()
    }
}

/// Acquire the listening socket bound to `port` from the launcher.
///
/// Each candidate descriptor is matched by its bound local port; the match
/// is duplicated before being returned, so probe handling never closes the
/// inherited descriptor itself. Failing both the launchd API and the
/// fallback scan is a startup error naming the expected port.
pub fn acquire_activation_socket(
    source: &dyn ActivationSocketSource,
    port: u16,
) -> Result<TcpListener, VirbyError> {
    log_env_hints();

    let fds = source.activate(LAUNCHD_SOCKET_NAME);
    if !fds.is_empty() {
        for fd in fds {
            match bound_port(fd) {
                Some(bound) => {
                    info!(fd, port = bound, "found launchd socket");
                    if bound == port {
                        return dup_listener(fd);
                    }
                }
                None => debug!(fd, "failed to read bound address"),
            }
        }
        return Err(VirbyError::Startup(format!(
            "no launchd file descriptor is bound to port {port}"
        )));
    }

    fallback_socket_scan(port)
}

/// Scan the conventional launchd FD range for a socket bound to `port`.
fn fallback_socket_scan(port: u16) -> Result<TcpListener, VirbyError> {
    debug!("falling back to file descriptor scanning");

    for fd in FALLBACK_FD_RANGE {
        if !is_socket(fd) {
            continue;
        }
        match bound_port(fd) {
            Some(bound) => {
                debug!(fd, port = bound, "socket file descriptor");
                if bound == port {
                    info!(fd, port, "found matching socket via FD scan");
                    return dup_listener(fd);
                }
            }
            None => continue,
        }
    }

    Err(VirbyError::Startup(format!(
        "no activation socket found on port {port}"
    )))
}

fn log_env_hints() {
    for var in LAUNCHER_ENV_HINTS {
        if let Ok(value) = std::env::var(var) {
            debug!(%var, %value, "launcher environment hint");
        }
    }
}

fn is_socket(fd: RawFd) -> bool {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
        return false;
    }
    let mode = unsafe { stat.assume_init() }.st_mode;
    (mode & libc::S_IFMT) == libc::S_IFSOCK
}

/// Local port an FD is bound to, for AF_INET/AF_INET6 sockets.
fn bound_port(fd: RawFd) -> Option<u16> {
    let mut storage = std::mem::MaybeUninit::<libc::sockaddr_storage>::zeroed();
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe { libc::getsockname(fd, storage.as_mut_ptr().cast(), &mut len) };
    if rc != 0 {
        return None;
    }
    let storage = unsafe { storage.assume_init() };

    match i32::from(storage.ss_family) {
        af if af == libc::AF_INET => {
            let addr: libc::sockaddr_in = unsafe { std::mem::transmute_copy(&storage) };
            Some(u16::from_be(addr.sin_port))
        }
        af if af == libc::AF_INET6 => {
            let addr: libc::sockaddr_in6 = unsafe { std::mem::transmute_copy(&storage) };
            Some(u16::from_be(addr.sin6_port))
        }
        _ => None,
    }
}

/// Duplicate `fd` and adopt the duplicate as a listener.
fn dup_listener(fd: RawFd) -> Result<TcpListener, VirbyError> {
    let duplicate = unsafe { libc::dup(fd) };
    if duplicate < 0 {
        return Err(VirbyError::Startup(format!(
            "failed to duplicate activation socket fd {fd}: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(unsafe { TcpListener::from_raw_fd(duplicate) })
}
