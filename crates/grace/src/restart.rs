//! Process re-execution with listener descriptor passing.
//!
//! A reload spawns the current binary again with the listening socket placed
//! at [`INHERITED_FD`] and `GRACE_RESTART=1` in its environment. Once the new
//! process is serving it sends `SIGQUIT` to its parent, which then drains and
//! exits.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use tracing::{debug, info};

use crate::listener::INHERITED_FD;

/// Environment variable marking a process spawned by a live restart.
pub const RESTART_ENV: &str = "GRACE_RESTART";

/// Whether this process was spawned by a live restart.
///
/// Read from the environment once; later changes to the environment are
/// ignored.
pub fn is_restart() -> bool {
    static RESTART: OnceLock<bool> = OnceLock::new();
    *RESTART.get_or_init(|| std::env::var_os(RESTART_ENV).is_some_and(|v| v == "1"))
}

/// Whether the parent of this process is init, i.e. the process that
/// launched us has exited.
pub fn parent_is_init() -> bool {
    unsafe { libc::getppid() == 1 }
}

/// Ask the parent process to drain and exit.
///
/// Does nothing when the parent is init.
pub fn notify_parent() -> io::Result<()> {
    let ppid = unsafe { libc::getppid() };
    if ppid == 1 {
        return Ok(());
    }

    info!(ppid, "Asking parent process to drain");
    send_signal(ppid, libc::SIGQUIT)
}

/// Send `signal` to `pid`.
pub(crate) fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Spawn a replacement of the current process that inherits `listener`.
///
/// The child runs the same executable with the same arguments, working
/// directory and environment, plus [`RESTART_ENV`]. Stdin, stdout and
/// stderr are shared; `listener` becomes descriptor [`INHERITED_FD`] with
/// close-on-exec cleared. Returns the child's pid.
pub fn spawn_replacement(listener: OwnedFd) -> io::Result<u32> {
    let mut args = std::env::args_os();
    let argv0 = args
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "missing argv[0]"))?;
    let program = resolve_program(&argv0)?;
    let cwd = std::env::current_dir()?;

    let mut command = Command::new(&program);
    command
        .arg0(&argv0)
        .args(args)
        .current_dir(&cwd)
        .env_clear()
        .envs(std::env::vars_os().filter(|(key, _)| key != RESTART_ENV))
        .env(RESTART_ENV, "1");

    let source = listener.as_raw_fd();
    // SAFETY: the hook only calls async-signal-safe functions (dup2, fcntl).
    unsafe {
        command.pre_exec(move || {
            if source != INHERITED_FD && libc::dup2(source, INHERITED_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            clear_cloexec(INHERITED_FD)
        });
    }

    debug!(program = %program.display(), cwd = %cwd.display(), fd = source, "Spawning replacement");
    let child = command.spawn()?;
    drop(listener);

    info!(pid = child.id(), program = %program.display(), "Spawned replacement process");
    Ok(child.id())
}

/// Clear `FD_CLOEXEC` so `fd` survives exec.
pub(crate) fn clear_cloexec(fd: libc::c_int) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Locate the binary named by `argv0`.
///
/// Paths are used as given, relative to the working directory, so that a
/// symlink swapped during a deploy is followed to the new binary. Bare names
/// are searched on `PATH`.
fn resolve_program(argv0: &OsStr) -> io::Result<PathBuf> {
    if argv0.as_bytes().contains(&b'/') {
        return Ok(PathBuf::from(argv0));
    }

    let path = std::env::var_os("PATH").unwrap_or_else(OsString::new);
    std::env::split_paths(&path)
        .map(|dir| dir.join(argv0))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("executable {} not found in PATH", Path::new(argv0).display()),
            )
        })
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsFd;

    #[test]
    fn test_not_a_restart_by_default() {
        assert!(!is_restart());
    }

    #[test]
    fn test_clear_cloexec() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = listener.as_fd().try_clone_to_owned().unwrap();

        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        clear_cloexec(fd.as_raw_fd()).unwrap();

        let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFD) };
        assert_eq!(flags & libc::FD_CLOEXEC, 0);
    }

    #[test]
    fn test_clear_cloexec_on_bad_fd() {
        assert!(clear_cloexec(9999).is_err());
    }

    #[test]
    fn test_resolve_program_paths() {
        assert_eq!(
            resolve_program(OsStr::new("./bin/server")).unwrap(),
            PathBuf::from("./bin/server")
        );
        assert_eq!(resolve_program(OsStr::new("sh")).unwrap().file_name().unwrap(), "sh");
        assert!(resolve_program(OsStr::new("definitely-not-a-real-binary-name")).is_err());
    }

    #[test]
    fn test_signal_to_missing_process_fails() {
        let err = send_signal(i32::MAX, 0).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESRCH));
    }
}
