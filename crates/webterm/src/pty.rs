//! Pseudo-terminal allocation and the shell process attached to it.

use std::env;
use std::ffi::{CString, NulError, OsStr, OsString};
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::fcntl::OFlag;
use nix::pty::{grantpt, posix_openpt, unlockpt, PtyMaster};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::{fork, ForkResult, Pid};
use thiserror::Error;
use tokio::io::unix::AsyncFd;

use crate::config::ShellConfig;

/// Environment variables that would make the shell think it is still inside
/// the multiplexer the server was started from.
const STRIPPED_ENV: &[&str] = &["TMUX", "TMUX_PANE"];
const TERM: &str = "xterm-256color";

#[derive(Error, Debug)]
pub enum PtyError {
    #[error("failed to allocate pseudo-terminal: {0}")]
    Open(#[source] nix::Error),

    #[error("failed to grant/unlock pseudo-terminal: {0}")]
    Unlock(#[source] nix::Error),

    #[error("failed to resolve subordinate device name: {0}")]
    SubordinateName(#[source] nix::Error),

    #[error("failed to open subordinate device {path}: {source}")]
    OpenSubordinate {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to set window size: {0}")]
    WindowSize(#[source] io::Error),

    #[error("shell {0:?} not found on PATH")]
    ShellNotFound(String),

    #[error("argument contains a NUL byte: {0}")]
    InvalidArgument(#[from] NulError),

    #[error("fork failed: {0}")]
    Fork(#[source] nix::Error),

    #[error("failed to register master with the reactor: {0}")]
    Register(#[source] io::Error),
}

// ── Window size ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }

    fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

fn set_window_size(fd: RawFd, size: WindowSize) -> io::Result<()> {
    let ws = size.to_winsize();
    // SAFETY: fd is an open terminal descriptor and ws outlives the call.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ, &ws) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
fn get_window_size(fd: RawFd) -> io::Result<WindowSize> {
    let mut ws = WindowSize::new(0, 0).to_winsize();
    // SAFETY: fd is an open terminal descriptor and ws is a valid out-pointer.
    let rc = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(WindowSize::new(ws.ws_row, ws.ws_col))
}

// ── Child setup ──────────────────────────────────────────────────────

/// Environment for the shell: the server's own, minus multiplexer
/// variables, with `TERM` forced.
pub fn child_environment<I>(vars: I) -> Vec<CString>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut envp: Vec<CString> = vars
        .into_iter()
        .filter(|(k, _)| {
            let k = k.as_bytes();
            k != b"TERM" && !STRIPPED_ENV.iter().any(|s| s.as_bytes() == k)
        })
        .filter_map(|(k, v)| {
            let mut entry = k.into_vec();
            entry.push(b'=');
            entry.extend_from_slice(v.as_bytes());
            CString::new(entry).ok()
        })
        .collect();
    envp.extend(CString::new(format!("TERM={}", TERM)).ok());
    envp
}

/// Resolve a bare program name through `PATH`. Names containing `/` are used as given.
pub fn resolve_program(program: &str, path_var: Option<&OsStr>) -> Option<PathBuf> {
    if program.contains('/') {
        return Some(PathBuf::from(program));
    }
    env::split_paths(path_var?)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Everything the forked child needs, allocated before `fork` so the child
/// only makes async-signal-safe calls.
#[allow(dead_code)] // argv/envp own the buffers the pointer arrays refer to
struct ExecPlan {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    // NULL-terminated; the CString buffers never move.
    argv_ptrs: Vec<*const libc::c_char>,
    envp_ptrs: Vec<*const libc::c_char>,
}

impl ExecPlan {
    fn new(shell: &ShellConfig) -> Result<Self, PtyError> {
        let path = resolve_program(&shell.program, env::var_os("PATH").as_deref())
            .ok_or_else(|| PtyError::ShellNotFound(shell.program.clone()))?;
        let program = CString::new(path.into_os_string().into_vec())?;

        let name = Path::new(&shell.program)
            .file_name()
            .map(|n| n.as_bytes().to_vec())
            .unwrap_or_else(|| shell.program.clone().into_bytes());
        let mut argv = vec![CString::new(name)?];
        if shell.login {
            argv.push(CString::new("-l")?);
        }

        let envp = child_environment(env::vars_os());
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            program,
            argv,
            envp,
            argv_ptrs,
            envp_ptrs,
        })
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Runs in the forked child. Never returns.
///
/// SAFETY: must only be called between `fork` and `exec`; everything it
/// touches was allocated by the parent.
unsafe fn exec_shell(master: RawFd, subordinate: RawFd, plan: &ExecPlan) -> ! {
    libc::close(master);
    libc::setsid();
    libc::ioctl(subordinate, libc::TIOCSCTTY as _, 0);
    libc::dup2(subordinate, 0);
    libc::dup2(subordinate, 1);
    libc::dup2(subordinate, 2);
    if subordinate > 2 {
        libc::close(subordinate);
    }

    // The server ignores SIGCHLD and SIGPIPE; ignored dispositions survive exec.
    libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    libc::signal(libc::SIGHUP, libc::SIG_DFL);

    libc::execve(plan.program.as_ptr(), plan.argv_ptrs.as_ptr(), plan.envp_ptrs.as_ptr());
    libc::_exit(127)
}

#[cfg(target_os = "linux")]
fn subordinate_name(master: &PtyMaster) -> nix::Result<String> {
    nix::pty::ptsname_r(master)
}

#[cfg(not(target_os = "linux"))]
fn subordinate_name(master: &PtyMaster) -> nix::Result<String> {
    // SAFETY: sessions are created one at a time from the accept loop.
    unsafe { nix::pty::ptsname(master) }
}

/// Make exited children disappear without an explicit wait.
///
/// Sessions hang up their shell and reap it without blocking; a shell that
/// takes a moment to die would otherwise linger as a zombie.
pub fn ignore_child_exits() -> nix::Result<()> {
    // SAFETY: installs SIG_IGN, no handler code runs.
    unsafe { signal::signal(Signal::SIGCHLD, SigHandler::SigIgn) }.map(|_| ())
}

// ── Session ──────────────────────────────────────────────────────────

/// One pseudo-terminal and the shell running on its subordinate side.
///
/// Dropping the session hangs up the shell, reaps it if it already exited
/// and closes the master descriptor.
pub struct PtySession {
    master: AsyncFd<OwnedFd>,
    child: Pid,
    size: WindowSize,
}

impl PtySession {
    /// Allocate a PTY and start `shell` on it. Must be called inside a tokio runtime.
    pub fn spawn(shell: &ShellConfig, size: WindowSize) -> Result<Self, PtyError> {
        let plan = ExecPlan::new(shell)?;

        let master =
            posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY).map_err(PtyError::Open)?;
        grantpt(&master).map_err(PtyError::Unlock)?;
        unlockpt(&master).map_err(PtyError::Unlock)?;
        let path = subordinate_name(&master).map_err(PtyError::SubordinateName)?;
        let subordinate = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(&path)
            .map_err(|source| PtyError::OpenSubordinate {
                path: path.clone(),
                source,
            })?;
        set_window_size(subordinate.as_raw_fd(), size).map_err(PtyError::WindowSize)?;

        // SAFETY: the child branch only calls exec_shell, which is async-signal-safe.
        let child = match unsafe { fork() }.map_err(PtyError::Fork)? {
            ForkResult::Child => unsafe {
                exec_shell(master.as_raw_fd(), subordinate.as_raw_fd(), &plan)
            },
            ForkResult::Parent { child } => child,
        };
        drop(subordinate);

        // SAFETY: into_raw_fd hands over sole ownership of the descriptor.
        let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
        let session = Self::adopt(master, child, size);
        if session.is_err() {
            hang_up(child);
        }
        session
    }

    fn adopt(master: OwnedFd, child: Pid, size: WindowSize) -> Result<Self, PtyError> {
        set_nonblocking(master.as_raw_fd()).map_err(PtyError::Register)?;
        let master = AsyncFd::new(master).map_err(PtyError::Register)?;
        tracing::debug!(pid = child.as_raw(), rows = size.rows, cols = size.cols, "shell started");
        Ok(Self {
            master,
            child,
            size,
        })
    }

    pub fn pid(&self) -> Pid {
        self.child
    }

    pub fn window_size(&self) -> WindowSize {
        self.size
    }

    /// Apply a new window size to the master; the shell receives SIGWINCH.
    pub fn resize(&mut self, size: WindowSize) -> Result<(), PtyError> {
        set_window_size(self.master.as_raw_fd(), size).map_err(PtyError::WindowSize)?;
        self.size = size;
        Ok(())
    }

    /// Window size as the terminal driver currently reports it.
    #[cfg(test)]
    pub fn query_window_size(&self) -> Result<WindowSize, PtyError> {
        get_window_size(self.master.as_raw_fd()).map_err(PtyError::WindowSize)
    }

    /// Read shell output. `Ok(0)` means the shell side hung up.
    ///
    /// Cancel-safe: nothing is consumed unless the future completes.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.readable().await?;
            match guard.try_io(|inner| read_fd(inner.as_raw_fd(), buf)) {
                Ok(Err(err)) if is_hangup(&err) => return Ok(0),
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Write some of `data` to the shell's input and return how much was taken.
    ///
    /// Cancel-safe: a write either happens within one poll or not at all.
    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.master.writable().await?;
            match guard.try_io(|inner| write_fd(inner.as_raw_fd(), data)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        hang_up(self.child);
        tracing::debug!(pid = self.child.as_raw(), "shell hung up");
    }
}

/// The master reports EIO once no process holds the subordinate side open.
pub fn is_hangup(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

fn hang_up(child: Pid) {
    let _ = signal::kill(child, Signal::SIGHUP);
    // ECHILD when SIGCHLD is ignored; the kernel reaps for us then.
    let _ = waitpid(child, Some(WaitPidFlag::WNOHANG));
}

// ── Raw fd helpers ───────────────────────────────────────────────────

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl on an fd we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is valid for buf.len() bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_fd(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    // SAFETY: data is valid for data.len() bytes.
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}
