//! Successor spawning with listener descriptor passing.
//!
//! A restart duplicates the listening socket, spawns the same program with
//! the duplicate installed at fd 3 and `--graceful` appended to its
//! arguments, then shuts the current generation down. Unlike an in-place
//! exec, the current generation survives a failed spawn and keeps serving.
//!
//! The successor is not waited on: the current generation starts draining
//! as soon as the process exists, whether or not it manages to serve.

use std::ffi::OsString;
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::error::{ConfigError, RestartError};
use crate::listener::{InvocationMode, GRACEFUL_FLAG, INHERITED_FD};
use crate::server::{GenerationState, ServerHandle};

/// Program and arguments used to start a successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuccessorCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl SuccessorCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// The command line this process was started with.
    ///
    /// `argv[0]` is re-executed rather than `/proc/self/exe`, so a binary
    /// replaced on disk by a deploy is picked up by the successor.
    pub fn current() -> Result<Self, ConfigError> {
        let mut args = std::env::args_os();
        let program = args.next().ok_or(ConfigError::MissingProgram)?;
        if program.is_empty() {
            return Err(ConfigError::MissingProgram);
        }
        Ok(Self::new(program, args))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments for a successor: these arguments with [`GRACEFUL_FLAG`]
    /// appended unless already present.
    ///
    /// A successor always adopts, whatever mode the caller started in.
    pub fn successor_args(&self) -> Vec<OsString> {
        let mut args = self.args.clone();
        let marked = args.iter().any(|arg| arg == GRACEFUL_FLAG);
        if !marked {
            args.push(OsString::from(GRACEFUL_FLAG));
        }
        args
    }
}

/// Restart orchestration for one generation.
pub struct Restart {
    server: ServerHandle,
    mode: InvocationMode,
    command: SuccessorCommand,
    in_progress: AtomicBool,
}

impl Restart {
    pub fn new(server: ServerHandle, mode: InvocationMode, command: SuccessorCommand) -> Self {
        Self {
            server,
            mode,
            command,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Hand the listener to a new process and shut this generation down.
    ///
    /// Returns the successor's pid. Errors other than
    /// [`RestartError::Drain`] leave the current generation serving; a
    /// failed spawn may be retried.
    pub async fn restart(&self) -> Result<u32, RestartError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(RestartError::InProgress);
        }

        let pid = match self.spawn_successor() {
            Ok(pid) => pid,
            Err(err) => {
                self.in_progress.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        match self.server.shutdown().await {
            Ok(()) => Ok(pid),
            Err(source) => Err(RestartError::Drain { pid, source }),
        }
    }

    fn spawn_successor(&self) -> Result<u32, RestartError> {
        if !matches!(
            self.server.state(),
            GenerationState::Created | GenerationState::Serving
        ) {
            return Err(RestartError::ShuttingDown);
        }

        let inherited = {
            let listener = self.server.listener().ok_or(RestartError::ShuttingDown)?;
            let fd = listener.handoff_fd().ok_or(RestartError::Unsupported)?;
            // F_DUPFD_CLOEXEC: the duplicate only survives into the successor
            // through the dup2 in `install_inherited_fd`.
            fd.try_clone_to_owned().map_err(RestartError::Descriptor)?
        };

        let args = self.command.successor_args();
        info!(
            mode = %self.mode,
            program = %self.command.program.display(),
            args = ?args,
            fd = inherited.as_raw_fd(),
            "Spawning successor generation"
        );

        let child = spawn_with_fd(&self.command.program, &args, inherited).map_err(|source| {
            warn!(error = %source, "Failed to spawn successor, keeping current generation");
            RestartError::Spawn {
                program: self.command.program.display().to_string(),
                source,
            }
        })?;

        let pid = child.id();
        info!(pid, "Spawned successor generation");
        Ok(pid)
    }
}

/// Spawn `program` with `fd` installed at [`INHERITED_FD`] and the standard
/// streams inherited.
fn spawn_with_fd(
    program: &Path,
    args: &[OsString],
    fd: OwnedFd,
) -> io::Result<std::process::Child> {
    let raw = fd.as_raw_fd();
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: the closure runs between fork and exec and only calls
    // async-signal-safe functions (fcntl, dup2).
    unsafe {
        command.pre_exec(move || install_inherited_fd(raw));
    }

    // Our copy of the duplicate is closed when `fd` drops; the child owns
    // its own.
    let child = command.spawn();
    drop(fd);
    child
}

/// Place `fd` at [`INHERITED_FD`] without close-on-exec.
fn install_inherited_fd(fd: RawFd) -> io::Result<()> {
    if fd == INHERITED_FD {
        // dup2 onto itself is a no-op that leaves FD_CLOEXEC set.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(io::Error::last_os_error());
        }
    } else if unsafe { libc::dup2(fd, INHERITED_FD) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, ConnectionHandler};
    use crate::listener::{bind, ListeningSocket};
    use crate::server::Server;
    use std::time::Duration;
    use tokio::net::UnixListener;

    struct Idle;

    impl ConnectionHandler for Idle {
        async fn handle(&self, _conn: Connection) -> io::Result<()> {
            Ok(())
        }
    }

    /// A successor that records `marker` to `out` if fd 3 is a socket.
    fn reporting_successor(out: &Path) -> SuccessorCommand {
        SuccessorCommand::new(
            "/bin/sh",
            [
                OsString::from("-c"),
                OsString::from(r#"if [ -S /proc/self/fd/3 ]; then printf '%s' "$2" > "$1"; fi"#),
                OsString::from("handoff-successor"),
                out.as_os_str().to_os_string(),
            ],
        )
    }

    async fn wait_for_serving(handle: &ServerHandle) {
        handle
            .subscribe()
            .wait_for(|state| *state == GenerationState::Serving)
            .await
            .unwrap();
    }

    async fn wait_for_file(path: &Path) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(contents) = std::fs::read_to_string(path) {
                    if !contents.is_empty() {
                        return contents;
                    }
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("successor did not report in time")
    }

    #[test]
    fn test_marker_appended_when_missing() {
        let command = SuccessorCommand::new("/usr/bin/server", ["--addr", "127.0.0.1:0"]);

        assert_eq!(
            command.successor_args(),
            vec![
                OsString::from("--addr"),
                OsString::from("127.0.0.1:0"),
                OsString::from(GRACEFUL_FLAG),
            ]
        );
    }

    #[test]
    fn test_marker_not_duplicated() {
        let command = SuccessorCommand::new("/usr/bin/server", ["--addr", "x", GRACEFUL_FLAG]);

        let args = command.successor_args();
        assert_eq!(args.iter().filter(|arg| *arg == GRACEFUL_FLAG).count(), 1);
    }

    #[test]
    fn test_current_command_uses_argv0() {
        let command = SuccessorCommand::current().unwrap();
        let argv0 = std::env::args_os().next().unwrap();
        assert_eq!(command.program(), Path::new(&argv0));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_restart_spawns_successor_with_fd_and_marker() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("report");

        let listener = bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, Idle, Duration::from_secs(1));
        let handle = server.handle();
        let serving = tokio::spawn(server.serve());
        wait_for_serving(&handle).await;

        let restart = Restart::new(handle.clone(), InvocationMode::Fresh, reporting_successor(&out));
        let pid = restart.restart().await.unwrap();
        assert!(pid > 0);

        assert_eq!(wait_for_file(&out).await, GRACEFUL_FLAG);
        assert!(serving.await.unwrap().is_ok());
        assert_eq!(handle.state(), GenerationState::Terminated);

        // The generation is gone; a second restart is refused.
        assert!(matches!(
            restart.restart().await,
            Err(RestartError::InProgress)
        ));
    }

    /// A caller that claims `Inherited` with a bare command line still hands
    /// the successor the marker.
    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_inherited_generation_passes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("report");

        let listener = bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, Idle, Duration::from_secs(1));
        let handle = server.handle();
        let serving = tokio::spawn(server.serve());
        wait_for_serving(&handle).await;

        let restart = Restart::new(
            handle.clone(),
            InvocationMode::Inherited,
            reporting_successor(&out),
        );
        restart.restart().await.unwrap();

        assert_eq!(wait_for_file(&out).await, GRACEFUL_FLAG);
        assert!(serving.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_restart_unsupported_listener() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("report");
        let listener =
            ListeningSocket::from(UnixListener::bind(dir.path().join("sock")).unwrap());
        let server = Server::new(listener, Idle, Duration::from_secs(1));
        let handle = server.handle();
        let serving = tokio::spawn(server.serve());
        wait_for_serving(&handle).await;

        let restart = Restart::new(handle.clone(), InvocationMode::Fresh, reporting_successor(&out));
        assert!(matches!(
            restart.restart().await,
            Err(RestartError::Unsupported)
        ));

        // Nothing spawned, still serving.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!out.exists());
        assert_eq!(handle.state(), GenerationState::Serving);

        handle.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_keeps_generation_serving() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, Idle, Duration::from_secs(1));
        let handle = server.handle();
        let serving = tokio::spawn(server.serve());
        wait_for_serving(&handle).await;

        let command = SuccessorCommand::new("/nonexistent/handoff-successor", Vec::<OsString>::new());
        let restart = Restart::new(handle.clone(), InvocationMode::Fresh, command);

        let err = restart.restart().await.unwrap_err();
        assert!(matches!(err, RestartError::Spawn { .. }));
        assert_eq!(handle.state(), GenerationState::Serving);

        // The failed attempt does not block a retry.
        let err = restart.restart().await.unwrap_err();
        assert!(matches!(err, RestartError::Spawn { .. }));

        handle.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_restart_refused_while_shutting_down() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let server = Server::new(listener, Idle, Duration::from_secs(1));
        let handle = server.handle();
        let serving = tokio::spawn(server.serve());

        handle.shutdown().await.unwrap();
        serving.await.unwrap().unwrap();

        let command = SuccessorCommand::new("/bin/true", Vec::<OsString>::new());
        let restart = Restart::new(handle, InvocationMode::Fresh, command);
        assert!(matches!(
            restart.restart().await,
            Err(RestartError::ShuttingDown)
        ));
    }

    /// Whether `fd` is open with close-on-exec cleared.
    fn inheritable(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        flags >= 0 && flags & libc::FD_CLOEXEC == 0
    }

    /// Run `f` in a forked child, the way `pre_exec` runs, so the test
    /// process's own fd 3 is left alone. Returns the child's exit status.
    fn in_child(f: impl FnOnce() -> libc::c_int) -> libc::c_int {
        match unsafe { libc::fork() } {
            0 => {
                let code = f();
                unsafe { libc::_exit(code) }
            }
            pid => {
                assert!(pid > 0, "fork failed");
                let mut status = 0;
                assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
                assert!(libc::WIFEXITED(status));
                libc::WEXITSTATUS(status)
            }
        }
    }

    fn high_cloexec_dup(socket: &std::net::TcpListener) -> RawFd {
        let fd = unsafe { libc::fcntl(socket.as_raw_fd(), libc::F_DUPFD_CLOEXEC, 100) };
        assert!(fd >= 100);
        assert!(!inheritable(fd));
        fd
    }

    #[test]
    fn test_install_inherited_fd_from_high_descriptor() {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = high_cloexec_dup(&socket);

        let code = in_child(|| match install_inherited_fd(fd) {
            Ok(()) if inheritable(INHERITED_FD) => 0,
            Ok(()) => 1,
            Err(_) => 2,
        });
        assert_eq!(code, 0);

        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_install_inherited_fd_already_at_target() {
        let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let fd = high_cloexec_dup(&socket);

        let code = in_child(|| {
            // Put the descriptor at fd 3 with close-on-exec set.
            if unsafe { libc::dup2(fd, INHERITED_FD) } != INHERITED_FD {
                return 3;
            }
            if unsafe { libc::fcntl(INHERITED_FD, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
                return 3;
            }
            match install_inherited_fd(INHERITED_FD) {
                Ok(()) if inheritable(INHERITED_FD) => 0,
                Ok(()) => 1,
                Err(_) => 2,
            }
        });
        assert_eq!(code, 0);

        unsafe { libc::close(fd) };
    }
}
