use std::io::ErrorKind;
use std::io::Read;
use std::path::Path;
use std::process::ExitStatus;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::trace;

const READ_BUFFER_BYTES: usize = 8192;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const WRITER_CHANNEL_CAPACITY: usize = 128;

/// How an engine process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExitInfo {
    pub(crate) code: Option<i32>,
    pub(crate) signal: Option<i32>,
}

impl ExitInfo {
    fn from_status(status: &ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }

    /// Wait failures carry neither a code nor a signal.
    fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

/// A persistent engine process. Stdout and stderr share one pipe so the
/// engine's diagnostics stay ordered relative to the completion marker.
#[derive(Debug)]
pub(crate) struct SessionProcess {
    pub(crate) pid: Option<u32>,
    pub(crate) writer_tx: mpsc::Sender<Vec<u8>>,
    pub(crate) output_rx: mpsc::Receiver<Vec<u8>>,
    pub(crate) exit_rx: oneshot::Receiver<ExitInfo>,
    pub(crate) killer: Option<oneshot::Sender<()>>,
}

/// A short-lived process reading a script file and writing straight into
/// the execution's result and error files.
#[derive(Debug)]
pub(crate) struct OneOffProcess {
    pub(crate) pid: Option<u32>,
    pub(crate) exit_rx: oneshot::Receiver<ExitInfo>,
    pub(crate) killer: Option<oneshot::Sender<()>>,
}

fn engine_command(engine: &Path, database: Option<&Path>) -> Command {
    let mut command = Command::new(engine);
    if let Some(database) = database {
        command.arg(database);
    }
    command.kill_on_drop(true);
    command
}

pub(crate) fn spawn_session(engine: &Path, database: Option<&Path>) -> std::io::Result<SessionProcess> {
    let (mut reader, pipe_writer) = std::io::pipe()?;
    let mut child = {
        let mut command = engine_command(engine, database);
        command
            .stdin(Stdio::piped())
            .stdout(pipe_writer.try_clone()?)
            .stderr(pipe_writer);
        // The command (and with it our copies of the write end) is dropped
        // here so the reader sees EOF once the engine exits.
        command.spawn()?
    };
    let pid = child.id();
    let Some(mut stdin) = child.stdin.take() else {
        return Err(std::io::Error::other("engine stdin was not captured"));
    };

    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAPACITY);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUFFER_BYTES];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        trace!(?pid, "engine output closed");
    });

    let (writer_tx, mut writer_rx) = mpsc::channel::<Vec<u8>>(WRITER_CHANNEL_CAPACITY);
    tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            if let Err(err) = stdin.write_all(&bytes).await {
                debug!(?pid, "engine stdin closed: {err}");
                break;
            }
            let _ = stdin.flush().await;
        }
    });

    let (exit_rx, killer) = supervise(child);
    Ok(SessionProcess {
        pid,
        writer_tx,
        output_rx,
        exit_rx,
        killer: Some(killer),
    })
}

pub(crate) fn spawn_one_off(
    engine: &Path,
    database: Option<&Path>,
    script: &Path,
    result: &Path,
    errors: &Path,
) -> std::io::Result<OneOffProcess> {
    let child = engine_command(engine, database)
        .stdin(std::fs::File::open(script)?)
        .stdout(std::fs::File::create(result)?)
        .stderr(std::fs::File::create(errors)?)
        .spawn()?;
    let pid = child.id();
    let (exit_rx, killer) = supervise(child);
    Ok(OneOffProcess {
        pid,
        exit_rx,
        killer: Some(killer),
    })
}

/// Waits for the child in the background. Sending on the returned killer
/// force-terminates it; the exit is reported either way.
fn supervise(mut child: Child) -> (oneshot::Receiver<ExitInfo>, oneshot::Sender<()>) {
    let (exit_tx, exit_rx) = oneshot::channel();
    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            Ok(()) = kill_rx => {
                if let Err(err) = child.start_kill() {
                    debug!("failed to kill engine process: {err}");
                }
                child.wait().await
            }
        };
        let info = match status {
            Ok(status) => ExitInfo::from_status(&status),
            Err(err) => {
                debug!("failed to wait for engine process: {err}");
                ExitInfo::unknown()
            }
        };
        let _ = exit_tx.send(info);
    });
    (exit_rx, kill_tx)
}

/// Sends SIGINT to `pid`. Returns false when the signal could not be
/// delivered (or the platform has no interrupt signal).
pub(crate) fn interrupt(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return false;
        };
        // SAFETY: kill(2) has no memory-safety preconditions.
        unsafe { libc::kill(pid, libc::SIGINT) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

#[cfg(unix)]
pub(crate) const INTERRUPT_SIGNAL: i32 = libc::SIGINT;
#[cfg(not(unix))]
pub(crate) const INTERRUPT_SIGNAL: i32 = 2;
