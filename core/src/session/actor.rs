use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::process;
use super::process::ExitInfo;
use super::process::SessionProcess;
use super::queue::CancelPosition;
use super::queue::EnqueueOutcome;
use super::queue::ExecQueue;
use super::scanner::OutputScanner;
use super::scanner::ScanEvent;
use crate::completion::CompletionJob;
use crate::completion::CompletionRouter;
use crate::completion::FinishEvent;
use crate::control::CancelOutcome;
use crate::exec_id::ExecId;
use crate::protocol::QUIT_DIRECTIVE;
use crate::status::ExecStatus;
use crate::tracker::StatusTracker;

/// How long buffered output may trail the process exit before the
/// remaining executions are finalized.
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) const NOT_STARTED_CANCELLED: &str = "cancelled before execution started";
pub(crate) const NOT_STARTED_EXITED: &str = "session exited before execution started";

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Submit {
        exec_id: ExecId,
        command: String,
        marker: String,
        job: CompletionJob,
    },
    Cancel {
        exec_id: ExecId,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Shutdown {
        grace: Duration,
        reply: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
struct Closing {
    /// When the engine gets killed if it has not exited; cleared once the
    /// kill was sent.
    kill_at: Option<Instant>,
    replies: Vec<oneshot::Sender<()>>,
}

#[derive(Debug)]
struct PendingJob {
    marker: String,
    job: CompletionJob,
}

/// Single owner of one session's queue, scanner and process. Every queue
/// mutation happens on this task.
pub(crate) struct SessionActor {
    name: String,
    pid: Option<u32>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    killer: Option<oneshot::Sender<()>>,
    queue: ExecQueue<PendingJob>,
    /// Present only while the queue is non-empty.
    scanner: Option<OutputScanner>,
    interrupted_head: Option<ExecId>,
    closing: Option<Closing>,
    default_grace: Duration,
    router: CompletionRouter,
    tracker: Arc<StatusTracker>,
    alive: Arc<AtomicBool>,
}

impl SessionActor {
    pub(crate) fn spawn(
        name: String,
        process: SessionProcess,
        default_grace: Duration,
        router: CompletionRouter,
        tracker: Arc<StatusTracker>,
        alive: Arc<AtomicBool>,
        commands_rx: mpsc::Receiver<SessionCommand>,
    ) {
        let SessionProcess {
            pid,
            writer_tx,
            output_rx,
            exit_rx,
            killer,
        } = process;
        let actor = Self {
            name,
            pid,
            writer_tx,
            killer,
            queue: ExecQueue::new(),
            scanner: None,
            interrupted_head: None,
            closing: None,
            default_grace,
            router,
            tracker,
            alive,
        };
        tokio::spawn(actor.run(commands_rx, output_rx, exit_rx));
    }

    async fn run(
        mut self,
        mut commands_rx: mpsc::Receiver<SessionCommand>,
        mut output_rx: mpsc::Receiver<Vec<u8>>,
        mut exit_rx: oneshot::Receiver<ExitInfo>,
    ) {
        let mut commands_open = true;
        let exit = loop {
            let kill_at = self.closing.as_ref().and_then(|closing| closing.kill_at);
            tokio::select! {
                biased;
                chunk = output_rx.recv() => match chunk {
                    Some(chunk) => self.on_output(&chunk).await,
                    None => {
                        // Output closed; the exit arrives next.
                        break (&mut exit_rx).await.ok();
                    }
                },
                exit = &mut exit_rx => {
                    self.drain_output(&mut output_rx).await;
                    break exit.ok();
                }
                command = commands_rx.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => {
                        commands_open = false;
                        self.begin_close(self.default_grace, None).await;
                    }
                },
                _ = sleep_until_opt(kill_at) => {
                    warn!(session = %self.name, "engine still running after quit; killing it");
                    self.force_kill();
                    if let Some(closing) = self.closing.as_mut() {
                        closing.kill_at = None;
                    }
                }
            }
        };

        self.alive.store(false, Ordering::SeqCst);
        info!(session = %self.name, ?exit, "session process exited");
        self.finalize_after_exit(exit);

        commands_rx.close();
        while let Some(command) = commands_rx.recv().await {
            self.reject_after_exit(command);
        }
        if let Some(closing) = self.closing.take() {
            for reply in closing.replies {
                let _ = reply.send(());
            }
        }
    }

    async fn drain_output(&mut self, output_rx: &mut mpsc::Receiver<Vec<u8>>) {
        let deadline = Instant::now() + EXIT_DRAIN_TIMEOUT;
        while let Ok(Some(chunk)) = tokio::time::timeout_at(deadline, output_rx.recv()).await {
            self.on_output(&chunk).await;
        }
    }

    async fn on_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Submit {
                exec_id,
                command,
                marker,
                job,
            } => {
                if self.closing.is_some() {
                    self.router
                        .skip(job, ExecStatus::Error, NOT_STARTED_EXITED);
                    return;
                }
                match self.queue.enqueue(exec_id, command, PendingJob { marker, job }) {
                    EnqueueOutcome::Transmit(command) => self.start_head(exec_id, command).await,
                    EnqueueOutcome::Held { position } => {
                        debug!(session = %self.name, %exec_id, position, "execution queued");
                    }
                }
            }
            SessionCommand::Cancel { exec_id, reply } => {
                let outcome = self.cancel(exec_id);
                let _ = reply.send(outcome);
            }
            SessionCommand::Shutdown { grace, reply } => {
                self.begin_close(grace, Some(reply)).await;
            }
        }
    }

    async fn start_head(&mut self, exec_id: ExecId, command: String) {
        let Some(marker) = self
            .queue
            .head()
            .and_then(|head| head.payload.as_ref())
            .map(|pending| pending.marker.clone())
        else {
            return;
        };
        self.scanner
            .get_or_insert_with(OutputScanner::new)
            .watch(exec_id, marker);
        self.tracker.set_status(exec_id, ExecStatus::Executing);
        debug!(
            session = %self.name,
            %exec_id,
            waiting = self.queue.len().saturating_sub(1),
            "transmitting execution"
        );
        if self.writer_tx.send(command.into_bytes()).await.is_err() {
            // Stdin is gone; the exit branch finalizes the head.
            warn!(session = %self.name, %exec_id, "engine stdin closed");
        }
    }

    async fn on_output(&mut self, chunk: &[u8]) {
        let Some(scanner) = self.scanner.as_mut() else {
            trace!(session = %self.name, output = %String::from_utf8_lossy(chunk), "idle output");
            return;
        };
        for event in scanner.scan(chunk) {
            match event {
                ScanEvent::Progress { exec_id, percent } => {
                    self.tracker.set_progress(exec_id, percent);
                }
                ScanEvent::MarkerFound { exec_id, errors } => {
                    self.tracker.set_status(exec_id, ExecStatus::Completed);
                    self.finish_head(exec_id, FinishEvent::marker_seen(), errors)
                        .await;
                }
            }
        }
    }

    async fn finish_head(&mut self, exec_id: ExecId, event: FinishEvent, errors: String) {
        let Some(advance) = self.queue.dequeue(exec_id) else {
            warn!(session = %self.name, %exec_id, "completion for an execution that is not the head");
            return;
        };
        let event = if self.interrupted_head.take() == Some(exec_id) {
            FinishEvent::interrupted()
        } else {
            event
        };
        if let Some(pending) = advance.finished.payload {
            self.router.complete(pending.job, event, errors);
        }
        for skipped in advance.skipped {
            debug!(session = %self.name, exec_id = %skipped.exec_id, "skipping cancelled execution");
            if let Some(pending) = skipped.payload {
                self.router
                    .skip(pending.job, ExecStatus::Cancelled, NOT_STARTED_CANCELLED);
            }
        }

        match advance.next {
            Some((next_id, command)) if self.closing.is_none() => {
                self.start_head(next_id, command).await;
            }
            Some(_) => {}
            None => {
                self.scanner = None;
                debug!(session = %self.name, "queue drained; scanner detached");
            }
        }
    }

    fn cancel(&mut self, exec_id: ExecId) -> CancelOutcome {
        let (position, payload) = self.queue.cancel(exec_id);
        match position {
            CancelPosition::Head => {
                let Some(pid) = self.pid else {
                    return CancelOutcome::reject("engine pid unknown");
                };
                if process::interrupt(pid) {
                    info!(session = %self.name, %exec_id, pid, "interrupted running execution");
                    self.interrupted_head = Some(exec_id);
                    CancelOutcome::Interrupted
                } else {
                    CancelOutcome::reject("failed to signal engine process")
                }
            }
            CancelPosition::Queued { position } => {
                if let Some(pending) = payload {
                    self.router
                        .skip(pending.job, ExecStatus::Cancelled, NOT_STARTED_CANCELLED);
                }
                debug!(session = %self.name, %exec_id, position, "queued execution cancelled");
                CancelOutcome::Dequeued { position }
            }
            CancelPosition::Absent => CancelOutcome::NotFound,
        }
    }

    async fn begin_close(&mut self, grace: Duration, reply: Option<oneshot::Sender<()>>) {
        if let Some(closing) = self.closing.as_mut() {
            closing.replies.extend(reply);
            return;
        }
        info!(
            session = %self.name,
            busy = !self.queue.is_empty(),
            "closing session"
        );
        if self.writer_tx.send(QUIT_DIRECTIVE.as_bytes().to_vec()).await.is_err() {
            debug!(session = %self.name, "engine stdin already closed");
        }
        self.closing = Some(Closing {
            kill_at: Some(Instant::now() + grace),
            replies: reply.into_iter().collect(),
        });
    }

    fn force_kill(&mut self) {
        if let Some(killer) = self.killer.take() {
            let _ = killer.send(());
        }
    }

    /// The process is gone: the head gets the observed exit, everything
    /// behind it never started.
    fn finalize_after_exit(&mut self, exit: Option<ExitInfo>) {
        let errors = self
            .scanner
            .take()
            .map(|mut scanner| scanner.take_errors())
            .unwrap_or_default();
        let mut entries = self.queue.drain().into_iter();
        if let Some(head) = entries.next()
            && let Some(pending) = head.payload
        {
            let event = if self.interrupted_head.take() == Some(head.exec_id) {
                FinishEvent::interrupted()
            } else {
                match exit {
                    Some(exit) => FinishEvent::exited(exit),
                    None => FinishEvent::default().with_message("session process vanished"),
                }
            };
            self.router.complete(pending.job, event, errors);
        }
        for entry in entries {
            if let Some(pending) = entry.payload {
                self.router
                    .skip(pending.job, ExecStatus::Error, NOT_STARTED_EXITED);
            }
        }
    }

    fn reject_after_exit(&self, command: SessionCommand) {
        match command {
            SessionCommand::Submit { job, .. } => {
                self.router.skip(job, ExecStatus::Error, NOT_STARTED_EXITED);
            }
            SessionCommand::Cancel { reply, .. } => {
                let _ = reply.send(CancelOutcome::AlreadyFinished);
            }
            SessionCommand::Shutdown { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
