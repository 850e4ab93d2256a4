use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::actor::SessionActor;
use super::actor::SessionCommand;
use super::line_buffer::LineBuffer;
use super::process::SessionProcess;
use super::process::spawn_session;
use crate::completion::CompletionRouter;
use crate::control::CancelOutcome;
use crate::error::Result;
use crate::error::SqlCellErr;
use crate::exec_id::ExecId;
use crate::protocol::READY_TOKEN;
use crate::protocol::readiness_probe;
use crate::tracker::StatusTracker;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
/// Lines of startup output kept for the StartupTimeout detail.
const STARTUP_TAIL_LINES: usize = 5;

/// Public view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub database: Option<PathBuf>,
    pub alive: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    name: String,
    pid: Option<u32>,
    database: Option<PathBuf>,
    started_at: DateTime<Utc>,
    commands: mpsc::Sender<SessionCommand>,
    alive: Arc<AtomicBool>,
}

impl SessionHandle {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.commands.is_closed()
    }

    pub(crate) fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            pid: self.pid,
            database: self.database.clone(),
            alive: self.is_alive(),
            started_at: self.started_at,
        }
    }

    /// Hands a command to the session actor. A command the actor can no
    /// longer accept is returned so its resources can be released.
    pub(crate) async fn send(
        &self,
        command: SessionCommand,
    ) -> std::result::Result<(), SessionCommand> {
        self.commands.send(command).await.map_err(|err| err.0)
    }

    pub(crate) async fn cancel(&self, exec_id: ExecId) -> CancelOutcome {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .send(SessionCommand::Cancel { exec_id, reply })
            .await
            .is_err()
        {
            return CancelOutcome::AlreadyFinished;
        }
        reply_rx.await.unwrap_or(CancelOutcome::AlreadyFinished)
    }

    async fn shutdown(&self, grace: Duration) {
        let (reply, reply_rx) = oneshot::channel();
        if self
            .send(SessionCommand::Shutdown { grace, reply })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RegistrySettings {
    pub(crate) engine_path: PathBuf,
    pub(crate) default_database: Option<PathBuf>,
    pub(crate) startup_timeout: Duration,
    pub(crate) shutdown_grace: Duration,
}

/// One entry per session name. The startup gate serializes spawning for
/// that name only; the handle is read without waiting on it.
#[derive(Debug, Default)]
struct SessionSlot {
    startup: Arc<Mutex<()>>,
    handle: StdMutex<Option<SessionHandle>>,
}

impl SessionSlot {
    fn handle(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn live_handle(&self) -> Option<SessionHandle> {
        self.handle()
            .as_ref()
            .filter(|handle| handle.is_alive())
            .cloned()
    }

    /// Empty and not starting.
    fn is_vacant(&self) -> bool {
        self.handle().is_none() && self.startup.try_lock().is_ok()
    }
}

/// Named persistent sessions. One engine process per name.
#[derive(Debug)]
pub(crate) struct SessionRegistry {
    sessions: StdMutex<HashMap<String, Arc<SessionSlot>>>,
    settings: RegistrySettings,
    router: CompletionRouter,
    tracker: Arc<StatusTracker>,
}

impl SessionRegistry {
    pub(crate) fn new(
        settings: RegistrySettings,
        router: CompletionRouter,
        tracker: Arc<StatusTracker>,
    ) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            settings,
            router,
            tracker,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, name: &str) -> Option<Arc<SessionSlot>> {
        self.sessions().get(name).cloned()
    }

    /// Returns the live session called `name`, spawning it first if needed.
    /// Concurrent callers for one name share a single startup; other names
    /// are never held up by it.
    pub(crate) async fn get_or_create(
        &self,
        name: &str,
        database: Option<&Path>,
    ) -> Result<SessionHandle> {
        let (slot, gate) = loop {
            let slot = Arc::clone(self.sessions().entry(name.to_string()).or_default());
            if let Some(existing) = slot.live_handle() {
                warn_on_database_mismatch(&existing, database);
                return Ok(existing);
            }
            let gate = Arc::clone(&slot.startup).lock_owned().await;
            // A vacant slot may have been pruned while we waited.
            if self.slot(name).is_some_and(|current| Arc::ptr_eq(&current, &slot)) {
                break (slot, gate);
            }
        };
        if let Some(existing) = slot.live_handle() {
            warn_on_database_mismatch(&existing, database);
            return Ok(existing);
        }
        if slot.handle().take().is_some() {
            debug!(session = name, "replacing dead session");
        }

        let database = database
            .map(Path::to_path_buf)
            .or_else(|| self.settings.default_database.clone());
        let started = self.start(name, database).await;
        if let Ok(handle) = &started {
            *slot.handle() = Some(handle.clone());
        }
        drop(gate);
        if started.is_err() {
            self.remove_if_vacant(name, &slot);
        }
        started
    }

    pub(crate) async fn get(&self, name: &str) -> Option<SessionHandle> {
        self.slot(name)?.live_handle()
    }

    fn remove_if_vacant(&self, name: &str, slot: &Arc<SessionSlot>) {
        let mut sessions = self.sessions();
        if sessions
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && current.is_vacant())
        {
            sessions.remove(name);
        }
    }

    async fn start(&self, name: &str, database: Option<PathBuf>) -> Result<SessionHandle> {
        let waited = self.settings.startup_timeout;
        let engine = &self.settings.engine_path;
        let mut process = spawn_session(engine, database.as_deref()).map_err(|err| {
            SqlCellErr::startup(
                name,
                waited,
                format!("failed to spawn `{}`: {err}", engine.display()),
            )
        })?;

        match tokio::time::timeout(waited, wait_for_ready(&mut process)).await {
            Ok(Ok(())) => {}
            Ok(Err(detail)) => {
                kill(&mut process);
                return Err(SqlCellErr::startup(name, waited, detail));
            }
            Err(_) => {
                kill(&mut process);
                return Err(SqlCellErr::startup(
                    name,
                    waited,
                    "readiness token was never printed",
                ));
            }
        }

        let pid = process.pid;
        info!(session = name, ?pid, "session started");
        self.tracker.process_started(Some(name.to_string()), None, pid);

        let alive = Arc::new(AtomicBool::new(true));
        let (commands, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        SessionActor::spawn(
            name.to_string(),
            process,
            self.settings.shutdown_grace,
            self.router.clone(),
            Arc::clone(&self.tracker),
            Arc::clone(&alive),
            commands_rx,
        );
        Ok(SessionHandle {
            name: name.to_string(),
            pid,
            database,
            started_at: Utc::now(),
            commands,
            alive,
        })
    }

    /// Sends the quit directive, waits up to the grace period, then kills.
    /// Returns false when no such session existed.
    pub(crate) async fn delete(&self, name: &str) -> bool {
        let Some(slot) = self.slot(name) else {
            return false;
        };
        let removed = slot.handle().take();
        self.remove_if_vacant(name, &slot);
        let Some(handle) = removed else {
            return false;
        };
        handle.shutdown(self.settings.shutdown_grace).await;
        info!(session = name, "session closed");
        true
    }

    /// Live sessions sorted by name. Sessions still starting are not listed.
    pub(crate) async fn list(&self) -> Vec<SessionInfo> {
        self.cleanup_dead().await;
        let slots: Vec<_> = self.sessions().values().cloned().collect();
        let mut infos: Vec<_> = slots
            .iter()
            .filter_map(|slot| slot.handle().as_ref().map(SessionHandle::info))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Drops entries whose process has exited; returns how many.
    pub(crate) async fn cleanup_dead(&self) -> usize {
        let mut sessions = self.sessions();
        let mut pruned = 0;
        for (name, slot) in sessions.iter() {
            let mut handle = slot.handle();
            if handle.as_ref().is_some_and(|handle| !handle.is_alive()) {
                debug!(session = %name, "pruning dead session");
                *handle = None;
                pruned += 1;
            }
        }
        sessions.retain(|_, slot| !slot.is_vacant());
        pruned
    }

    pub(crate) async fn shutdown_all(&self) {
        let slots: Vec<_> = self.sessions().drain().map(|(_, slot)| slot).collect();
        let handles: Vec<_> = slots
            .iter()
            .filter_map(|slot| slot.handle().take())
            .collect();
        let grace = self.settings.shutdown_grace;
        futures::future::join_all(handles.iter().map(|handle| handle.shutdown(grace))).await;
    }
}

fn warn_on_database_mismatch(existing: &SessionHandle, database: Option<&Path>) {
    if database.is_some() && database != existing.database.as_deref() {
        warn!(
            session = existing.name(),
            "session already open on another database; reusing it"
        );
    }
}

fn kill(process: &mut SessionProcess) {
    if let Some(killer) = process.killer.take() {
        let _ = killer.send(());
    }
}

/// Sends the readiness probe and waits for the token on a line of its own.
/// The error is a human-readable reason.
async fn wait_for_ready(process: &mut SessionProcess) -> std::result::Result<(), String> {
    if process
        .writer_tx
        .send(readiness_probe().into_bytes())
        .await
        .is_err()
    {
        return Err("engine stdin closed before the readiness probe".to_string());
    }
    let mut lines = LineBuffer::new();
    let mut tail: Vec<String> = Vec::new();
    while let Some(chunk) = process.output_rx.recv().await {
        for line in lines.push_bytes(&chunk) {
            if line.trim() == READY_TOKEN {
                return Ok(());
            }
            if !line.trim().is_empty() {
                tail.push(line);
                if tail.len() > STARTUP_TAIL_LINES {
                    tail.remove(0);
                }
            }
        }
    }
    if let Some(partial) = lines.flush() {
        tail.push(partial);
    }
    let mut detail = "engine exited before becoming ready".to_string();
    if !tail.is_empty() {
        detail.push_str(": ");
        detail.push_str(&tail.join(" | "));
    }
    Err(detail)
}
