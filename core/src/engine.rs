use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde_json::Map;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::completion::CompletionJob;
use crate::completion::CompletionRouter;
use crate::completion::CompletionTarget;
use crate::config::SqlCellConfig;
use crate::control::CancelOutcome;
use crate::error::Result;
use crate::error::SqlCellErr;
use crate::exec_id::ExecId;
use crate::exec_id::SYNC_MARKER;
use crate::files::ExecutionFiles;
use crate::one_off;
use crate::protocol::BailMode;
use crate::protocol::build_command_script;
use crate::session::NOT_STARTED_EXITED;
use crate::session::RegistrySettings;
use crate::session::SessionCommand;
use crate::session::SessionInfo;
use crate::session::SessionRegistry;
use crate::sink::ExecutionResult;
use crate::sink::RenderOptions;
use crate::sink::ResultSink;
use crate::status::ExecStatus;
use crate::status::ExecutionRecord;
use crate::status::preview_command;
use crate::template::expand_template;
use crate::tracker::ExecutionEvent;
use crate::tracker::ProgressDisplay;
use crate::tracker::StatusTracker;

const PREVIEW_CHARS: usize = 60;

/// One query to run, either in a named session or in a one-off process.
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub query: String,
    /// `None` runs the query in a short-lived process.
    pub session: Option<String>,
    /// Database file for a new session or a one-off process.
    pub database: Option<PathBuf>,
    /// Values for `{{ name }}` placeholders; the query is used verbatim
    /// when absent.
    pub params: Option<Map<String, Value>>,
    pub options: RenderOptions,
}

impl ExecRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn in_session(mut self, name: impl Into<String>) -> Self {
        self.session = Some(name.into());
        self
    }

    pub fn with_database(mut self, database: impl Into<PathBuf>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_options(mut self, options: RenderOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum MarkerKind {
    Sync,
    Async,
}

pub(crate) struct EngineInner {
    pub(crate) config: SqlCellConfig,
    pub(crate) tracker: Arc<StatusTracker>,
    pub(crate) router: CompletionRouter,
    registry: SessionRegistry,
    /// Cancel switches of running one-off processes.
    pub(crate) one_offs: Mutex<HashMap<ExecId, oneshot::Sender<()>>>,
}

/// Owns every session, the status map and the running one-off processes.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ExecEngine {
    inner: Arc<EngineInner>,
}

impl std::fmt::Debug for ExecEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecEngine")
            .field("engine_path", &self.inner.config.engine_path)
            .finish_non_exhaustive()
    }
}

impl ExecEngine {
    pub fn new(config: SqlCellConfig) -> Self {
        let tracker = Arc::new(StatusTracker::new(config.progress_refresh()));
        let router = CompletionRouter::new(
            Arc::clone(&tracker),
            config.max_result_lines,
            config.error_excerpt_lines,
        );
        let registry = SessionRegistry::new(
            RegistrySettings {
                engine_path: config.engine_path.clone(),
                default_database: config.database.clone(),
                startup_timeout: config.startup_timeout(),
                shutdown_grace: config.shutdown_grace(),
            },
            router.clone(),
            Arc::clone(&tracker),
        );
        Self {
            inner: Arc::new(EngineInner {
                config,
                tracker,
                router,
                registry,
                one_offs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SqlCellConfig {
        &self.inner.config
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.inner.tracker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.inner.tracker.subscribe()
    }

    pub fn set_progress_display(&self, display: Arc<dyn ProgressDisplay>) {
        self.inner.tracker.set_display(display);
    }

    pub fn status(&self, exec_id: ExecId) -> Option<ExecStatus> {
        self.inner.tracker.status(exec_id)
    }

    pub fn record(&self, exec_id: ExecId) -> Option<ExecutionRecord> {
        self.inner.tracker.get(exec_id)
    }

    /// Starts (or reuses) the session called `name`.
    pub async fn open_session(
        &self,
        name: &str,
        database: Option<PathBuf>,
    ) -> Result<SessionInfo> {
        let handle = self
            .inner
            .registry
            .get_or_create(name, database.as_deref())
            .await?;
        Ok(handle.info())
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.inner.registry.list().await
    }

    /// Closes a session; returns false when it did not exist.
    pub async fn close_session(&self, name: &str) -> bool {
        self.inner.registry.delete(name).await
    }

    /// Drops sessions whose process has exited along with the records of
    /// finished executions; returns how many sessions were dropped.
    pub async fn cleanup_dead(&self) -> usize {
        let records = self.inner.tracker.clear_finished();
        if records > 0 {
            debug!(records, "pruned finished executions");
        }
        self.inner.registry.cleanup_dead().await
    }

    /// Runs `request` and waits for its result, failing with
    /// `ExecutionTimeout` once the configured sync timeout elapses. The
    /// timed-out execution is cancelled.
    pub async fn run_sync(&self, request: ExecRequest) -> Result<ExecutionResult> {
        let (reply, reply_rx) = oneshot::channel();
        let exec_id = self
            .start(request, CompletionTarget::Reply(reply), MarkerKind::Sync)
            .await?;
        let waited = self.inner.config.sync_timeout();
        match tokio::time::timeout(waited, reply_rx).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(SqlCellErr::SessionExited {
                session: self
                    .record(exec_id)
                    .and_then(|record| record.session)
                    .unwrap_or_default(),
            }),
            Err(_) => {
                warn!(%exec_id, "synchronous execution timed out; cancelling it");
                let outcome = self.cancel(exec_id).await;
                if outcome.accepted() {
                    debug!(%exec_id, %outcome, "timed-out execution cancelled");
                } else {
                    warn!(%exec_id, %outcome, "could not cancel timed-out execution");
                }
                Err(SqlCellErr::ExecutionTimeout { exec_id, waited })
            }
        }
    }

    /// Queues `request` and returns at once. The result goes to `sink`.
    pub async fn submit(&self, request: ExecRequest, sink: Arc<dyn ResultSink>) -> Result<ExecId> {
        let options = request.options;
        self.start(
            request,
            CompletionTarget::Sink { sink, options },
            MarkerKind::Async,
        )
        .await
    }

    async fn start(
        &self,
        request: ExecRequest,
        target: CompletionTarget,
        marker_kind: MarkerKind,
    ) -> Result<ExecId> {
        let ExecRequest {
            query,
            session,
            database,
            params,
            options,
        } = request;
        let query = match params {
            Some(params) => expand_template(&query, &params)?,
            None => query,
        };
        match session {
            Some(name) => {
                self.start_in_session(&name, database, query, options, target, marker_kind)
                    .await
            }
            None => one_off::start(&self.inner, database, query, options, target),
        }
    }

    async fn start_in_session(
        &self,
        name: &str,
        database: Option<PathBuf>,
        query: String,
        options: RenderOptions,
        target: CompletionTarget,
        marker_kind: MarkerKind,
    ) -> Result<ExecId> {
        let inner = &self.inner;
        let handle = inner
            .registry
            .get_or_create(name, database.as_deref())
            .await?;

        let exec_id = ExecId::new();
        let marker = match marker_kind {
            MarkerKind::Sync => SYNC_MARKER.to_string(),
            MarkerKind::Async => exec_id.async_marker(),
        };
        let files = ExecutionFiles::for_session(&inner.config.temp_dir(), exec_id)?;
        let command = build_command_script(
            &inner.config.display,
            options.format,
            BailMode::Continue,
            Some(files.result_path()),
            &query,
            Some(&marker),
        );
        inner.tracker.register(ExecutionRecord::new(
            exec_id,
            Some(name.to_string()),
            preview_command(&query, PREVIEW_CHARS),
            Some(files.result_path().to_path_buf()),
        ));
        debug!(session = name, %exec_id, "submitting execution");

        let job = CompletionJob {
            exec_id,
            session: Some(name.to_string()),
            files,
            options,
            target,
        };
        let submit = SessionCommand::Submit {
            exec_id,
            command,
            marker,
            job,
        };
        if let Err(rejected) = handle.send(submit).await {
            if let SessionCommand::Submit { job, .. } = rejected {
                inner
                    .router
                    .skip(job, ExecStatus::Error, NOT_STARTED_EXITED);
            }
            return Err(SqlCellErr::session_exited(handle.name()));
        }
        Ok(exec_id)
    }

    /// Cancels a queued or running execution.
    pub async fn cancel(&self, exec_id: ExecId) -> CancelOutcome {
        let Some(record) = self.inner.tracker.get(exec_id) else {
            return CancelOutcome::NotFound;
        };
        if record.status.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }
        match record.session {
            Some(name) => match self.inner.registry.get(&name).await {
                Some(handle) => handle.cancel(exec_id).await,
                None => CancelOutcome::AlreadyFinished,
            },
            None => {
                let switch = self
                    .inner
                    .one_offs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&exec_id);
                match switch.map(|switch| switch.send(())) {
                    Some(Ok(())) => CancelOutcome::Interrupted,
                    Some(Err(())) | None => CancelOutcome::AlreadyFinished,
                }
            }
        }
    }

    /// Closes every session and interrupts running one-off processes.
    pub async fn shutdown(&self) {
        let switches: Vec<_> = self
            .inner
            .one_offs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, switch)| switch)
            .collect();
        for switch in switches {
            let _ = switch.send(());
        }
        self.inner.registry.shutdown_all().await;
        info!("engine shut down");
    }
}
