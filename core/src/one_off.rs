//! Executions that run in their own short-lived engine process: script on
//! stdin, results and errors written straight to the execution's files.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::PoisonError;

use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;

use crate::completion::CompletionJob;
use crate::completion::CompletionTarget;
use crate::completion::FinishEvent;
use crate::engine::EngineInner;
use crate::error::Result;
use crate::exec_id::ExecId;
use crate::files::ExecutionFiles;
use crate::protocol::BailMode;
use crate::protocol::build_command_script;
use crate::session::process::OneOffProcess;
use crate::session::process::interrupt;
use crate::session::process::spawn_one_off;
use crate::sink::RenderOptions;
use crate::status::ExecStatus;
use crate::status::ExecutionRecord;
use crate::status::preview_command;

const PREVIEW_CHARS: usize = 60;

pub(crate) fn start(
    inner: &Arc<EngineInner>,
    database: Option<PathBuf>,
    query: String,
    options: RenderOptions,
    target: CompletionTarget,
) -> Result<ExecId> {
    let exec_id = ExecId::new();
    let script = build_command_script(
        &inner.config.display,
        options.format,
        BailMode::Exit,
        None,
        &query,
        None,
    );
    let files = ExecutionFiles::for_one_off(&inner.config.temp_dir(), exec_id, &script)?;
    inner.tracker.register(ExecutionRecord::new(
        exec_id,
        None,
        preview_command(&query, PREVIEW_CHARS),
        Some(files.result_path().to_path_buf()),
    ));

    let database = database.or_else(|| inner.config.database.clone());
    let spawned = match (files.script_path(), files.error_path()) {
        (Some(script), Some(errors)) => spawn_one_off(
            &inner.config.engine_path,
            database.as_deref(),
            script,
            files.result_path(),
            errors,
        ),
        _ => Err(std::io::Error::other("one-off execution files are incomplete")),
    };
    let job = CompletionJob {
        exec_id,
        session: None,
        files,
        options,
        target,
    };
    let process = match spawned {
        Ok(process) => process,
        Err(err) => {
            let detail = format!(
                "failed to spawn `{}`: {err}",
                inner.config.engine_path.display()
            );
            inner.router.skip(job, ExecStatus::Error, &detail);
            return Ok(exec_id);
        }
    };

    inner.tracker.set_status(exec_id, ExecStatus::Executing);
    inner
        .tracker
        .process_started(None, Some(exec_id), process.pid);
    let (cancel_tx, cancel_rx) = oneshot::channel();
    inner
        .one_offs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(exec_id, cancel_tx);
    tokio::spawn(watch(Arc::clone(inner), job, process, cancel_rx));
    Ok(exec_id)
}

/// Awaits the process (interrupting it on request) and routes the result.
async fn watch(
    inner: Arc<EngineInner>,
    job: CompletionJob,
    process: OneOffProcess,
    cancel_rx: oneshot::Receiver<()>,
) {
    let exec_id = job.exec_id;
    let OneOffProcess {
        pid,
        mut exit_rx,
        mut killer,
    } = process;

    let event = tokio::select! {
        exit = &mut exit_rx => match exit {
            Ok(exit) => FinishEvent::exited(exit),
            Err(_) => FinishEvent::default().with_message("engine process vanished"),
        },
        Ok(()) = cancel_rx => {
            let signalled = pid.is_some_and(interrupt);
            info!(%exec_id, ?pid, signalled, "interrupting one-off execution");
            let grace = inner.config.cancel_grace();
            let exited = signalled
                && tokio::time::timeout(grace, &mut exit_rx).await.is_ok();
            if !exited {
                debug!(%exec_id, "one-off process ignored the interrupt; killing it");
                if let Some(killer) = killer.take() {
                    let _ = killer.send(());
                }
                let _ = exit_rx.await;
            }
            FinishEvent::interrupted()
        }
    };

    inner
        .one_offs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .remove(&exec_id);
    inner.router.complete(job, event, String::new());
}
