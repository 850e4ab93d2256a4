#![allow(clippy::expect_used)]

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use sqlcell_core::ExecEngine;
use sqlcell_core::ExecId;
use sqlcell_core::ExecStatus;
use sqlcell_core::SqlCellConfig;
use tempfile::TempDir;

/// Stand-in for the engine CLI. It understands the dot-directives the
/// engine is driven with, plus a handful of statements:
///
/// - `emit TEXT`: one result line
/// - `rows N`: lines `row 1` .. `row N`
/// - `json N`: N JSON-mode rows `{"n":i}`
/// - `warn TEXT`: TEXT on stderr
/// - `fail TEXT`: TEXT on stderr, exit 1 when `.bail on`
/// - `progress N`: a progress-bar fragment on stdout
/// - `sleep N`: interruptible sleep; SIGINT aborts it with an error
/// - `die CODE`: exit immediately
///
/// Anything else is a parser error.
const FAKE_ENGINE: &str = r#"#!/bin/sh
out=""
bail=0
interrupted=0
trap 'interrupted=1' INT

emit() {
  if [ -n "$out" ]; then
    printf '%s\n' "$1" >> "$out"
  else
    printf '%s\n' "$1"
  fi
}

while :; do
  IFS= read -r line
  status=$?
  if [ "$status" -gt 128 ]; then
    continue
  fi
  if [ "$status" -ne 0 ] && [ -z "$line" ]; then
    break
  fi
  line=${line%;}
  case "$line" in
    .print\ *)
      emit "${line#.print }"
      interrupted=0
      ;;
    .output\ *)
      out=${line#.output }
      out=${out#\'}
      out=${out%\'}
      : > "$out"
      ;;
    .output) out="" ;;
    ".bail on") bail=1 ;;
    .bail\ *) bail=0 ;;
    .quit|.exit) exit 0 ;;
    .*|"") ;;
    emit\ *) emit "${line#emit }" ;;
    rows\ *)
      n=${line#rows }
      i=1
      while [ "$i" -le "$n" ]; do
        emit "row $i"
        i=$((i + 1))
      done
      ;;
    json\ *)
      n=${line#json }
      i=1
      while [ "$i" -le "$n" ]; do
        pre=""
        if [ "$i" -eq 1 ]; then pre="["; fi
        if [ "$i" -eq "$n" ]; then
          emit "$pre{\"n\":$i}]"
        else
          emit "$pre{\"n\":$i},"
        fi
        i=$((i + 1))
      done
      ;;
    warn\ *) printf '%s\n' "${line#warn }" >&2 ;;
    fail\ *)
      printf '%s\n' "${line#fail }" >&2
      if [ "$bail" = 1 ]; then exit 1; fi
      ;;
    progress\ *) printf ' %s%% \342\226\225\342\226\210\342\226\217\r' "${line#progress }" ;;
    sleep\ *)
      if [ "$interrupted" = 0 ]; then
        sleep "${line#sleep }" >/dev/null 2>&1 &
        pid=$!
        wait "$pid"
        kill "$pid" 2>/dev/null
      fi
      if [ "$interrupted" = 1 ]; then
        echo "INTERRUPT Error: Interrupted!" >&2
        if [ "$bail" = 1 ]; then exit 130; fi
      fi
      ;;
    die\ *) exit "${line#die }" ;;
    *)
      printf 'Parser Error: syntax error at or near "%s"\n' "$line" >&2
      if [ "$bail" = 1 ]; then exit 1; fi
      ;;
  esac
done
"#;

/// Never reads stdin and never prints anything.
const HANGING_ENGINE: &str = "#!/bin/sh\nexec sleep 30\n";

/// Fails before becoming ready.
const CRASHING_ENGINE: &str = "#!/bin/sh\necho 'IO Error: Cannot open database' >&2\nexit 1\n";

/// A scratch directory holding an engine script and the temp files of the
/// executions run against it.
pub struct TestEngine {
    dir: TempDir,
    engine: PathBuf,
}

impl TestEngine {
    pub fn fake() -> Self {
        Self::with_script(FAKE_ENGINE)
    }

    pub fn hanging() -> Self {
        Self::with_script(HANGING_ENGINE)
    }

    pub fn crashing() -> Self {
        Self::with_script(CRASHING_ENGINE)
    }

    fn with_script(script: &str) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = write_executable(dir.path(), "engine.sh", script);
        Self { dir, engine }
    }

    pub fn engine_path(&self) -> &Path {
        &self.engine
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Config with short timeouts pointing at this engine.
    pub fn config(&self) -> SqlCellConfig {
        let temp_dir = self.dir.path().join("exec");
        std::fs::create_dir_all(&temp_dir).expect("exec dir");
        SqlCellConfig {
            engine_path: self.engine.clone(),
            startup_timeout_ms: 5_000,
            sync_timeout_ms: 10_000,
            shutdown_grace_ms: 500,
            cancel_grace_ms: 1_000,
            progress_refresh_ms: 50,
            temp_dir: Some(temp_dir),
            ..SqlCellConfig::default()
        }
    }

    pub fn engine(&self) -> ExecEngine {
        ExecEngine::new(self.config())
    }

    /// Files left behind in the execution temp dir.
    pub fn leftover_files(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(self.dir.path().join("exec")) {
            Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub fn write_executable(dir: &Path, name: &str, script: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, script).expect("write script");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod script");
    }
    path
}

/// Polls until `exec_id` reaches `status`; panics after `timeout`.
pub async fn wait_for_status(engine: &ExecEngine, exec_id: ExecId, status: ExecStatus, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = engine.status(exec_id);
        if current == Some(status) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{exec_id} stayed {current:?}, expected {status}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until every execution temp file was removed; panics after `timeout`.
pub async fn wait_for_cleanup(test: &TestEngine, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let leftover = test.leftover_files();
        if leftover.is_empty() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("temp files were not removed: {leftover:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
