use std::io;
use std::path::Path;

use tempfile::Builder;
use tempfile::TempPath;

use crate::exec_id::ExecId;

/// Temp files exclusively owned by one execution. Paths are unique per
/// execution and are removed by the completion router (or on drop if the
/// router never ran).
#[derive(Debug)]
pub(crate) struct ExecutionFiles {
    result: TempPath,
    errors: Option<TempPath>,
    script: Option<TempPath>,
}

impl ExecutionFiles {
    /// Result file only; session executions capture errors from the stream.
    pub(crate) fn for_session(dir: &Path, exec_id: ExecId) -> io::Result<Self> {
        Ok(Self {
            result: create(dir, exec_id, ".out")?,
            errors: None,
            script: None,
        })
    }

    /// Result, error and script files for a one-off process.
    pub(crate) fn for_one_off(dir: &Path, exec_id: ExecId, script: &str) -> io::Result<Self> {
        let script_path = create(dir, exec_id, ".sql")?;
        std::fs::write(&script_path, script)?;
        Ok(Self {
            result: create(dir, exec_id, ".out")?,
            errors: Some(create(dir, exec_id, ".err")?),
            script: Some(script_path),
        })
    }

    pub(crate) fn result_path(&self) -> &Path {
        &self.result
    }

    pub(crate) fn error_path(&self) -> Option<&Path> {
        self.errors.as_deref()
    }

    pub(crate) fn script_path(&self) -> Option<&Path> {
        self.script.as_deref()
    }

    /// Deletes every file, returning the failures instead of stopping at the
    /// first one.
    pub(crate) fn remove_all(self) -> Vec<io::Error> {
        let Self {
            result,
            errors,
            script,
        } = self;
        [Some(result), errors, script]
            .into_iter()
            .flatten()
            .filter_map(|path| path.close().err())
            .filter(|err| err.kind() != io::ErrorKind::NotFound)
            .collect()
    }
}

fn create(dir: &Path, exec_id: ExecId, suffix: &str) -> io::Result<TempPath> {
    std::fs::create_dir_all(dir)?;
    let file = Builder::new()
        .prefix(&format!("sqlcell-{}-", exec_id.short()))
        .suffix(suffix)
        .tempfile_in(dir)?;
    Ok(file.into_temp_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_off_files_are_distinct_and_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let files =
            ExecutionFiles::for_one_off(dir.path(), ExecId::new(), "SELECT 1;\n").expect("files");
        let result = files.result_path().to_path_buf();
        let errors = files.error_path().map(Path::to_path_buf).expect("error path");
        let script = files.script_path().map(Path::to_path_buf).expect("script path");
        assert_ne!(result, errors);
        assert_eq!(
            std::fs::read_to_string(&script).expect("script"),
            "SELECT 1;\n"
        );

        assert!(files.remove_all().is_empty());
        assert!(!result.exists());
        assert!(!errors.exists());
        assert!(!script.exists());
    }

    #[test]
    fn paths_are_never_reused_for_the_same_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = ExecId::new();
        let a = ExecutionFiles::for_session(dir.path(), id).expect("a");
        let b = ExecutionFiles::for_session(dir.path(), id).expect("b");
        assert_ne!(a.result_path(), b.result_path());
    }
}
