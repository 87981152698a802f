//! The worker audit log.

use std::{error, fmt};
use std::path::PathBuf;
use std::sync::Mutex;
use chrono::Utc;
use log::info;
use crate::commons::error::IoError;
use crate::commons::file;
use crate::constants::AUDIT_LOG_TARGET;
use crate::server::context::LogMap;
use crate::server::worker::{props, WorkerConfig};


//------------ WorkerLogger --------------------------------------------------

/// Writes one audit record per processed request.
#[derive(Debug)]
pub enum WorkerLogger {
    /// Logs through the `log` facade on the audit target.
    Default,

    /// Appends records to a file.
    File {
        path: PathBuf,
        lock: Mutex<()>,
    },

    /// Discards all records.
    Null,
}

impl WorkerLogger {
    /// Creates the logger from the `WORKERLOGGER` and `LOGFILE` properties.
    pub fn from_properties(
        config: &WorkerConfig, errors: &mut Vec<String>
    ) -> Self {
        let kind = config.get_non_empty(props::WORKERLOGGER)
            .unwrap_or("DEFAULT").to_uppercase();
        match kind.as_str() {
            "DEFAULT" => WorkerLogger::Default,
            "NULL" => WorkerLogger::Null,
            "FILE" => match config.get_non_empty(props::LOGFILE) {
                Some(path) => WorkerLogger::file(path.into()),
                None => {
                    errors.push(
                        "Missing LOGFILE property for file worker logger".into()
                    );
                    WorkerLogger::Default
                }
            },
            _ => {
                errors.push(format!("Unsupported WORKERLOGGER: {kind}"));
                WorkerLogger::Default
            }
        }
    }

    pub fn file(path: PathBuf) -> Self {
        WorkerLogger::File { path, lock: Mutex::new(()) }
    }

    /// Writes the record for a request.
    pub fn log(&self, log_map: &LogMap) -> Result<(), LogError> {
        match self {
            WorkerLogger::Default => {
                info!(target: AUDIT_LOG_TARGET, "{}", log_map.render());
                Ok(())
            }
            WorkerLogger::File { path, lock } => {
                let line = format!(
                    "{} {}",
                    Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                    log_map.render()
                );
                let _guard = lock.lock().unwrap();
                file::append_line(&line, path).map_err(LogError)
            }
            WorkerLogger::Null => Ok(()),
        }
    }
}


//------------ LogError ------------------------------------------------------

#[derive(Debug)]
pub struct LogError(IoError);

impl fmt::Display for LogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "worker log: {}", self.0)
    }
}

impl error::Error for LogError {}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn file_logger_appends_records() {
        let dir = test::tmp_dir();
        let path = dir.path().join("audit.log");
        let config: WorkerConfig = [
            ("WORKERLOGGER", "file"),
            ("LOGFILE", path.to_str().unwrap()),
        ].into_iter().collect();
        let mut errors = Vec::new();
        let logger = WorkerLogger::from_properties(&config, &mut errors);
        assert!(errors.is_empty());

        let mut log_map = LogMap::default();
        log_map.put("WORKER_ID", 1);
        log_map.put("PROCESS_SUCCESS", true);
        logger.log(&log_map).unwrap();
        logger.log(&log_map).unwrap();

        let content = file::read(&path).unwrap();
        let content = std::str::from_utf8(&content).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("WORKER_ID: 1; PROCESS_SUCCESS: true"));
    }

    #[test]
    fn file_logger_failure_is_reported() {
        let dir = test::tmp_dir();
        // A directory cannot be opened for appending.
        let logger = WorkerLogger::file(dir.path().to_path_buf());
        assert!(logger.log(&LogMap::default()).is_err());
    }

    #[test]
    fn file_logger_needs_a_file() {
        let config: WorkerConfig = [("WORKERLOGGER", "FILE")]
            .into_iter().collect();
        let mut errors = Vec::new();
        WorkerLogger::from_properties(&config, &mut errors);
        assert_eq!(errors.len(), 1);
    }
}
