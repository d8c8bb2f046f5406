//! Saves every logged payload to disk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error};

use crate::listener::TestListener;
use crate::result::{LogDataType, LogStream};

/// Writes `test_log` payloads as `<dir>/<name>.<ext>`.
///
/// Repeated names get a numeric suffix instead of overwriting.
pub struct LogSaver {
    dir: PathBuf,
    seen: Mutex<HashMap<String, usize>>,
}

impl LogSaver {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            seen: Mutex::new(HashMap::new()),
        }
    }

    fn file_name(&self, name: &str, data_type: LogDataType) -> String {
        let safe: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || "-_.".contains(c) { c } else { '_' })
            .collect();
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let count = seen.entry(safe.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            format!("{}.{}", safe, data_type.extension())
        } else {
            format!("{}-{}.{}", safe, count, data_type.extension())
        }
    }
}

#[async_trait]
impl TestListener for LogSaver {
    async fn test_log(&self, name: &str, data_type: LogDataType, stream: &LogStream) {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            error!("Failed to create log directory {}: {}", self.dir.display(), e);
            return;
        }
        let path = self.dir.join(self.file_name(name, data_type));
        match tokio::fs::write(&path, stream.as_bytes()).await {
            Ok(()) => debug!("Saved {} ({} bytes)", path.display(), stream.len()),
            Err(e) => error!("Failed to save log {}: {}", path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_saves_logs_without_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        let saver = LogSaver::new(dir.path().join("logs"));

        saver
            .test_log("host_log", LogDataType::HostLog, &LogStream::from_bytes("one"))
            .await;
        saver
            .test_log("host_log", LogDataType::HostLog, &LogStream::from_bytes("two"))
            .await;
        saver
            .test_log("a/b report", LogDataType::Bugreport, &LogStream::from_bytes("bug"))
            .await;

        let logs = dir.path().join("logs");
        assert_eq!(std::fs::read_to_string(logs.join("host_log.txt")).unwrap(), "one");
        assert_eq!(std::fs::read_to_string(logs.join("host_log-2.txt")).unwrap(), "two");
        assert!(logs.join("a_b_report.zip.txt").exists());
    }
}
