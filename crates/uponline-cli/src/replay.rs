//! Replay of recorded telemetry from a JSON-lines file
//!
//! Each non-empty line is one sample:
//!
//! ```text
//! {"entity_id":"B3","metric_kind":"inlet_temperature","value":38.4,"timestamp":"2026-03-14T11:58:00Z"}
//! ```
//!
//! Lines starting with `#` are comments. Malformed lines are logged and
//! skipped; they never stop the replay.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uponline_core::{TelemetrySample, TelemetrySource};

#[derive(Debug)]
pub struct JsonLinesSource {
    path: PathBuf,
    name: String,
    stopped: AtomicBool,
}

impl JsonLinesSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let name = format!("replay:{}", path.display());
        Self {
            path,
            name,
            stopped: AtomicBool::new(false),
        }
    }
}

/// Parse one line. `Ok(None)` for blank lines and comments.
pub fn parse_line(line: &str) -> serde_json::Result<Option<TelemetrySample>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

#[async_trait]
impl TelemetrySource for JsonLinesSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, sender: mpsc::Sender<TelemetrySample>) -> uponline_core::Result<u64> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();

        let mut sent = 0u64;
        let mut line_no = 0usize;
        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            if self.stopped.load(Ordering::SeqCst) {
                debug!(source = %self.name, "Replay stopped");
                break;
            }
            match parse_line(&line) {
                Ok(Some(sample)) => {
                    if sender.send(sample).await.is_err() {
                        debug!(source = %self.name, "Receiver dropped, ending replay");
                        break;
                    }
                    sent += 1;
                }
                Ok(None) => {}
                Err(e) => warn!(source = %self.name, line = line_no, "Skipping malformed sample: {}", e),
            }
        }

        Ok(sent)
    }

    async fn stop(&self) -> uponline_core::Result<()> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use uponline_core::MetricKind;

    #[test]
    fn test_parse_line() {
        let sample = parse_line(
            r#"{"entity_id":"B3","metric_kind":"inlet_temperature","value":38.4,"timestamp":"2026-03-14T11:58:00Z"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(sample.entity_id, "B3");
        assert_eq!(sample.metric_kind, MetricKind::InletTemperature);

        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("# recorded 2026-03-14").unwrap().is_none());
        assert!(parse_line("{not json").is_err());
    }

    #[tokio::test]
    async fn test_replay_skips_malformed_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# header").unwrap();
        writeln!(
            file,
            r#"{{"entity_id":"A1","metric_kind":"power_draw","value":14.2,"timestamp":"2026-03-14T11:58:00Z"}}"#
        )
        .unwrap();
        writeln!(file, "garbage").unwrap();
        writeln!(
            file,
            r#"{{"entity_id":"A1","metric_kind":"inlet_temperature","value":24.0,"timestamp":"2026-03-14T11:58:01Z"}}"#
        )
        .unwrap();

        let source = JsonLinesSource::new(file.path());
        let (tx, mut rx) = mpsc::channel(8);
        let sent = source.start(tx).await.unwrap();
        assert_eq!(sent, 2);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.metric_kind, MetricKind::PowerDraw);
        assert_eq!(rx.recv().await.unwrap().value, 24.0);
    }

    #[tokio::test]
    async fn test_stopped_source_sends_nothing() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"entity_id":"A1","metric_kind":"power_draw","value":14.2,"timestamp":"2026-03-14T11:58:00Z"}}"#
        )
        .unwrap();

        let source = JsonLinesSource::new(file.path());
        source.stop().await.unwrap();
        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(source.start(tx).await.unwrap(), 0);
    }
}
