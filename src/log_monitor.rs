use crate::errors::{AppError, AppResult};
use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Log file poll interval.
pub const LOG_POLL_INTERVAL: Duration = Duration::from_millis(1000);
/// A snapshot is delivered at least this often even when nothing changed.
pub const LOG_WATCHDOG_INTERVAL: Duration = Duration::from_secs(60);
pub const LOG_READ_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const LOG_READ_BACKOFF_CEILING: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFormat {
    pub time_start: usize,
    pub time_end: usize,
    pub time_format: String,
}

impl Default for LogFormat {
    fn default() -> Self {
        Self {
            time_start: 1,
            time_end: 20,
            time_format: "%Y-%m-%d %H:%M:%S".to_string(),
        }
    }
}

impl LogFormat {
    /// Parses the timestamp found at `[time_start, time_end)` bytes of `line`.
    pub fn parse_timestamp(&self, line: &str) -> Option<NaiveDateTime> {
        let slice = line.get(self.time_start..self.time_end)?;
        NaiveDateTime::parse_from_str(slice, &self.time_format).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTiming {
    pub poll_interval: Duration,
    pub watchdog_interval: Duration,
    pub backoff_initial: Duration,
    pub backoff_ceiling: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            poll_interval: LOG_POLL_INTERVAL,
            watchdog_interval: LOG_WATCHDOG_INTERVAL,
            backoff_initial: LOG_READ_BACKOFF_INITIAL,
            backoff_ceiling: LOG_READ_BACKOFF_CEILING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSnapshot {
    pub lines: Vec<String>,
    /// Set when the snapshot was sent by the watchdog rather than a content change.
    pub watchdog: bool,
}

/// Returns every line from the first one stamped strictly after `run_start`.
pub fn new_content(text: &str, run_start: NaiveDateTime, format: &LogFormat) -> Vec<String> {
    let mut lines = text.lines();
    let mut collected = Vec::new();
    for line in lines.by_ref() {
        if format
            .parse_timestamp(line)
            .is_some_and(|stamp| stamp > run_start)
        {
            collected.push(line.to_string());
            break;
        }
    }
    collected.extend(lines.map(str::to_string));
    collected
}

struct ActiveTail {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

/// Tails one append-only log file and delivers [`LogSnapshot`]s over a channel.
pub struct LogTailMonitor {
    format: LogFormat,
    timing: MonitorTiming,
    active: StdMutex<Option<ActiveTail>>,
}

impl LogTailMonitor {
    pub fn new(format: LogFormat, timing: MonitorTiming) -> Self {
        Self {
            format,
            timing,
            active: StdMutex::new(None),
        }
    }

    pub fn format(&self) -> &LogFormat {
        &self.format
    }

    pub fn start(
        &self,
        path: &Path,
        run_start: NaiveDateTime,
        sink: mpsc::Sender<LogSnapshot>,
    ) -> AppResult<()> {
        if path.is_dir() {
            return Err(AppError::ConfigInvalid(format!(
                "log path {} is a directory",
                path.display()
            )));
        }
        self.stop();

        let token = CancellationToken::new();
        let tail = TailLoop {
            path: path.to_path_buf(),
            run_start,
            format: self.format.clone(),
            timing: self.timing,
            sink,
            token: token.clone(),
        };
        let handle = tokio::spawn(tail.run());
        tracing::debug!(path = %path.display(), run_start = %run_start, "log monitor started");

        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *active = Some(ActiveTail {
            token,
            _handle: handle,
        });
        Ok(())
    }

    /// Cancels the polling loop. Safe to call repeatedly and from the snapshot consumer.
    pub fn stop(&self) {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(active) = previous {
            active.token.cancel();
            tracing::debug!("log monitor stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .map(|active| active.is_some())
            .unwrap_or(false)
    }
}

impl Drop for LogTailMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TailLoop {
    path: PathBuf,
    run_start: NaiveDateTime,
    format: LogFormat,
    timing: MonitorTiming,
    sink: mpsc::Sender<LogSnapshot>,
    token: CancellationToken,
}

impl TailLoop {
    async fn run(self) {
        let mut previous: Vec<String> = Vec::new();
        let mut last_callback = Instant::now();
        let mut backoff: Option<Duration> = None;

        loop {
            let mut changed = false;
            match read_log(&self.path).await {
                Ok(text) => {
                    backoff = None;
                    let lines = new_content(&text, self.run_start, &self.format);
                    if lines != previous {
                        previous = lines;
                        changed = true;
                    }
                }
                Err(error) => {
                    let next = backoff
                        .map(|delay| (delay * 2).min(self.timing.backoff_ceiling))
                        .unwrap_or(self.timing.backoff_initial.min(self.timing.backoff_ceiling));
                    tracing::warn!(
                        path = %self.path.display(),
                        error = %error,
                        retry_ms = next.as_millis() as u64,
                        "log read failed; backing off"
                    );
                    backoff = Some(next);
                }
            }

            // Failing reads still repeat the last known content on the watchdog.
            if changed || last_callback.elapsed() >= self.timing.watchdog_interval {
                last_callback = Instant::now();
                let snapshot = LogSnapshot {
                    lines: previous.clone(),
                    watchdog: !changed,
                };
                tokio::select! {
                    _ = self.token.cancelled() => break,
                    sent = self.sink.send(snapshot) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }

            let delay = backoff
                .map(|delay| delay.min(self.timing.watchdog_interval))
                .unwrap_or(self.timing.poll_interval);
            tokio::select! {
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Undecodable bytes become U+FFFD so a corrupted line never stalls the tail.
async fn read_log(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::{
        new_content, LogFormat, LogSnapshot, LogTailMonitor, MonitorTiming, LOG_POLL_INTERVAL,
        LOG_WATCHDOG_INTERVAL,
    };
    use chrono::NaiveDateTime;
    use tokio::sync::mpsc;
    use tokio::time::{timeout, Duration};

    fn at(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").expect("timestamp")
    }

    fn fast_timing() -> MonitorTiming {
        MonitorTiming {
            poll_interval: Duration::from_millis(20),
            watchdog_interval: Duration::from_millis(300),
            backoff_initial: Duration::from_millis(20),
            backoff_ceiling: Duration::from_millis(80),
        }
    }

    #[test]
    fn intervals_match_documented_values() {
        assert_eq!(LOG_POLL_INTERVAL, Duration::from_millis(1000));
        assert_eq!(LOG_WATCHDOG_INTERVAL, Duration::from_secs(60));
    }

    #[test]
    fn new_content_starts_at_first_line_after_run_start() {
        let text = "garbage before\n[2024-05-01 10:00:00] old\n[2024-05-01 10:00:05] new one\nno stamp\n[2024-05-01 09:00:00] out of order\n";
        let lines = new_content(text, at("2024-05-01 10:00:00"), &LogFormat::default());
        assert_eq!(
            lines,
            vec![
                "[2024-05-01 10:00:05] new one".to_string(),
                "no stamp".to_string(),
                "[2024-05-01 09:00:00] out of order".to_string(),
            ]
        );
    }

    #[test]
    fn nothing_is_new_until_a_line_parses() {
        let text = "no stamp\nstill nothing\n[2024-05-01 09:59:59] earlier\n";
        assert!(new_content(text, at("2024-05-01 10:00:00"), &LogFormat::default()).is_empty());
    }

    #[test]
    fn timestamp_slice_must_fall_on_char_boundaries() {
        let format = LogFormat::default();
        assert!(format.parse_timestamp("é2024-05-01 10:00:00]").is_none());
        assert!(format.parse_timestamp("[short").is_none());
        assert_eq!(
            format.parse_timestamp("[2024-05-01 10:00:00] ok"),
            Some(at("2024-05-01 10:00:00"))
        );
    }

    #[tokio::test]
    async fn delivers_changes_and_stops() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("worker.log");
        std::fs::write(&path, "[2024-05-01 09:00:00] old\n").expect("seed");

        let monitor = LogTailMonitor::new(LogFormat::default(), fast_timing());
        let (tx, mut rx) = mpsc::channel::<LogSnapshot>(8);
        monitor
            .start(&path, at("2024-05-01 10:00:00"), tx)
            .expect("start");

        std::fs::write(
            &path,
            "[2024-05-01 09:00:00] old\n[2024-05-01 10:00:01] hello\n",
        )
        .expect("append");
        let snapshot = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("snapshot in time")
            .expect("channel open");
        assert_eq!(snapshot.lines, vec!["[2024-05-01 10:00:01] hello".to_string()]);
        assert!(!snapshot.watchdog);

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_active());
        let closed = timeout(Duration::from_secs(2), async {
            while rx.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn missing_file_is_retried_until_it_appears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("late.log");
        let monitor = LogTailMonitor::new(LogFormat::default(), fast_timing());
        let (tx, mut rx) = mpsc::channel::<LogSnapshot>(8);
        monitor
            .start(&path, at("2024-05-01 10:00:00"), tx)
            .expect("start");

        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::write(&path, "[2024-05-01 10:00:02] arrived\n").expect("create");
        let snapshot = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("snapshot in time")
            .expect("channel open");
        assert_eq!(snapshot.lines.len(), 1);
        monitor.stop();
    }

    #[tokio::test]
    async fn invalid_bytes_do_not_silence_the_tail() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("worker.log");
        std::fs::write(
            &path,
            b"[2024-05-01 10:00:01] working\n[2024-05-01 10:00:02] \xff\xfe bad bytes\n",
        )
        .expect("seed");

        let monitor = LogTailMonitor::new(LogFormat::default(), fast_timing());
        let (tx, mut rx) = mpsc::channel::<LogSnapshot>(8);
        monitor
            .start(&path, at("2024-05-01 10:00:00"), tx)
            .expect("start");

        let first = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("snapshot in time")
            .expect("channel open");
        assert!(!first.watchdog);
        assert_eq!(first.lines.len(), 2);
        assert_eq!(first.lines[0], "[2024-05-01 10:00:01] working");
        assert!(first.lines[1].starts_with("[2024-05-01 10:00:02] "));
        assert!(first.lines[1].contains('\u{FFFD}'));

        let repeated = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watchdog in time")
            .expect("channel open");
        assert!(repeated.watchdog);
        assert_eq!(repeated.lines, first.lines);
        monitor.stop();
    }

    #[tokio::test]
    async fn watchdog_fires_while_the_file_is_missing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("never.log");
        let monitor = LogTailMonitor::new(LogFormat::default(), fast_timing());
        let (tx, mut rx) = mpsc::channel::<LogSnapshot>(8);
        monitor
            .start(&path, at("2024-05-01 10:00:00"), tx)
            .expect("start");

        let snapshot = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("watchdog in time")
            .expect("channel open");
        assert!(snapshot.watchdog);
        assert!(snapshot.lines.is_empty());
        monitor.stop();
    }

    #[tokio::test]
    async fn directory_paths_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let monitor = LogTailMonitor::new(LogFormat::default(), fast_timing());
        let (tx, _rx) = mpsc::channel::<LogSnapshot>(1);
        assert!(monitor
            .start(temp.path(), at("2024-05-01 10:00:00"), tx)
            .is_err());
    }
}
