use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::time::{Duration, Instant};

/// Extra quiet time granted after a companion's configured wait.
pub const COMPANION_SILENCE_GRACE: Duration = Duration::from_secs(10);

/// Process-wide set of executables whose windows must not be treated as user focus.
#[derive(Debug, Default)]
pub struct SilenceRegistry {
    entries: Mutex<HashMap<PathBuf, Instant>>,
}

impl SilenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silence(&self, path: &Path, until: Instant) {
        let mut entries = self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let slot = entries.entry(path.to_path_buf()).or_insert(until);
        if *slot < until {
            *slot = until;
        }
        tracing::debug!(path = %path.display(), "process silenced");
    }

    pub fn remove(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(path)
            .is_some()
    }

    pub fn is_silenced(&self, path: &Path) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(path)
            .is_some_and(|until| Instant::now() < *until)
    }

    pub fn silenced_paths(&self) -> Vec<PathBuf> {
        let now = Instant::now();
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|(_, until)| now < **until)
            .map(|(path, _)| path.clone())
            .collect()
    }
}
