pub mod lock;
pub mod ordered;
pub mod schema;

pub use lock::{LockLease, LockRegistry};
pub use ordered::{ConfigEntry, OrderedSet, ProfileSet};
pub use schema::{ConfigDocument, SchemaKind};

use crate::errors::{AppError, AppResult};
use chrono::Utc;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// One worker script: its own settings plus the ordered profiles it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptConfig {
    pub settings: ConfigDocument,
    pub profiles: ProfileSet,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            settings: ConfigDocument::new(SchemaKind::Script),
            profiles: ProfileSet::new(),
        }
    }
}

impl ConfigEntry for ScriptConfig {
    fn load_entry(raw: &Value) -> AppResult<Self> {
        let settings = ConfigDocument::from_value(
            SchemaKind::Script,
            raw.get("settings").unwrap_or(&Value::Null),
        );
        let profiles = match raw.get("profiles") {
            Some(profiles) => ProfileSet::load(profiles)?,
            None => ProfileSet::new(),
        };
        Ok(Self { settings, profiles })
    }

    fn entry_dict(&self) -> Value {
        serde_json::json!({
            "settings": self.settings.to_dict(),
            "profiles": self.profiles.to_dict(),
        })
    }
}

pub type ScriptSet = OrderedSet<ScriptConfig>;

/// Persisted collection of scripts guarded by per-script advisory locks.
pub struct ConfigStore {
    path: PathBuf,
    scripts: RwLock<ScriptSet>,
    locks: Arc<LockRegistry>,
    /// Held from snapshot to rename so concurrent saves land in order.
    save_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            scripts: RwLock::new(ScriptSet::new()),
            locks: Arc::new(LockRegistry::new()),
            save_lock: Mutex::new(()),
        }
    }

    /// Opens the store at `path`. A corrupted file is copied aside and replaced by an empty store.
    pub async fn open(path: impl Into<PathBuf>) -> AppResult<Self> {
        let path = path.into();
        let scripts = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Value>(&bytes)
                .map_err(AppError::from)
                .and_then(|raw| ScriptSet::load(&raw))
            {
                Ok(scripts) => scripts,
                Err(error) => {
                    let backup = backup_path(&path);
                    tracing::warn!(
                        path = %path.display(),
                        backup = %backup.display(),
                        error = %error,
                        "config store unreadable; starting empty"
                    );
                    tokio::fs::copy(&path, &backup).await?;
                    ScriptSet::new()
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => ScriptSet::new(),
            Err(error) => return Err(error.into()),
        };
        let store = Self {
            path,
            scripts: RwLock::new(scripts),
            locks: Arc::new(LockRegistry::new()),
            save_lock: Mutex::new(()),
        };
        store.save().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self) -> AppResult<()> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let _saving = self.save_lock.lock().await;
        let body = {
            let scripts = self.scripts.read().await;
            serde_json::to_vec_pretty(&scripts.to_dict())?
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, body).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }

    pub async fn load(&self, raw: &Value) -> AppResult<()> {
        let loaded = ScriptSet::load(raw)?;
        *self.scripts.write().await = loaded;
        self.save().await
    }

    pub async fn to_dict(&self) -> Value {
        self.scripts.read().await.to_dict()
    }

    pub async fn add_script(&self, script: ScriptConfig) -> AppResult<Uuid> {
        let id = self.scripts.write().await.add(script);
        self.save().await?;
        Ok(id)
    }

    pub async fn remove_script(&self, script_id: Uuid) -> AppResult<()> {
        self.ensure_unlocked(script_id)?;
        self.scripts.write().await.remove(&script_id)?;
        self.save().await
    }

    pub async fn script(&self, script_id: Uuid) -> AppResult<ScriptConfig> {
        self.scripts
            .read()
            .await
            .get(&script_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("script {}", script_id)))
    }

    pub async fn script_ids(&self) -> Vec<Uuid> {
        self.scripts.read().await.order().to_vec()
    }

    pub async fn get(&self, script_id: Uuid, group: &str, key: &str) -> AppResult<Value> {
        let scripts = self.scripts.read().await;
        let script = scripts
            .get(&script_id)
            .ok_or_else(|| AppError::NotFound(format!("script {}", script_id)))?;
        script.settings.get(group, key).cloned()
    }

    /// Writes one script setting. Fails fast while a run holds the script lock.
    pub async fn set(&self, script_id: Uuid, group: &str, key: &str, value: Value) -> AppResult<()> {
        self.ensure_unlocked(script_id)?;
        {
            let mut scripts = self.scripts.write().await;
            let script = scripts
                .get_mut(&script_id)
                .ok_or_else(|| AppError::NotFound(format!("script {}", script_id)))?;
            script.settings.set(group, key, value)?;
        }
        self.save().await
    }

    pub async fn get_profile_value(
        &self,
        script_id: Uuid,
        profile_id: Uuid,
        group: &str,
        key: &str,
    ) -> AppResult<Value> {
        let scripts = self.scripts.read().await;
        let profile = scripts
            .get(&script_id)
            .and_then(|script| script.profiles.get(&profile_id))
            .ok_or_else(|| AppError::NotFound(format!("profile {} of script {}", profile_id, script_id)))?;
        profile.get(group, key).cloned()
    }

    pub async fn set_profile_value(
        &self,
        script_id: Uuid,
        profile_id: Uuid,
        group: &str,
        key: &str,
        value: Value,
    ) -> AppResult<()> {
        self.ensure_unlocked(script_id)?;
        {
            let mut scripts = self.scripts.write().await;
            let profile = scripts
                .get_mut(&script_id)
                .and_then(|script| script.profiles.get_mut(&profile_id))
                .ok_or_else(|| {
                    AppError::NotFound(format!("profile {} of script {}", profile_id, script_id))
                })?;
            profile.set(group, key, value)?;
        }
        self.save().await
    }

    pub async fn add_profile(&self, script_id: Uuid, profile: ConfigDocument) -> AppResult<Uuid> {
        self.ensure_unlocked(script_id)?;
        let uid = {
            let mut scripts = self.scripts.write().await;
            let script = scripts
                .get_mut(&script_id)
                .ok_or_else(|| AppError::NotFound(format!("script {}", script_id)))?;
            script.profiles.add(profile)
        };
        self.save().await?;
        Ok(uid)
    }

    pub async fn set_profile_order(&self, script_id: Uuid, order: Vec<Uuid>) -> AppResult<()> {
        self.ensure_unlocked(script_id)?;
        {
            let mut scripts = self.scripts.write().await;
            let script = scripts
                .get_mut(&script_id)
                .ok_or_else(|| AppError::NotFound(format!("script {}", script_id)))?;
            script.profiles.set_order(order)?;
        }
        self.save().await
    }

    /// Replaces the profile set of the leased script and persists it.
    pub async fn commit_profiles(&self, lease: &LockLease, profiles: ProfileSet) -> AppResult<()> {
        let script_id = lease.script_id();
        {
            let mut scripts = self.scripts.write().await;
            let script = scripts
                .get_mut(&script_id)
                .ok_or_else(|| AppError::NotFound(format!("script {}", script_id)))?;
            script.profiles = profiles;
        }
        self.save().await
    }

    /// Waits for the script lock. Dropping the lease releases it.
    pub async fn lock(&self, script_id: Uuid) -> AppResult<LockLease> {
        self.locks.lock(script_id).await
    }

    pub fn unlock(&self, lease: LockLease) -> AppResult<()> {
        self.locks.unlock(lease)
    }

    pub fn try_lock(&self, script_id: Uuid) -> AppResult<LockLease> {
        self.locks.try_lock(script_id)
    }

    pub fn is_locked(&self, script_id: Uuid) -> bool {
        self.locks.is_locked(script_id)
    }

    fn ensure_unlocked(&self, script_id: Uuid) -> AppResult<()> {
        if self.locks.is_locked(script_id) {
            return Err(AppError::Lock(format!(
                "script {} is in use by a running task",
                script_id
            )));
        }
        Ok(())
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_else(|| "scripts.json".to_string());
    path.with_file_name(format!("{}.bak-{}", name, stamp))
}

#[cfg(test)]
mod tests {
    use super::{ConfigDocument, ConfigStore, ScriptConfig, SchemaKind};
    use serde_json::json;

    fn script(name: &str) -> ScriptConfig {
        let mut script = ScriptConfig::default();
        script.settings.set("Info", "Name", json!(name)).expect("name");
        script
    }

    #[tokio::test]
    async fn store_persists_and_reopens() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scripts.json");
        let store = ConfigStore::open(&path).await.expect("open");
        let script_id = store.add_script(script("alpha")).await.expect("add script");
        let profile_id = store
            .add_profile(script_id, ConfigDocument::new(SchemaKind::Profile))
            .await
            .expect("add profile");
        store
            .set(script_id, "Run", "RunTimesLimit", json!(5))
            .await
            .expect("set");
        store
            .set_profile_value(script_id, profile_id, "Info", "Name", json!("bob"))
            .await
            .expect("set profile");

        let reopened = ConfigStore::open(&path).await.expect("reopen");
        assert_eq!(
            reopened.get(script_id, "Run", "RunTimesLimit").await.expect("get"),
            json!(5)
        );
        assert_eq!(
            reopened
                .get_profile_value(script_id, profile_id, "Info", "Name")
                .await
                .expect("get profile"),
            json!("bob")
        );
        assert_eq!(reopened.to_dict().await, store.to_dict().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_writes_all_persist() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scripts.json");
        let store = std::sync::Arc::new(ConfigStore::open(&path).await.expect("open"));
        let mut script_ids = Vec::new();
        for index in 0..8 {
            script_ids.push(
                store
                    .add_script(script(&format!("script-{}", index)))
                    .await
                    .expect("add script"),
            );
        }

        let mut tasks = Vec::new();
        for script_id in script_ids.iter().copied() {
            for limit in 1..=20 {
                let store = store.clone();
                tasks.push(tokio::spawn(async move {
                    store.set(script_id, "Run", "RunTimesLimit", json!(limit)).await
                }));
            }
        }
        for task in tasks {
            task.await.expect("join").expect("concurrent set");
        }

        let on_disk: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).expect("read store")).expect("json");
        assert_eq!(on_disk, store.to_dict().await);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupted_store_is_backed_up() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("scripts.json");
        std::fs::write(&path, b"{ not json").expect("write corrupt");
        let store = ConfigStore::open(&path).await.expect("open");
        assert!(store.script_ids().await.is_empty());
        let backups = std::fs::read_dir(temp.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().contains(".bak-"))
            .count();
        assert_eq!(backups, 1);
    }

    #[tokio::test]
    async fn writes_fail_fast_while_locked() {
        let store = ConfigStore::in_memory();
        let script_id = store.add_script(script("alpha")).await.expect("add");
        let lease = store.lock(script_id).await.expect("lease");
        let err = store
            .set(script_id, "Run", "RunTimesLimit", json!(2))
            .await
            .expect_err("locked write");
        assert!(err.to_string().starts_with("LOCK_CONFLICT"));
        assert!(store.try_lock(script_id).is_err());

        let mut profiles = store.script(script_id).await.expect("script").profiles;
        profiles.add(ConfigDocument::new(SchemaKind::Profile));
        store.commit_profiles(&lease, profiles).await.expect("commit under lease");
        drop(lease);

        assert!(!store.is_locked(script_id));
        assert_eq!(store.script(script_id).await.expect("script").profiles.len(), 1);
        store
            .set(script_id, "Run", "RunTimesLimit", json!(2))
            .await
            .expect("unlocked write");
    }
}
