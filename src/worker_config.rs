use crate::config_store::ConfigDocument;
use crate::errors::{AppError, AppResult};
use crate::models::{RunMode, SubPhase};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const SCHEDULED_TIMERS: usize = 8;

/// Where a worker keeps its files, and where this crate keeps copies of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLayout {
    pub root: PathBuf,
    pub executable: PathBuf,
    pub config_file: PathBuf,
    pub log_file: PathBuf,
    pub script_data_dir: PathBuf,
}

impl WorkerLayout {
    pub fn from_settings(settings: &ConfigDocument, data_dir: &Path, script_id: Uuid) -> AppResult<Self> {
        let root = PathBuf::from(settings.get_str("Info", "Path")?);
        Ok(Self {
            executable: root.join(settings.get_str("Worker", "Executable")?),
            config_file: root.join(settings.get_str("Worker", "ConfigFile")?),
            log_file: root.join(settings.get_str("Worker", "LogFile")?),
            script_data_dir: data_dir.join("data").join(script_id.to_string()),
            root,
        })
    }

    fn config_file_name(&self) -> &std::ffi::OsStr {
        self.config_file
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("gui.json"))
    }

    /// Captured worker config for one profile, or the shared default when `profile` is `None`.
    pub fn baseline_path(&self, profile: Option<Uuid>) -> PathBuf {
        let owner = profile
            .map(|uid| uid.to_string())
            .unwrap_or_else(|| "Default".to_string());
        self.script_data_dir
            .join(owner)
            .join("ConfigFile")
            .join(self.config_file_name())
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.script_data_dir.join("Temp")
    }

    pub fn backup_path(&self) -> PathBuf {
        self.backup_dir().join(self.config_file_name())
    }

    pub async fn backup_live_config(&self) -> AppResult<()> {
        tokio::fs::create_dir_all(self.backup_dir()).await?;
        tokio::fs::copy(&self.config_file, self.backup_path()).await?;
        Ok(())
    }

    pub async fn restore_live_config(&self) -> AppResult<()> {
        let backup = self.backup_path();
        if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
            tokio::fs::copy(&backup, &self.config_file).await?;
        }
        match tokio::fs::remove_dir_all(self.backup_dir()).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Copies the live worker config into the baseline slot for `profile`.
    pub async fn capture_baseline(&self, profile: Option<Uuid>) -> AppResult<PathBuf> {
        let target = self.baseline_path(profile);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&self.config_file, &target).await?;
        Ok(target)
    }

    /// Replaces the live worker config with the baseline for `profile`.
    pub async fn import_baseline(&self, profile: Option<Uuid>) -> AppResult<()> {
        let source = self.baseline_path(profile);
        if let Some(parent) = self.config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&source, &self.config_file)
            .await
            .map_err(|error| AppError::PatchWrite(format!("import {}: {}", source.display(), error)))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    Profile,
}

/// What the worker should do after finishing its task queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostAction {
    Stay,
    NoAction,
    ExitGame,
    ExitAll,
}

impl PostAction {
    pub fn from_transition_method(method: &str) -> Self {
        match method {
            "NoAction" => Self::NoAction,
            "ExitGame" => Self::ExitGame,
            _ => Self::ExitAll,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::Stay => "0",
            Self::NoAction => "8",
            Self::ExitGame => "9",
            Self::ExitAll => "12",
        }
    }

    pub fn exits_companion(self) -> bool {
        self == Self::ExitAll
    }
}

/// Parsed worker settings file, addressed by scope and dotted key.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    path: PathBuf,
    doc: Value,
}

impl WorkerConfig {
    pub async fn load(path: &Path) -> AppResult<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|error| AppError::PatchWrite(format!("read {}: {}", path.display(), error)))?;
        let doc: Value = serde_json::from_slice(&bytes)
            .map_err(|error| AppError::PatchWrite(format!("parse {}: {}", path.display(), error)))?;
        if !doc.is_object() {
            return Err(AppError::PatchWrite(format!(
                "{} is not a JSON object",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            doc,
        })
    }

    pub async fn save(&self) -> AppResult<()> {
        let body = serde_json::to_vec_pretty(&self.doc)?;
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, body)
            .await
            .map_err(|error| AppError::PatchWrite(format!("write {}: {}", temp.display(), error)))?;
        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|error| AppError::PatchWrite(format!("replace {}: {}", self.path.display(), error)))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn section(&self, scope: Scope) -> Option<&Map<String, Value>> {
        match scope {
            Scope::Global => self.doc.get("Global"),
            Scope::Profile => self
                .doc
                .get("Configurations")
                .and_then(|configs| configs.get("Default")),
        }
        .and_then(Value::as_object)
    }

    fn section_mut(&mut self, scope: Scope) -> &mut Map<String, Value> {
        let root = ensure_object(&mut self.doc);
        let section = match scope {
            Scope::Global => root.entry("Global").or_insert_with(|| Value::Object(Map::new())),
            Scope::Profile => {
                let configs = ensure_object(
                    root.entry("Configurations")
                        .or_insert_with(|| Value::Object(Map::new())),
                );
                configs
                    .entry("Default")
                    .or_insert_with(|| Value::Object(Map::new()))
            }
        };
        ensure_object(section)
    }

    pub fn get(&self, scope: Scope, key: &str) -> Option<String> {
        self.section(scope)
            .and_then(|section| section.get(key))
            .map(|value| match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            })
    }

    pub fn get_flag(&self, scope: Scope, key: &str) -> bool {
        self.get(scope, key)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    pub fn set(&mut self, scope: Scope, key: &str, value: impl Into<String>) {
        self.section_mut(scope)
            .insert(key.to_string(), Value::String(value.into()));
    }

    pub fn set_flag(&mut self, scope: Scope, key: &str, value: bool) {
        self.set(scope, key, if value { "True" } else { "False" });
    }

    /// Points the worker at its `Default` configuration.
    pub fn normalize_current(&mut self) {
        ensure_object(&mut self.doc).insert("Current".to_string(), Value::String("Default".to_string()));
    }
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

/// Account names that look like 11-digit phone numbers are masked the way the worker stores them.
pub fn mask_account(server: &str, id: &str) -> String {
    let chars = id.chars().collect::<Vec<_>>();
    if server == "Official" && chars.len() == 11 {
        let head = chars[..3].iter().collect::<String>();
        let tail = chars[7..].iter().collect::<String>();
        format!("{}****{}", head, tail)
    } else {
        id.to_string()
    }
}

/// Task flags in the order the worker's queue expects them.
pub const TASKS: &[&str] = &[
    "WakeUp",
    "Recruiting",
    "Base",
    "Combat",
    "Mall",
    "Mission",
    "AutoRoguelike",
    "Reclamation",
];

/// Pending task set for a profile and sub-phase.
pub fn pending_tasks(profile: &ConfigDocument, sub_phase: SubPhase) -> AppResult<BTreeMap<String, bool>> {
    let mut tasks = BTreeMap::new();
    for task in TASKS {
        let enabled = match sub_phase {
            SubPhase::Priority => matches!(*task, "WakeUp" | "Combat"),
            SubPhase::Routine => profile.get_bool("Task", &format!("If{}", task))?,
            SubPhase::Check => *task == "WakeUp",
            SubPhase::Setup => false,
        };
        tasks.insert(task.to_string(), enabled);
    }
    Ok(tasks)
}

#[derive(Debug, Clone)]
pub struct PatchPlan {
    pub mode: RunMode,
    pub sub_phase: SubPhase,
    pub post_action: PostAction,
    pub open_companion: bool,
    pub server: String,
    pub account_id: String,
    pub stage: String,
    pub priority_stage: String,
    pub medicine: i64,
    pub tasks: BTreeMap<String, bool>,
}

impl PatchPlan {
    pub fn for_profile(
        mode: RunMode,
        sub_phase: SubPhase,
        profile: &ConfigDocument,
        post_action: PostAction,
        open_companion: bool,
        tasks: BTreeMap<String, bool>,
    ) -> AppResult<Self> {
        Ok(Self {
            mode,
            sub_phase,
            post_action,
            open_companion,
            server: profile.get_str("Info", "Server")?,
            account_id: profile.get_str("Info", "Id")?,
            stage: profile.get_str("Info", "Stage")?,
            priority_stage: profile.get_str("Info", "Priority")?,
            medicine: profile.get_i64("Info", "MedicineNumb")?,
            tasks,
        })
    }

    /// Plan for a hands-on settings session: nothing runs automatically.
    pub fn for_setup() -> Self {
        Self {
            mode: RunMode::SetupWorker,
            sub_phase: SubPhase::Setup,
            post_action: PostAction::Stay,
            open_companion: false,
            server: String::new(),
            account_id: String::new(),
            stage: String::new(),
            priority_stage: String::new(),
            medicine: 0,
            tasks: TASKS.iter().map(|task| (task.to_string(), false)).collect(),
        }
    }
}

pub fn apply_patch(config: &mut WorkerConfig, plan: &PatchPlan) {
    config.normalize_current();
    for index in 1..=SCHEDULED_TIMERS {
        config.set_flag(Scope::Global, &format!("Timer.Timer{}", index), false);
    }
    for key in [
        "VersionUpdate.ScheduledUpdateCheck",
        "VersionUpdate.AutoDownloadUpdatePackage",
        "VersionUpdate.AutoInstallUpdatePackage",
    ] {
        config.set_flag(Scope::Global, key, false);
    }

    config.set(Scope::Profile, "MainFunction.PostActions", plan.post_action.code());
    config.set_flag(Scope::Profile, "Start.RunDirectly", plan.mode != RunMode::SetupWorker);
    config.set_flag(Scope::Profile, "Start.OpenEmulatorAfterLaunch", plan.open_companion);
    for (task, enabled) in &plan.tasks {
        config.set_flag(Scope::Profile, &format!("TaskQueue.{}.IsChecked", task), *enabled);
    }
    if plan.mode == RunMode::SetupWorker {
        return;
    }

    config.set(Scope::Profile, "Start.ClientType", plan.server.clone());
    if !plan.account_id.is_empty() {
        config.set(
            Scope::Profile,
            "Start.AccountName",
            mask_account(&plan.server, &plan.account_id),
        );
    }
    if plan.mode != RunMode::AutoProxy {
        return;
    }

    for (order, task) in TASKS.iter().enumerate() {
        config.set(Scope::Profile, &format!("TaskQueue.Order.{}", task), order.to_string());
    }
    config.set_flag(Scope::Profile, "MainFunction.UseMedicine", plan.medicine > 0);
    config.set(
        Scope::Profile,
        "MainFunction.UseMedicine.Quantity",
        plan.medicine.to_string(),
    );
    match plan.sub_phase {
        SubPhase::Priority => {
            config.set(Scope::Profile, "MainFunction.Stage1", "Annihilation");
            config.set_flag(Scope::Profile, "MainFunction.Annihilation.UseCustom", true);
            config.set(
                Scope::Profile,
                "MainFunction.Annihilation.Stage",
                plan.priority_stage.clone(),
            );
            config.set_flag(Scope::Profile, "Fight.UseRemainingSanityStage", false);
        }
        _ => {
            let stage = if plan.stage == "-" { String::new() } else { plan.stage.clone() };
            config.set(Scope::Profile, "MainFunction.Stage1", stage);
            config.set_flag(Scope::Profile, "MainFunction.Annihilation.UseCustom", false);
        }
    }
}
