use crate::config_store::ScriptConfig;
use crate::errors::{AppError, AppResult};
use crate::log_monitor::LogFormat;
use crate::models::RunMode;
use crate::worker_config::WorkerLayout;
use uuid::Uuid;

const MIN_RUN_TIMES: i64 = 1;
const MAX_RUN_TIMES: i64 = 1024;
const MIN_TIME_LIMIT_MINUTES: i64 = 1;
const MAX_TIME_LIMIT_MINUTES: i64 = 1024;
const MAX_LOG_TIMESTAMP_WIDTH: usize = 64;

/// Checks run before any lock is taken or process spawned.
#[derive(Debug, Clone, Default)]
pub struct PreflightPolicy;

impl PreflightPolicy {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(
        &self,
        mode: RunMode,
        profile_id: Option<Uuid>,
        script: &ScriptConfig,
        layout: &WorkerLayout,
    ) -> AppResult<()> {
        self.validate_paths(layout)?;
        self.validate_log_format(&log_format(script)?)?;
        self.validate_run_bounds(script)?;

        if let Some(profile_id) = profile_id {
            if !script.profiles.contains(&profile_id) {
                return Err(AppError::ConfigInvalid(format!(
                    "profile {} does not belong to this script",
                    profile_id
                )));
            }
        }

        let baseline_required = mode != RunMode::SetupWorker || profile_id.is_some();
        if baseline_required {
            let baseline = layout.baseline_path(None);
            if !baseline.is_file() {
                return Err(AppError::ConfigInvalid(format!(
                    "no captured worker configuration at {}; run the worker setup first",
                    baseline.display()
                )));
            }
        }
        Ok(())
    }

    fn validate_paths(&self, layout: &WorkerLayout) -> AppResult<()> {
        if !layout.root.is_dir() {
            return Err(AppError::ConfigInvalid(format!(
                "worker directory {} does not exist",
                layout.root.display()
            )));
        }
        if !layout.executable.is_file() {
            return Err(AppError::ConfigInvalid(format!(
                "worker executable {} does not exist",
                layout.executable.display()
            )));
        }
        if !layout.config_file.is_file() {
            return Err(AppError::ConfigInvalid(format!(
                "worker config {} does not exist",
                layout.config_file.display()
            )));
        }
        if layout.log_file.is_dir() {
            return Err(AppError::ConfigInvalid(format!(
                "worker log path {} is a directory",
                layout.log_file.display()
            )));
        }
        Ok(())
    }

    fn validate_log_format(&self, format: &LogFormat) -> AppResult<()> {
        if format.time_end <= format.time_start
            || format.time_end - format.time_start > MAX_LOG_TIMESTAMP_WIDTH
        {
            return Err(AppError::ConfigInvalid(format!(
                "log timestamp range {}..{} is invalid",
                format.time_start, format.time_end
            )));
        }
        if format.time_format.trim().is_empty() {
            return Err(AppError::ConfigInvalid(
                "log timestamp format is empty".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_run_bounds(&self, script: &ScriptConfig) -> AppResult<()> {
        let run_times = script.settings.get_i64("Run", "RunTimesLimit")?;
        if !(MIN_RUN_TIMES..=MAX_RUN_TIMES).contains(&run_times) {
            return Err(AppError::ConfigInvalid(format!(
                "run times limit {} is out of allowed range ({}..={})",
                run_times, MIN_RUN_TIMES, MAX_RUN_TIMES
            )));
        }
        for key in ["PriorityTimeLimit", "RoutineTimeLimit"] {
            let minutes = script.settings.get_i64("Run", key)?;
            if !(MIN_TIME_LIMIT_MINUTES..=MAX_TIME_LIMIT_MINUTES).contains(&minutes) {
                return Err(AppError::ConfigInvalid(format!(
                    "{} {} is out of allowed range ({}..={}) minutes",
                    key, minutes, MIN_TIME_LIMIT_MINUTES, MAX_TIME_LIMIT_MINUTES
                )));
            }
        }
        Ok(())
    }
}

/// Timestamp layout of the worker log as configured on the script.
pub fn log_format(script: &ScriptConfig) -> AppResult<LogFormat> {
    let settings = &script.settings;
    Ok(LogFormat {
        time_start: usize::try_from(settings.get_i64("Worker", "LogTimeStart")?).unwrap_or(0),
        time_end: usize::try_from(settings.get_i64("Worker", "LogTimeEnd")?).unwrap_or(0),
        time_format: settings.get_str("Worker", "LogTimeFormat")?,
    })
}

#[cfg(test)]
mod tests {
    use super::PreflightPolicy;
    use crate::config_store::ScriptConfig;
    use crate::models::RunMode;
    use crate::worker_config::WorkerLayout;
    use serde_json::json;
    use std::path::Path;
    use uuid::Uuid;

    fn script(root: &Path) -> ScriptConfig {
        let mut script = ScriptConfig::default();
        script
            .settings
            .set("Info", "Path", json!(root.to_string_lossy()))
            .expect("path");
        script
            .settings
            .set("Worker", "Executable", json!("worker.sh"))
            .expect("executable");
        script
    }

    fn prepare(root: &Path) {
        std::fs::create_dir_all(root.join("config")).expect("config dir");
        std::fs::write(root.join("worker.sh"), b"#!/bin/sh\n").expect("worker");
        std::fs::write(root.join("config/gui.json"), b"{}").expect("config");
    }

    #[test]
    fn missing_executable_is_config_invalid() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("worker");
        std::fs::create_dir_all(&root).expect("root");
        let script = script(&root);
        let layout = WorkerLayout::from_settings(&script.settings, temp.path(), Uuid::new_v4()).expect("layout");
        let err = PreflightPolicy::new()
            .validate(RunMode::SetupWorker, None, &script, &layout)
            .expect_err("missing executable");
        assert!(err.to_string().starts_with("CONFIG_INVALID"));
    }

    #[test]
    fn baseline_is_required_outside_plain_setup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("worker");
        prepare(&root);
        let mut script = script(&root);
        let profile_id = script
            .profiles
            .add(crate::config_store::ConfigDocument::new(crate::config_store::SchemaKind::Profile));
        let layout = WorkerLayout::from_settings(&script.settings, temp.path(), Uuid::new_v4()).expect("layout");
        let policy = PreflightPolicy::new();

        policy
            .validate(RunMode::SetupWorker, None, &script, &layout)
            .expect("setup without profile needs no baseline");
        assert!(policy
            .validate(RunMode::SetupWorker, Some(profile_id), &script, &layout)
            .is_err());
        assert!(policy
            .validate(RunMode::AutoProxy, None, &script, &layout)
            .is_err());

        let baseline = layout.baseline_path(None);
        std::fs::create_dir_all(baseline.parent().expect("parent")).expect("baseline dir");
        std::fs::write(&baseline, b"{}").expect("baseline");
        policy
            .validate(RunMode::AutoProxy, None, &script, &layout)
            .expect("baseline present");
        assert!(policy
            .validate(RunMode::ManualCheck, Some(Uuid::new_v4()), &script, &layout)
            .is_err());
    }

    #[test]
    fn inverted_timestamp_range_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().join("worker");
        prepare(&root);
        let mut script = script(&root);
        script
            .settings
            .set("Worker", "LogTimeStart", json!(30))
            .expect("start");
        let layout = WorkerLayout::from_settings(&script.settings, temp.path(), Uuid::new_v4()).expect("layout");
        let err = PreflightPolicy::new()
            .validate(RunMode::SetupWorker, None, &script, &layout)
            .expect_err("range");
        assert!(err.to_string().contains("timestamp range"));
    }
}
