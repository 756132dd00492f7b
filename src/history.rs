use crate::classification::WorkerRules;
use crate::errors::AppResult;
use crate::models::RunStatistics;
use anyhow::Context;
use chrono::NaiveDateTime;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub type DropTable = BTreeMap<String, BTreeMap<String, u64>>;

/// Sums per-stage item gains from drop report blocks in a worker log.
pub struct DropParser {
    stage: Regex,
    item: Regex,
}

impl DropParser {
    pub fn new(rules: &WorkerRules) -> AppResult<Self> {
        let stage = Regex::new(&rules.drop_stage_pattern)
            .context("compile drop stage pattern")?;
        let item = Regex::new(&rules.drop_item_pattern)
            .context("compile drop item pattern")?;
        Ok(Self { stage, item })
    }

    pub fn parse(&self, lines: &[String]) -> DropTable {
        let mut table = DropTable::new();
        let mut current: Option<String> = None;
        for line in lines {
            if let Some(stage) = self.stage.captures(line).and_then(|caps| caps.get(1)) {
                current = Some(stage.as_str().to_string());
                continue;
            }
            let Some(stage) = &current else {
                continue;
            };
            for caps in self.item.captures_iter(line) {
                let (Some(item), Some(gain)) = (caps.get(1), caps.get(3)) else {
                    continue;
                };
                let Ok(gain) = gain.as_str().parse::<u64>() else {
                    continue;
                };
                *table
                    .entry(stage.clone())
                    .or_default()
                    .entry(item.as_str().to_string())
                    .or_default() += gain;
            }
        }
        table
    }
}

pub fn merge_drops(into: &mut DropTable, from: &DropTable) {
    for (stage, items) in from {
        let target = into.entry(stage.clone()).or_default();
        for (item, gain) in items {
            *target.entry(item.clone()).or_default() += gain;
        }
    }
}

/// Writes per-attempt log copies and per-run statistics under `<data>/history`.
#[derive(Debug, Clone)]
pub struct HistoryWriter {
    root: PathBuf,
}

impl HistoryWriter {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("history"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn slot(&self, owner: &str, started_at: NaiveDateTime) -> PathBuf {
        self.root
            .join(started_at.format("%Y-%m-%d").to_string())
            .join(sanitize_filename_component(owner))
            .join(started_at.format("%H-%M-%S").to_string())
    }

    /// Saves the attempt's log lines and parsed drops; returns the `.log` path.
    pub async fn save_attempt(
        &self,
        profile_name: &str,
        started_at: NaiveDateTime,
        lines: &[String],
        drops: &DropTable,
    ) -> AppResult<PathBuf> {
        let base = self.slot(profile_name, started_at);
        if let Some(parent) = base.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let log_path = base.with_extension("log");
        let mut body = lines.join("\n");
        body.push('\n');
        tokio::fs::write(&log_path, body)
            .await
            .with_context(|| format!("write {}", log_path.display()))?;

        let summary = json!({
            "profile": profile_name,
            "startedAt": started_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            "drops": drops,
        });
        let json_path = base.with_extension("json");
        tokio::fs::write(&json_path, serde_json::to_vec_pretty(&summary)?)
            .await
            .with_context(|| format!("write {}", json_path.display()))?;
        Ok(log_path)
    }

    pub async fn save_statistics(
        &self,
        statistics: &RunStatistics,
        started_at: NaiveDateTime,
    ) -> AppResult<PathBuf> {
        let path = self
            .slot(&statistics.script_name, started_at)
            .with_extension("json");
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create {}", parent.display()))?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(statistics)?)
            .await
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }
}

fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch.is_alphanumeric() || ch == '-' || ch == '_' {
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    let candidate: String = out.trim_matches('_').chars().take(120).collect();
    if candidate.is_empty() {
        "profile".to_string()
    } else {
        candidate
    }
}
