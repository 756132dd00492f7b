use crate::errors::{AppError, AppResult};
use crate::log_monitor::LogFormat;
use crate::models::{RunMode, RunOutcome, TimeoutKind};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RuleOutcome {
    Success,
    Failure { reason: String },
    /// "All tasks done" marker; the result depends on the per-task markers.
    Completion,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub pattern: String,
    pub outcome: RuleOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExitPolicy {
    Success,
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSet {
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub task_markers: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_partial_reason")]
    pub partial_reason: String,
    pub on_exit: ExitPolicy,
    #[serde(default = "default_true")]
    pub enforce_time_limit: bool,
}

fn default_partial_reason() -> String {
    "some tasks did not finish".to_string()
}

fn default_true() -> bool {
    true
}

/// Classification data for one worker version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRules {
    pub auto_proxy: RuleSet,
    pub manual_check: RuleSet,
    pub setup_worker: RuleSet,
    #[serde(default)]
    pub heartbeat_markers: Vec<String>,
    #[serde(default)]
    pub weekly_cap_markers: Vec<String>,
    #[serde(default)]
    pub jackpot_markers: Vec<String>,
    #[serde(default = "default_drop_stage_pattern")]
    pub drop_stage_pattern: String,
    #[serde(default = "default_drop_item_pattern")]
    pub drop_item_pattern: String,
}

fn default_drop_stage_pattern() -> String {
    r"(\d+-\d+) 掉落统计:".to_string()
}

fn default_drop_item_pattern() -> String {
    r"(\S+)\s*:\s*(\d+)\s*\(\+(\d+)\)".to_string()
}

fn rule(pattern: &str, outcome: RuleOutcome) -> Rule {
    Rule {
        pattern: pattern.to_string(),
        outcome,
    }
}

fn failure(reason: &str) -> RuleOutcome {
    RuleOutcome::Failure {
        reason: reason.to_string(),
    }
}

fn markers(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl WorkerRules {
    /// Default table for the reference automation client.
    pub fn builtin() -> Self {
        let login_failed = "worker failed to log in";
        let connection = "debug bridge connection error";
        let no_emulator = "worker did not detect any emulator";
        let stopped = "worker stopped before completion";
        let exited = "worker exited before completion";

        let task_markers = BTreeMap::from([
            ("WakeUp".to_string(), markers(&["完成任务: StartUp", "完成任务: 开始唤醒"])),
            ("Recruiting".to_string(), markers(&["完成任务: Recruit", "完成任务: 自动公招"])),
            ("Base".to_string(), markers(&["完成任务: Infrast", "完成任务: 基建换班"])),
            (
                "Combat".to_string(),
                markers(&["完成任务: Fight", "完成任务: 刷理智", "剿灭任务失败"]),
            ),
            ("Mall".to_string(), markers(&["完成任务: Mall", "完成任务: 获取信用及购物"])),
            ("Mission".to_string(), markers(&["完成任务: Award", "完成任务: 领取奖励"])),
            (
                "AutoRoguelike".to_string(),
                markers(&["完成任务: Roguelike", "完成任务: 自动肉鸽"]),
            ),
            (
                "Reclamation".to_string(),
                markers(&["完成任务: Reclamation", "完成任务: 生息演算"]),
            ),
        ]);

        let auto_proxy = RuleSet {
            rules: vec![
                rule("任务出错: StartUp", failure(login_failed)),
                rule("任务出错: 开始唤醒", failure(login_failed)),
                rule("任务已全部完成！", RuleOutcome::Completion),
                rule(
                    "请 ｢检查连接设置｣ → ｢尝试重启模拟器与 ADB｣ → ｢重启电脑｣",
                    failure(connection),
                ),
                rule("未检测到任何模拟器", failure(no_emulator)),
                rule("已停止", failure(stopped)),
                rule("MaaAssistantArknights GUI exited", failure(exited)),
            ],
            task_markers,
            partial_reason: default_partial_reason(),
            on_exit: ExitPolicy::Failure {
                reason: exited.to_string(),
            },
            enforce_time_limit: true,
        };

        let manual_check = RuleSet {
            rules: vec![
                rule("完成任务: StartUp", RuleOutcome::Success),
                rule("任务出错: StartUp", failure(login_failed)),
                rule(
                    "请 ｢检查连接设置｣ → ｢尝试重启模拟器与 ADB｣ → ｢重启电脑｣",
                    failure(connection),
                ),
                rule("未检测到任何模拟器", failure(no_emulator)),
                rule("已停止", failure(stopped)),
                rule("MaaAssistantArknights GUI exited", failure(exited)),
            ],
            task_markers: BTreeMap::new(),
            partial_reason: default_partial_reason(),
            on_exit: ExitPolicy::Failure {
                reason: exited.to_string(),
            },
            enforce_time_limit: true,
        };

        let setup_worker = RuleSet {
            rules: Vec::new(),
            task_markers: BTreeMap::new(),
            partial_reason: default_partial_reason(),
            on_exit: ExitPolicy::Success,
            enforce_time_limit: false,
        };

        Self {
            auto_proxy,
            manual_check,
            setup_worker,
            heartbeat_markers: markers(&["如果长时间无进一步日志更新，可能需要手动干预。"]),
            weekly_cap_markers: markers(&["剿灭任务失败"]),
            jackpot_markers: markers(&["6★ Tags"]),
            drop_stage_pattern: default_drop_stage_pattern(),
            drop_item_pattern: default_drop_item_pattern(),
        }
    }

    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        let rules: Self = serde_yaml::from_str(raw)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_yaml_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn for_mode(&self, mode: RunMode) -> &RuleSet {
        match mode {
            RunMode::AutoProxy => &self.auto_proxy,
            RunMode::ManualCheck => &self.manual_check,
            RunMode::SetupWorker => &self.setup_worker,
        }
    }

    pub fn hits_weekly_cap(&self, lines: &[String]) -> bool {
        any_marker(lines, &self.weekly_cap_markers)
    }

    pub fn hits_jackpot(&self, lines: &[String]) -> bool {
        any_marker(lines, &self.jackpot_markers)
    }

    fn validate(&self) -> AppResult<()> {
        for set in [&self.auto_proxy, &self.manual_check, &self.setup_worker] {
            if set.rules.iter().any(|rule| rule.pattern.is_empty()) {
                return Err(AppError::ConfigInvalid(
                    "classification patterns must not be empty".to_string(),
                ));
            }
        }
        regex::Regex::new(&self.drop_stage_pattern)
            .map_err(|error| AppError::ConfigInvalid(format!("drop stage pattern: {}", error)))?;
        regex::Regex::new(&self.drop_item_pattern)
            .map_err(|error| AppError::ConfigInvalid(format!("drop item pattern: {}", error)))?;
        Ok(())
    }
}

fn any_marker(lines: &[String], markers: &[String]) -> bool {
    lines
        .iter()
        .any(|line| markers.iter().any(|marker| line.contains(marker.as_str())))
}

/// Everything a verdict depends on. Classification is a pure function of this.
#[derive(Debug, Clone)]
pub struct ClassifyInput<'a> {
    pub lines: &'a [String],
    pub format: &'a LogFormat,
    pub attempt_start: NaiveDateTime,
    pub now: NaiveDateTime,
    pub time_limit: Option<chrono::Duration>,
    pub worker_running: bool,
    pub interrupted: bool,
    pub pending_tasks: &'a BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Wait,
    Terminal(RunOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub verdict: Verdict,
    /// Pending tasks whose completion marker was seen.
    pub completed_tasks: BTreeSet<String>,
}

impl Classification {
    fn terminal(outcome: RunOutcome) -> Self {
        Self {
            verdict: Verdict::Terminal(outcome),
            completed_tasks: BTreeSet::new(),
        }
    }

    fn wait() -> Self {
        Self {
            verdict: Verdict::Wait,
            completed_tasks: BTreeSet::new(),
        }
    }
}

pub fn classify(rules: &RuleSet, heartbeat_markers: &[String], input: &ClassifyInput<'_>) -> Classification {
    if input.interrupted {
        return Classification::terminal(RunOutcome::ManuallyInterrupted);
    }

    let log = input.lines.join("\n");
    for rule in &rules.rules {
        if !log.contains(rule.pattern.as_str()) {
            continue;
        }
        return match &rule.outcome {
            RuleOutcome::Success => Classification::terminal(RunOutcome::Success),
            RuleOutcome::Failure { reason } => {
                Classification::terminal(RunOutcome::PartialFailure(reason.clone()))
            }
            RuleOutcome::Wait => Classification::wait(),
            RuleOutcome::Completion => {
                let completed = input
                    .pending_tasks
                    .iter()
                    .filter(|task| {
                        rules.task_markers.get(*task).is_some_and(|markers| {
                            markers.iter().any(|marker| log.contains(marker.as_str()))
                        })
                    })
                    .cloned()
                    .collect::<BTreeSet<_>>();
                let outcome = if completed.len() == input.pending_tasks.len() {
                    RunOutcome::Success
                } else {
                    RunOutcome::PartialFailure(rules.partial_reason.clone())
                };
                Classification {
                    verdict: Verdict::Terminal(outcome),
                    completed_tasks: completed,
                }
            }
        };
    }

    if !input.worker_running {
        return Classification::terminal(match &rules.on_exit {
            ExitPolicy::Success => RunOutcome::Success,
            ExitPolicy::Failure { reason } => RunOutcome::PartialFailure(reason.clone()),
        });
    }

    if let (true, Some(limit)) = (rules.enforce_time_limit, input.time_limit) {
        let (baseline, kind) = latest_activity(input, heartbeat_markers);
        if input.now - baseline > limit {
            return Classification::terminal(RunOutcome::Timeout(kind));
        }
    }

    Classification::wait()
}

/// Newest parsed timestamp that is not a heartbeat line, or the attempt start.
fn latest_activity(input: &ClassifyInput<'_>, heartbeat_markers: &[String]) -> (NaiveDateTime, TimeoutKind) {
    let latest = input
        .lines
        .iter()
        .rev()
        .filter(|line| !heartbeat_markers.iter().any(|marker| line.contains(marker.as_str())))
        .find_map(|line| input.format.parse_timestamp(line));
    match latest {
        Some(stamp) => (stamp, TimeoutKind::Stalled),
        None if input.lines.is_empty() => (input.attempt_start, TimeoutKind::NoOutput),
        None => (input.attempt_start, TimeoutKind::Stalled),
    }
}
