use crate::classification::{classify, ClassifyInput, Verdict, WorkerRules};
use crate::companion::{rediscover_address, AdbBridgeProvider, BridgeProvider, CompanionSettings, DeviceBridge};
use crate::config_store::{ConfigDocument, ConfigStore, LockLease, ProfileSet};
use crate::errors::{AppError, AppResult};
use crate::history::{merge_drops, DropParser, DropTable, HistoryWriter};
use crate::log_monitor::{new_content, LogFormat, LogSnapshot, LogTailMonitor, MonitorTiming};
use crate::models::{
    AttemptRecord, ProfileMode, ProfileReport, ProfileSnapshot, ProfileStatus, ProgressEvent, RunMode,
    RunOutcome, RunReport, RunStatistics, SubPhase, SubPhaseReport,
};
use crate::notify::{NotificationKind, Notifier, ProgressSink, TracingNotifier};
use crate::policy::{log_format, PreflightPolicy};
use crate::process_tracker::{kill_by_executable, ProcessTracker, PROCESS_POLL_INTERVAL};
use crate::silence::{SilenceRegistry, COMPANION_SILENCE_GRACE};
use crate::worker_config::{
    apply_patch, pending_tasks, PatchPlan, PostAction, Scope, WorkerConfig, WorkerLayout, TASKS,
};
use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Pause after an outcome before teardown so the worker can release its handles.
pub const SETTLE_DELAY: Duration = Duration::from_secs(10);
/// Server days roll over at 04:00 local time.
pub const SERVER_DAY_ROLLOVER_HOUR: i64 = 4;
/// Configured time limits are expressed in minutes.
const TIME_LIMIT_UNIT: Duration = Duration::from_secs(60);
const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunTiming {
    pub settle_delay: Duration,
    pub process_poll: Duration,
    pub monitor: MonitorTiming,
    pub time_limit_unit: Duration,
    pub silence_grace: Duration,
    /// Replaces the companion wait from the worker config when set.
    pub companion_wait: Option<Duration>,
}

impl Default for RunTiming {
    fn default() -> Self {
        Self {
            settle_delay: SETTLE_DELAY,
            process_poll: PROCESS_POLL_INTERVAL,
            monitor: MonitorTiming::default(),
            time_limit_unit: TIME_LIMIT_UNIT,
            silence_grace: COMPANION_SILENCE_GRACE,
            companion_wait: None,
        }
    }
}

/// One orchestration request. Immutable once handed to the state machine.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: RunMode,
    pub script_id: Uuid,
    pub profile_id: Option<Uuid>,
    pub progress: ProgressSink,
}

impl RunRequest {
    pub fn new(mode: RunMode, script_id: Uuid) -> Self {
        Self {
            mode,
            script_id,
            profile_id: None,
            progress: ProgressSink::disconnected(),
        }
    }

    pub fn with_profile(mut self, profile_id: Uuid) -> Self {
        self.profile_id = Some(profile_id);
        self
    }

    pub fn with_progress(mut self, progress: ProgressSink) -> Self {
        self.progress = progress;
        self
    }
}

/// Collaborators shared by every orchestration.
#[derive(Clone)]
pub struct RunContext {
    pub store: Arc<ConfigStore>,
    pub notifier: Arc<dyn Notifier>,
    pub silence: Arc<SilenceRegistry>,
    pub bridges: Arc<dyn BridgeProvider>,
    pub rules: Arc<WorkerRules>,
    pub policy: PreflightPolicy,
    pub data_dir: PathBuf,
    pub timing: RunTiming,
}

impl RunContext {
    pub fn new(store: Arc<ConfigStore>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            notifier: Arc::new(TracingNotifier),
            silence: Arc::new(SilenceRegistry::new()),
            bridges: Arc::new(AdbBridgeProvider),
            rules: Arc::new(WorkerRules::builtin()),
            policy: PreflightPolicy::new(),
            data_dir: data_dir.into(),
            timing: RunTiming::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_silence(mut self, silence: Arc<SilenceRegistry>) -> Self {
        self.silence = silence;
        self
    }

    pub fn with_bridges(mut self, bridges: Arc<dyn BridgeProvider>) -> Self {
        self.bridges = bridges;
        self
    }

    pub fn with_rules(mut self, rules: WorkerRules) -> Self {
        self.rules = Arc::new(rules);
        self
    }

    pub fn with_timing(mut self, timing: RunTiming) -> Self {
        self.timing = timing;
        self
    }
}

/// Drives one orchestration from validation to finalization.
pub struct RunStateMachine {
    ctx: RunContext,
    request: RunRequest,
    interrupt: CancellationToken,
}

impl RunStateMachine {
    pub fn new(ctx: RunContext, request: RunRequest) -> Self {
        Self::with_interrupt(ctx, request, CancellationToken::new())
    }

    pub fn with_interrupt(ctx: RunContext, request: RunRequest, interrupt: CancellationToken) -> Self {
        Self {
            ctx,
            request,
            interrupt,
        }
    }

    /// Cancelling the returned token requests a cooperative interruption.
    pub fn interrupter(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Runs to completion. Only validation, lock and pre-launch I/O failures are returned as errors;
    /// everything else is reported through the [`RunReport`].
    pub async fn run(self) -> AppResult<RunReport> {
        let script_id = self.request.script_id;
        let mode = self.request.mode;
        tracing::info!(script_id = %script_id, mode = mode.as_str(), "run validating");

        let script = self.ctx.store.script(script_id).await?;
        let layout = WorkerLayout::from_settings(&script.settings, &self.ctx.data_dir, script_id)?;
        if let Err(error) = self
            .ctx
            .policy
            .validate(mode, self.request.profile_id, &script, &layout)
        {
            tracing::error!(script_id = %script_id, error = %error, "run rejected");
            self.request.progress.message("error", error.to_string());
            return Err(error);
        }

        let lease = self.ctx.store.lock(script_id).await?;
        // Profiles may have changed while waiting for the lock.
        let script = self.ctx.store.script(script_id).await?;
        let format = log_format(&script)?;
        layout.backup_live_config().await?;
        tracing::info!(script_id = %script_id, mode = mode.as_str(), "run started");

        let history = HistoryWriter::new(&self.ctx.data_dir);
        let drops = DropParser::new(&self.ctx.rules)?;
        let poll = self.ctx.timing.process_poll;
        let mut session = Session {
            script_name: script.settings.get_str("Info", "Name")?,
            settings: script.settings,
            profiles: script.profiles,
            lease: Some(lease),
            layout,
            format,
            worker: ProcessTracker::with_poll_interval("worker", poll),
            companion: ProcessTracker::with_poll_interval("companion", poll),
            relaunch_companion: true,
            silenced: BTreeSet::new(),
            reports: Vec::new(),
            current_profile: None,
            history,
            drops,
            started_at: Utc::now(),
            started_local: Local::now().naive_local(),
            ctx: self.ctx,
            request: self.request,
            interrupt: self.interrupt,
        };

        if let Err(error) = session.drive().await {
            tracing::error!(script_id = %script_id, error = %error, "run aborted");
            session.request.progress.message("error", error.to_string());
        }
        Ok(session.finalize().await)
    }
}

struct AttemptTarget<'a> {
    name: &'a str,
    profile: &'a ConfigDocument,
    baseline_owner: Option<Uuid>,
    sub_phase: SubPhase,
    post_action: PostAction,
    pending: &'a BTreeSet<String>,
    time_limit: Option<chrono::Duration>,
}

struct AttemptResult {
    outcome: RunOutcome,
    completed_tasks: BTreeSet<String>,
    drops: DropTable,
    weekly_cap: bool,
    started_at: DateTime<Utc>,
    log_path: Option<String>,
}

impl AttemptResult {
    fn failed(outcome: RunOutcome, started_at: DateTime<Utc>) -> Self {
        Self {
            outcome,
            completed_tasks: BTreeSet::new(),
            drops: DropTable::new(),
            weekly_cap: false,
            started_at,
            log_path: None,
        }
    }

    fn record(&self, attempt: u32) -> AttemptRecord {
        AttemptRecord {
            attempt,
            outcome: self.outcome.clone(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            log_path: self.log_path.clone(),
        }
    }
}

struct Observation {
    outcome: RunOutcome,
    lines: Vec<String>,
    completed_tasks: BTreeSet<String>,
}

struct Session {
    ctx: RunContext,
    request: RunRequest,
    interrupt: CancellationToken,
    lease: Option<LockLease>,
    script_name: String,
    settings: ConfigDocument,
    profiles: ProfileSet,
    layout: WorkerLayout,
    format: LogFormat,
    worker: ProcessTracker,
    companion: ProcessTracker,
    relaunch_companion: bool,
    silenced: BTreeSet<PathBuf>,
    reports: Vec<ProfileReport>,
    current_profile: Option<Uuid>,
    history: HistoryWriter,
    drops: DropParser,
    started_at: DateTime<Utc>,
    started_local: NaiveDateTime,
}

impl Session {
    async fn drive(&mut self) -> AppResult<()> {
        match self.request.mode {
            RunMode::SetupWorker => self.run_setup().await,
            mode => self.run_profiles(mode).await,
        }
    }

    async fn run_profiles(&mut self, mode: RunMode) -> AppResult<()> {
        let queue = self.select_profiles(mode)?;
        self.reports = queue
            .iter()
            .map(|(uid, _)| {
                let name = self
                    .profiles
                    .get(uid)
                    .and_then(|profile| profile.get_str("Info", "Name").ok())
                    .unwrap_or_default();
                ProfileReport {
                    profile_id: *uid,
                    name,
                    status: ProfileStatus::Waiting,
                    sub_phases: Vec::new(),
                    drops: DropTable::new(),
                }
            })
            .collect();
        self.publish_profile_list();
        tracing::info!(
            script_id = %self.request.script_id,
            profiles = queue.len(),
            "profile queue built"
        );

        let method = self.settings.get_str("Run", "TaskTransitionMethod")?;
        for index in 0..queue.len() {
            if self.interrupt.is_cancelled() {
                break;
            }
            let next_mode = queue.get(index + 1).map(|(_, mode)| *mode);
            let post_action = post_action_for(next_mode, &method);
            self.run_profile(mode, index, post_action).await?;
            self.checkpoint().await;
            if self.reports[index].status == ProfileStatus::Interrupted {
                break;
            }
        }
        Ok(())
    }

    /// Enabled profiles in persisted order; AutoProxy groups simple profiles first.
    fn select_profiles(&self, mode: RunMode) -> AppResult<Vec<(Uuid, ProfileMode)>> {
        let mut selected = Vec::new();
        for (uid, profile) in self.profiles.iter() {
            if self.request.profile_id.is_some_and(|target| target != *uid) {
                continue;
            }
            if !profile.get_bool("Info", "Status")? {
                continue;
            }
            if mode == RunMode::AutoProxy && profile.get_i64("Info", "RemainedDay")? == 0 {
                continue;
            }
            selected.push((*uid, ProfileMode::from_config(&profile.get_str("Info", "Mode")?)));
        }
        if mode == RunMode::AutoProxy {
            selected.sort_by_key(|(_, mode)| *mode);
        }
        Ok(selected)
    }

    async fn run_profile(&mut self, mode: RunMode, index: usize, post_action: PostAction) -> AppResult<()> {
        let uid = self.reports[index].profile_id;
        let name = self.reports[index].name.clone();
        let today = server_date(Local::now().naive_local());
        let mut profile = self
            .profiles
            .get(&uid)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("profile {}", uid)))?;
        let profile_mode = ProfileMode::from_config(&profile.get_str("Info", "Mode")?);

        if mode == RunMode::AutoProxy {
            refresh_proxy_times(&mut profile, today)?;
            let limit = self.settings.get_i64("Run", "ProxyTimesLimit")?;
            if limit != 0 && profile.get_i64("Data", "ProxyTimes")? >= limit {
                tracing::info!(profile = %name, limit, "daily proxy limit reached; skipping");
                self.request
                    .progress
                    .message("info", format!("{} reached today's proxy limit", name));
                self.profiles.insert(uid, profile);
                self.set_status(index, ProfileStatus::Skipped);
                return Ok(());
            }
        }

        self.set_status(index, ProfileStatus::Running);
        self.current_profile = Some(uid);
        tracing::info!(profile = %name, mode = profile_mode.as_str(), "profile started");

        let baseline_owner = match profile_mode {
            ProfileMode::Detailed => Some(uid),
            ProfileMode::Simple => None,
        };
        if profile_mode == ProfileMode::Detailed {
            self.relaunch_companion = true;
            let baseline = self.layout.baseline_path(Some(uid));
            if !baseline.is_file() {
                tracing::warn!(profile = %name, path = %baseline.display(), "detailed profile has no captured config");
                self.request.progress.message(
                    "error",
                    format!("{} has no captured worker configuration; run the worker setup for it first", name),
                );
                self.profiles.insert(uid, profile);
                self.set_status(index, ProfileStatus::Failed);
                return Ok(());
            }
        }

        let weekly_limit = self.settings.get_bool("Run", "PriorityWeeklyLimit")?;
        let run_times = u32::try_from(self.settings.get_i64("Run", "RunTimesLimit")?)
            .unwrap_or(1)
            .max(1);
        let mut profile_drops = DropTable::new();
        let mut phases = Vec::new();
        let mut interrupted = false;

        for &sub_phase in SubPhase::for_mode(mode) {
            if self.interrupt.is_cancelled() {
                interrupted = true;
                break;
            }
            let mut phase = SubPhaseReport {
                sub_phase,
                done: false,
                skipped_by_policy: false,
                attempts: Vec::new(),
            };
            if mode == RunMode::AutoProxy && done_by_policy(&profile, sub_phase, weekly_limit, today)? {
                tracing::info!(profile = %name, sub_phase = sub_phase.as_str(), "sub-phase satisfied by policy");
                phase.done = true;
                phase.skipped_by_policy = true;
                phases.push(phase);
                continue;
            }

            let mut pending = pending_tasks(&profile, sub_phase)?
                .into_iter()
                .filter(|(_, enabled)| *enabled)
                .map(|(task, _)| task)
                .collect::<BTreeSet<_>>();
            let time_limit = self.time_limit(sub_phase)?;

            for attempt in 1..=run_times {
                if self.interrupt.is_cancelled() {
                    interrupted = true;
                    break;
                }
                tracing::info!(
                    profile = %name,
                    sub_phase = sub_phase.as_str(),
                    attempt,
                    limit = run_times,
                    "attempt starting"
                );
                let started_at = Utc::now();
                let target = AttemptTarget {
                    name: &name,
                    profile: &profile,
                    baseline_owner,
                    sub_phase,
                    post_action,
                    pending: &pending,
                    time_limit,
                };
                let (result, retryable) = match self.attempt(mode, &target).await {
                    Ok(result) => (result, true),
                    Err(error) => {
                        tracing::warn!(profile = %name, attempt, error = %error, "attempt failed before classification");
                        self.abort_attempt().await;
                        let retryable = error.is_attempt_fatal();
                        (
                            AttemptResult::failed(RunOutcome::PartialFailure(error.to_string()), started_at),
                            retryable,
                        )
                    }
                };

                for task in &result.completed_tasks {
                    pending.remove(task);
                }
                if sub_phase == SubPhase::Priority && result.weekly_cap {
                    profile.set("Data", "LastPriorityDate", json!(today.to_string()))?;
                }
                merge_drops(&mut profile_drops, &result.drops);
                phase.attempts.push(result.record(attempt));

                match &result.outcome {
                    RunOutcome::Success => {
                        tracing::info!(profile = %name, sub_phase = sub_phase.as_str(), attempt, "sub-phase succeeded");
                        phase.done = true;
                        break;
                    }
                    RunOutcome::ManuallyInterrupted => {
                        tracing::info!(profile = %name, sub_phase = sub_phase.as_str(), "attempt interrupted");
                        interrupted = true;
                        break;
                    }
                    outcome => {
                        let reason = outcome.describe();
                        self.request.progress.message(
                            "warning",
                            format!(
                                "{} {} attempt {}/{} failed: {}",
                                name,
                                sub_phase.as_str(),
                                attempt,
                                run_times,
                                reason
                            ),
                        );
                        if attempt == run_times || !retryable {
                            self.ctx.notifier.push(
                                NotificationKind::AttemptsExhausted,
                                &format!("{} {} failed", name, sub_phase.as_str()),
                                &json!({
                                    "profile": name,
                                    "subPhase": sub_phase.as_str(),
                                    "attempts": attempt,
                                    "outcome": outcome,
                                    "reason": reason,
                                }),
                            );
                        }
                        if !retryable {
                            break;
                        }
                    }
                }
            }

            phases.push(phase);
            if interrupted {
                break;
            }
        }

        let all_done = phases.len() == SubPhase::for_mode(mode).len() && phases.iter().all(|phase| phase.done);
        let status = if interrupted {
            ProfileStatus::Interrupted
        } else if all_done {
            ProfileStatus::Completed
        } else {
            ProfileStatus::Failed
        };

        match mode {
            RunMode::AutoProxy if status == ProfileStatus::Completed => record_success(&mut profile, today)?,
            RunMode::ManualCheck if !interrupted => {
                profile.set("Data", "IfPassCheck", json!(status == ProfileStatus::Completed))?
            }
            _ => {}
        }

        if mode == RunMode::AutoProxy
            && self.settings.get_bool("Notify", "IfSendStatistic")?
            && phases.iter().any(|phase| !phase.attempts.is_empty())
        {
            self.ctx.notifier.push(
                NotificationKind::ProfileStatistics,
                &format!("{} statistics", name),
                &json!({ "profile": name, "status": status.as_str(), "drops": profile_drops }),
            );
        }

        self.profiles.insert(uid, profile);
        let report = &mut self.reports[index];
        report.sub_phases = phases;
        report.drops = profile_drops;
        self.set_status(index, status);
        tracing::info!(profile = %name, status = status.as_str(), "profile finished");
        Ok(())
    }

    async fn attempt(&mut self, mode: RunMode, target: &AttemptTarget<'_>) -> AppResult<AttemptResult> {
        let started_at = Utc::now();
        kill_by_executable(&self.layout.executable).await;

        self.layout.import_baseline(target.baseline_owner).await?;
        let mut config = WorkerConfig::load(&self.layout.config_file).await?;
        let tasks = TASKS
            .iter()
            .map(|task| (task.to_string(), target.pending.contains(*task)))
            .collect::<BTreeMap<_, _>>();
        let plan = PatchPlan::for_profile(
            mode,
            target.sub_phase,
            target.profile,
            target.post_action,
            self.relaunch_companion,
            tasks,
        )?;
        apply_patch(&mut config, &plan);
        config.save().await?;
        self.relaunch_companion = false;

        let companion = CompanionSettings::from_config(&config);
        let bridge = self.bridge_for(&companion);
        if let Some(bridge) = &bridge {
            bridge.disconnect(&companion.address).await;
        }
        let launched = self.launch_companion(&companion, plan.open_companion).await?;
        if let Some(bridge) = &bridge {
            self.rediscover(bridge.as_ref(), &companion, launched, &mut config)
                .await?;
        }
        if self.interrupt.is_cancelled() {
            tracing::info!(profile = %target.name, "interrupted before the worker launched");
            self.abort_attempt().await;
            return Ok(AttemptResult::failed(RunOutcome::ManuallyInterrupted, started_at));
        }

        let attempt_start = local_now_seconds();
        let observation = self
            .observe_worker(mode, attempt_start, target.time_limit, target.pending)
            .await?;
        self.teardown(&observation.outcome, target.post_action, bridge.as_deref(), &companion)
            .await;

        let drops = self.drops.parse(&observation.lines);
        let log_path = self
            .save_attempt_log(target.name, attempt_start, &observation.lines, &drops)
            .await;
        if self.settings.get_bool("Notify", "IfSendJackpot")? && self.ctx.rules.hits_jackpot(&observation.lines) {
            self.ctx.notifier.push(
                NotificationKind::Jackpot,
                &format!("{} hit a rare result", target.name),
                &json!({ "profile": target.name, "log": log_path }),
            );
        }

        Ok(AttemptResult {
            outcome: observation.outcome,
            completed_tasks: observation.completed_tasks,
            drops,
            weekly_cap: self.ctx.rules.hits_weekly_cap(&observation.lines),
            started_at,
            log_path,
        })
    }

    /// Launches the worker and waits for a terminal classification.
    async fn observe_worker(
        &mut self,
        mode: RunMode,
        attempt_start: NaiveDateTime,
        time_limit: Option<chrono::Duration>,
        pending: &BTreeSet<String>,
    ) -> AppResult<Observation> {
        let window = self.discovery_window()?;
        let window = if mode == RunMode::SetupWorker { Duration::ZERO } else { window };
        if self.interrupt.is_cancelled() {
            return Ok(Observation {
                outcome: RunOutcome::ManuallyInterrupted,
                lines: Vec::new(),
                completed_tasks: BTreeSet::new(),
            });
        }
        self.worker.start(&self.layout.executable, &[], window).await?;

        let monitor = LogTailMonitor::new(self.format.clone(), self.ctx.timing.monitor);
        let (sender, mut snapshots) = mpsc::channel::<LogSnapshot>(SNAPSHOT_CHANNEL_CAPACITY);
        if let Err(error) = monitor.start(&self.layout.log_file, attempt_start, sender) {
            self.worker.kill(true).await;
            return Err(error);
        }

        let rules = self.ctx.rules.for_mode(mode);
        let heartbeat = &self.ctx.rules.heartbeat_markers;
        let mut closed = self.worker.subscribe_closed();
        let mut worker_running = true;
        let mut monitor_open = true;
        let mut lines: Vec<String> = Vec::new();

        let observation = loop {
            tokio::select! {
                _ = self.interrupt.cancelled() => {}
                snapshot = snapshots.recv(), if monitor_open => match snapshot {
                    Some(snapshot) => {
                        if !snapshot.watchdog {
                            self.request.progress.send(ProgressEvent::LogBatch {
                                profile_id: self.current_profile,
                                lines: snapshot.lines.clone(),
                            });
                        }
                        tracing::debug!(lines = snapshot.lines.len(), watchdog = snapshot.watchdog, "log snapshot");
                        lines = snapshot.lines;
                    }
                    None => {
                        monitor_open = false;
                        continue;
                    }
                },
                _ = wait_closed(&mut closed), if worker_running => {
                    worker_running = false;
                    tracing::info!("worker exited");
                    match read_new_content(&self.layout.log_file, attempt_start, &self.format).await {
                        Ok(fresh) => lines = fresh,
                        Err(error) => tracing::debug!(error = %error, "final log read failed"),
                    }
                }
            }

            let input = ClassifyInput {
                lines: &lines,
                format: &self.format,
                attempt_start,
                now: Local::now().naive_local(),
                time_limit,
                worker_running,
                interrupted: self.interrupt.is_cancelled(),
                pending_tasks: pending,
            };
            let classification = classify(rules, heartbeat, &input);
            if let Verdict::Terminal(outcome) = classification.verdict {
                break Observation {
                    outcome,
                    completed_tasks: classification.completed_tasks,
                    lines,
                };
            }
        };

        monitor.stop();
        tracing::info!(outcome = %observation.outcome.describe(), "attempt classified");
        Ok(observation)
    }

    async fn teardown(
        &mut self,
        outcome: &RunOutcome,
        post_action: PostAction,
        bridge: Option<&dyn DeviceBridge>,
        companion: &CompanionSettings,
    ) {
        let success = outcome.is_success();
        if !success {
            self.worker.kill(true).await;
            kill_by_executable(&self.layout.executable).await;
            self.companion.kill(true).await;
            self.relaunch_companion = true;
        }

        let settle = self.ctx.timing.settle_delay;
        self.request.progress.message(
            "info",
            format!("waiting {}s for the worker to settle", settle.as_secs()),
        );
        tokio::time::sleep(settle).await;

        if let Some(bridge) = bridge {
            bridge.disconnect(&companion.address).await;
        }
        if self.worker.is_running().await {
            self.worker.kill(false).await;
        }
        if success && post_action.exits_companion() {
            self.companion.kill(true).await;
            self.relaunch_companion = true;
        }
    }

    /// Kills whatever an attempt left behind after it failed early.
    async fn abort_attempt(&mut self) {
        self.worker.kill(true).await;
        self.companion.kill(true).await;
        self.relaunch_companion = true;
    }

    fn bridge_for(&self, companion: &CompanionSettings) -> Option<Arc<dyn DeviceBridge>> {
        let path = companion.bridge_path.as_ref()?;
        if companion.address.is_empty() {
            return None;
        }
        Some(self.ctx.bridges.bridge(&self.resolve(path)))
    }

    async fn launch_companion(&mut self, companion: &CompanionSettings, open: bool) -> AppResult<bool> {
        if !open {
            return Ok(false);
        }
        let Some(executable) = &companion.executable else {
            return Ok(false);
        };
        let path = self.resolve(executable);
        let window = self.discovery_window()?;
        self.companion.start(&path, &companion.args, window).await?;

        let until = Instant::now() + self.companion_wait(companion) + self.ctx.timing.silence_grace;
        self.ctx.silence.silence(&path, until);
        self.silenced.insert(path.clone());
        tracing::info!(path = %path.display(), "companion launched");
        Ok(true)
    }

    async fn rediscover(
        &mut self,
        bridge: &dyn DeviceBridge,
        companion: &CompanionSettings,
        launched: bool,
        config: &mut WorkerConfig,
    ) -> AppResult<()> {
        if launched {
            let wait = self.companion_wait(companion);
            self.request.progress.message(
                "info",
                format!("waiting {}s for the companion to boot", wait.as_secs()),
            );
            tokio::select! {
                _ = self.interrupt.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let range = u16::try_from(self.settings.get_i64("Run", "ADBSearchRange")?).unwrap_or(0);
        if let Some(address) = rediscover_address(bridge, &companion.address, range).await {
            config.set(Scope::Profile, "Connect.Address", address);
            config.set(Scope::Profile, "Start.EmulatorWaitSeconds", "0");
            config.save().await?;
        }
        Ok(())
    }

    async fn run_setup(&mut self) -> AppResult<()> {
        let profile_id = self.request.profile_id;
        let name = match profile_id {
            Some(uid) => self
                .profiles
                .get(&uid)
                .map(|profile| profile.get_str("Info", "Name"))
                .transpose()?
                .unwrap_or_default(),
            None => "Default".to_string(),
        };
        self.reports = vec![ProfileReport {
            profile_id: profile_id.unwrap_or_else(Uuid::nil),
            name: name.clone(),
            status: ProfileStatus::Waiting,
            sub_phases: Vec::new(),
            drops: DropTable::new(),
        }];
        self.publish_profile_list();
        self.set_status(0, ProfileStatus::Running);
        self.current_profile = profile_id;

        let started_at = Utc::now();
        let result = self.setup_attempt(profile_id).await;
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(profile = %name, error = %error, "worker setup failed");
                self.abort_attempt().await;
                RunOutcome::PartialFailure(error.to_string())
            }
        };

        let status = match &outcome {
            RunOutcome::Success => ProfileStatus::Completed,
            RunOutcome::ManuallyInterrupted => ProfileStatus::Interrupted,
            _ => ProfileStatus::Failed,
        };
        let attempt = AttemptResult::failed(outcome, started_at).record(1);
        self.reports[0].sub_phases = vec![SubPhaseReport {
            sub_phase: SubPhase::Setup,
            done: status == ProfileStatus::Completed,
            skipped_by_policy: false,
            attempts: vec![attempt],
        }];
        self.set_status(0, status);
        Ok(())
    }

    async fn setup_attempt(&mut self, profile_id: Option<Uuid>) -> AppResult<RunOutcome> {
        kill_by_executable(&self.layout.executable).await;
        if let Some(uid) = profile_id {
            let owner = self.layout.baseline_path(Some(uid)).is_file().then_some(uid);
            self.layout.import_baseline(owner).await?;
        }
        let mut config = WorkerConfig::load(&self.layout.config_file).await?;
        apply_patch(&mut config, &PatchPlan::for_setup());
        config.save().await?;

        let attempt_start = local_now_seconds();
        let observation = self
            .observe_worker(RunMode::SetupWorker, attempt_start, None, &BTreeSet::new())
            .await?;
        if observation.outcome.is_success() {
            let captured = self.layout.capture_baseline(profile_id).await?;
            tracing::info!(path = %captured.display(), "worker configuration captured");
        } else {
            self.worker.kill(true).await;
        }
        Ok(observation.outcome)
    }

    async fn finalize(mut self) -> RunReport {
        tracing::info!(script_id = %self.request.script_id, "run finalizing");
        self.worker.kill(true).await;
        self.companion.kill(true).await;
        kill_by_executable(&self.layout.executable).await;
        for path in std::mem::take(&mut self.silenced) {
            self.ctx.silence.remove(&path);
        }

        for index in 0..self.reports.len() {
            if self.reports[index].status == ProfileStatus::Running {
                self.set_status(index, ProfileStatus::Failed);
            }
        }
        self.checkpoint().await;
        if let Err(error) = self.layout.restore_live_config().await {
            tracing::error!(error = %error, "failed to restore worker configuration");
        }

        let statistics = self.statistics();
        if let Err(error) = self
            .history
            .save_statistics(&statistics, self.started_local)
            .await
        {
            tracing::warn!(error = %error, "failed to write run statistics");
        }
        self.notify_result(&statistics);

        if let Some(lease) = self.lease.take() {
            if let Err(error) = lease.release() {
                tracing::warn!(error = %error, "script lock release failed");
            }
        }
        let interrupted = self.interrupt.is_cancelled();
        tracing::info!(
            script_id = %self.request.script_id,
            completed = statistics.completed_count,
            uncompleted = statistics.uncompleted_count,
            interrupted,
            "run finished"
        );

        RunReport {
            script_id: self.request.script_id,
            mode: self.request.mode,
            interrupted,
            profiles: self.reports,
            statistics,
        }
    }

    fn statistics(&self) -> RunStatistics {
        let mut statistics = RunStatistics {
            title: format!("{} {}", self.script_name, self.request.mode.as_str()),
            script_name: self.script_name.clone(),
            mode: self.request.mode,
            start_time: self.started_at,
            end_time: Utc::now(),
            completed_count: 0,
            uncompleted_count: 0,
            completed_profiles: Vec::new(),
            failed_profiles: Vec::new(),
            interrupted_profiles: Vec::new(),
            waiting_profiles: Vec::new(),
            skipped_profiles: Vec::new(),
        };
        for report in &self.reports {
            let bucket = match report.status {
                ProfileStatus::Completed => &mut statistics.completed_profiles,
                ProfileStatus::Failed => &mut statistics.failed_profiles,
                ProfileStatus::Interrupted => &mut statistics.interrupted_profiles,
                ProfileStatus::Skipped => &mut statistics.skipped_profiles,
                ProfileStatus::Waiting | ProfileStatus::Running => &mut statistics.waiting_profiles,
            };
            bucket.push(report.name.clone());
        }
        statistics.completed_count = statistics.completed_profiles.len();
        statistics.uncompleted_count = statistics.failed_profiles.len()
            + statistics.interrupted_profiles.len()
            + statistics.waiting_profiles.len();
        statistics
    }

    fn notify_result(&self, statistics: &RunStatistics) {
        if self.request.mode == RunMode::SetupWorker {
            return;
        }
        let policy = self
            .settings
            .get_str("Notify", "SendTaskResultTime")
            .unwrap_or_else(|_| "Always".to_string());
        let send = match policy.as_str() {
            "Never" => false,
            "FailureOnly" => statistics.has_problems(),
            _ => true,
        };
        if !send {
            return;
        }
        match serde_json::to_value(statistics) {
            Ok(payload) => self
                .ctx
                .notifier
                .push(NotificationKind::RunResult, &statistics.title, &payload),
            Err(error) => tracing::warn!(error = %error, "failed to encode run statistics"),
        }
    }

    async fn checkpoint(&self) {
        let Some(lease) = &self.lease else {
            return;
        };
        if let Err(error) = self
            .ctx
            .store
            .commit_profiles(lease, self.profiles.clone())
            .await
        {
            tracing::warn!(script_id = %self.request.script_id, error = %error, "failed to persist profiles");
        }
    }

    async fn save_attempt_log(
        &self,
        name: &str,
        attempt_start: NaiveDateTime,
        lines: &[String],
        drops: &DropTable,
    ) -> Option<String> {
        if lines.is_empty() {
            return None;
        }
        match self.history.save_attempt(name, attempt_start, lines, drops).await {
            Ok(path) => Some(path.display().to_string()),
            Err(error) => {
                tracing::warn!(profile = %name, error = %error, "failed to save attempt log");
                None
            }
        }
    }

    fn set_status(&mut self, index: usize, status: ProfileStatus) {
        let report = &mut self.reports[index];
        report.status = status;
        self.request.progress.send(ProgressEvent::ProfileStatus {
            profile_id: report.profile_id,
            name: report.name.clone(),
            status,
        });
    }

    fn publish_profile_list(&self) {
        self.request.progress.send(ProgressEvent::ProfileList {
            profiles: self
                .reports
                .iter()
                .map(|report| ProfileSnapshot {
                    profile_id: report.profile_id,
                    name: report.name.clone(),
                    status: report.status,
                })
                .collect(),
        });
    }

    fn time_limit(&self, sub_phase: SubPhase) -> AppResult<Option<chrono::Duration>> {
        let key = match sub_phase {
            SubPhase::Priority => "PriorityTimeLimit",
            SubPhase::Routine | SubPhase::Check => "RoutineTimeLimit",
            SubPhase::Setup => return Ok(None),
        };
        let units = u32::try_from(self.settings.get_i64("Run", key)?).unwrap_or(u32::MAX);
        let span = self.ctx.timing.time_limit_unit.saturating_mul(units);
        Ok(chrono::Duration::from_std(span).ok())
    }

    fn discovery_window(&self) -> AppResult<Duration> {
        let seconds = u64::try_from(self.settings.get_i64("Run", "DiscoveryWindow")?).unwrap_or(0);
        Ok(Duration::from_secs(seconds))
    }

    fn companion_wait(&self, companion: &CompanionSettings) -> Duration {
        self.ctx
            .timing
            .companion_wait
            .unwrap_or_else(|| Duration::from_secs(companion.wait_seconds))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.layout.root.join(path)
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    if closed.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn read_new_content(path: &Path, run_start: NaiveDateTime, format: &LogFormat) -> AppResult<Vec<String>> {
    let bytes = tokio::fs::read(path).await?;
    Ok(new_content(&String::from_utf8_lossy(&bytes), run_start, format))
}

fn local_now_seconds() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Calendar date on the game server, which rolls over at [`SERVER_DAY_ROLLOVER_HOUR`].
pub fn server_date(now: NaiveDateTime) -> NaiveDate {
    (now - chrono::Duration::hours(SERVER_DAY_ROLLOVER_HOUR)).date()
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

/// Resets the daily proxy counter when the last proxy happened on an earlier server day.
pub fn refresh_proxy_times(profile: &mut ConfigDocument, today: NaiveDate) -> AppResult<()> {
    let last = profile.get_str("Data", "LastProxyDate")?;
    if parse_date(&last) != Some(today) {
        profile.set("Data", "ProxyTimes", json!(0))?;
    }
    Ok(())
}

pub fn record_success(profile: &mut ConfigDocument, today: NaiveDate) -> AppResult<()> {
    let proxy_times = profile.get_i64("Data", "ProxyTimes")?;
    let remained = profile.get_i64("Info", "RemainedDay")?;
    if proxy_times == 0 && remained != -1 {
        profile.set("Info", "RemainedDay", json!(remained - 1))?;
    }
    profile.set("Data", "ProxyTimes", json!(proxy_times + 1))?;
    profile.set("Data", "LastProxyDate", json!(today.to_string()))?;
    Ok(())
}

pub fn done_by_policy(
    profile: &ConfigDocument,
    sub_phase: SubPhase,
    weekly_limit: bool,
    today: NaiveDate,
) -> AppResult<bool> {
    Ok(match sub_phase {
        SubPhase::Priority => {
            if profile.get_str("Info", "Priority")? == "Close" {
                return Ok(true);
            }
            weekly_limit
                && parse_date(&profile.get_str("Data", "LastPriorityDate")?)
                    .is_some_and(|last| last.iso_week() == today.iso_week())
        }
        SubPhase::Routine => !profile.get_bool("Info", "Routine")?,
        SubPhase::Check | SubPhase::Setup => false,
    })
}

/// The last profile, or one followed by a detailed profile, closes the companion too.
pub fn post_action_for(next: Option<ProfileMode>, method: &str) -> PostAction {
    match next {
        None | Some(ProfileMode::Detailed) => PostAction::ExitAll,
        Some(ProfileMode::Simple) => PostAction::from_transition_method(method),
    }
}
