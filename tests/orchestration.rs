#![cfg(unix)]

use async_trait::async_trait;
use chrono::Local;
use profile_runner_lib::companion::{BridgeProvider, DeviceBridge};
use profile_runner_lib::config_store::{ConfigDocument, ConfigStore, SchemaKind, ScriptConfig};
use profile_runner_lib::log_monitor::MonitorTiming;
use profile_runner_lib::models::{
    ProfileStatus, ProgressEvent, RunMode, RunOutcome, SubPhase,
};
use profile_runner_lib::notify::{ChannelNotifier, Notification, NotificationKind, ProgressSink};
use profile_runner_lib::runner::{server_date, RunContext, RunRequest, RunStateMachine, RunTiming};
use profile_runner_lib::silence::SilenceRegistry;
use profile_runner_lib::worker_config::WorkerLayout;
use profile_runner_lib::WorkerRules;
use serde_json::{json, Value};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use uuid::Uuid;

const RULES: &str = r#"
autoProxy:
  rules:
    - pattern: "ALL DONE"
      outcome: { kind: success }
  onExit: { kind: failure, reason: "worker exited early" }
manualCheck:
  rules:
    - pattern: "ALL DONE"
      outcome: { kind: success }
  onExit: { kind: failure, reason: "worker exited early" }
setupWorker:
  rules: []
  onExit: { kind: success }
  enforceTimeLimit: false
"#;

const RUN_DEADLINE: Duration = Duration::from_secs(90);

struct Rig {
    _temp: TempDir,
    root: PathBuf,
    data: PathBuf,
    store: Arc<ConfigStore>,
    script_id: Uuid,
    layout: WorkerLayout,
}

fn install(fixture: &str, target: &Path) {
    let source = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(fixture);
    std::fs::copy(&source, target).expect("copy fixture");
    std::fs::set_permissions(target, std::fs::Permissions::from_mode(0o755)).expect("chmod fixture");
}

fn write_json(path: &Path, value: &Value) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("parent dir");
    }
    std::fs::write(path, serde_json::to_vec_pretty(value).expect("encode")).expect("write json");
}

fn read_json(path: &Path) -> Value {
    serde_json::from_slice(&std::fs::read(path).expect("read json")).expect("decode json")
}

async fn rig(worker_fixture: &str, with_baseline: bool, tune: impl FnOnce(&mut ConfigDocument)) -> Rig {
    let temp = tempfile::tempdir().expect("tempdir");
    let root = temp.path().join("worker");
    let data = temp.path().join("data");
    std::fs::create_dir_all(root.join("debug")).expect("debug dir");
    install(worker_fixture, &root.join("worker.sh"));
    write_json(
        &root.join("config/gui.json"),
        &json!({ "Global": { "Live": "original" }, "Configurations": { "Default": {} } }),
    );

    let mut script = ScriptConfig::default();
    let settings = &mut script.settings;
    settings.set("Info", "Name", json!("daily")).expect("name");
    settings
        .set("Info", "Path", json!(root.to_string_lossy()))
        .expect("path");
    settings.set("Worker", "Executable", json!("worker.sh")).expect("executable");
    settings.set("Run", "RunTimesLimit", json!(2)).expect("run times");
    settings.set("Run", "RoutineTimeLimit", json!(1)).expect("routine limit");
    settings.set("Run", "PriorityTimeLimit", json!(1)).expect("priority limit");
    settings
        .set("Run", "TaskTransitionMethod", json!("NoAction"))
        .expect("transition");
    settings.set("Run", "ADBSearchRange", json!(1)).expect("search range");
    tune(settings);

    let store = Arc::new(ConfigStore::in_memory());
    let script_id = store.add_script(script.clone()).await.expect("add script");
    let layout = WorkerLayout::from_settings(&script.settings, &data, script_id).expect("layout");
    if with_baseline {
        write_json(
            &layout.baseline_path(None),
            &json!({ "Global": {}, "Configurations": { "Default": {} } }),
        );
    }

    Rig {
        _temp: temp,
        root,
        data,
        store,
        script_id,
        layout,
    }
}

fn profile(name: &str, account: &str) -> ConfigDocument {
    let mut profile = ConfigDocument::new(SchemaKind::Profile);
    profile.set("Info", "Name", json!(name)).expect("name");
    profile.set("Info", "Id", json!(account)).expect("id");
    profile
}

fn fast_timing() -> RunTiming {
    RunTiming {
        settle_delay: Duration::from_millis(200),
        process_poll: Duration::from_millis(50),
        monitor: MonitorTiming {
            poll_interval: Duration::from_millis(50),
            watchdog_interval: Duration::from_millis(300),
            backoff_initial: Duration::from_millis(50),
            backoff_ceiling: Duration::from_millis(200),
        },
        time_limit_unit: Duration::from_secs(3),
        silence_grace: Duration::from_millis(100),
        companion_wait: Some(Duration::ZERO),
    }
}

fn context(rig: &Rig) -> (RunContext, mpsc::Receiver<Notification>) {
    let (notifier, notifications) = ChannelNotifier::new(64);
    let ctx = RunContext::new(rig.store.clone(), rig.data.clone())
        .with_rules(WorkerRules::from_yaml_str(RULES).expect("rules"))
        .with_timing(fast_timing())
        .with_notifier(Arc::new(notifier));
    (ctx, notifications)
}

fn drain(notifications: &mut mpsc::Receiver<Notification>) -> Vec<Notification> {
    let mut seen = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        seen.push(notification);
    }
    seen
}

#[tokio::test]
async fn auto_proxy_retries_a_stalled_profile_and_keeps_going() {
    let rig = rig("worker.sh", true, |_| {}).await;
    let alice = rig.store.add_profile(rig.script_id, profile("alice", "good")).await.expect("alice");
    let bob = rig.store.add_profile(rig.script_id, profile("bob", "bad")).await.expect("bob");
    let (ctx, mut notifications) = context(&rig);

    let report = timeout(
        RUN_DEADLINE,
        RunStateMachine::new(ctx, RunRequest::new(RunMode::AutoProxy, rig.script_id)).run(),
    )
    .await
    .expect("run finished in time")
    .expect("run report");

    assert!(!report.interrupted);
    assert_eq!(report.profiles.len(), 2);
    let first = &report.profiles[0];
    assert_eq!(first.profile_id, alice);
    assert_eq!(first.status, ProfileStatus::Completed);
    let priority = &first.sub_phases[0];
    assert_eq!(priority.sub_phase, SubPhase::Priority);
    assert!(priority.skipped_by_policy);
    let routine = &first.sub_phases[1];
    assert_eq!(routine.attempts.len(), 1);
    assert_eq!(routine.attempts[0].outcome, RunOutcome::Success);
    assert!(routine.attempts[0].log_path.is_some());

    let second = &report.profiles[1];
    assert_eq!(second.profile_id, bob);
    assert_eq!(second.status, ProfileStatus::Failed);
    let attempts = &second.sub_phases[1].attempts;
    assert_eq!(attempts.len(), 2);
    assert!(attempts
        .iter()
        .all(|attempt| matches!(attempt.outcome, RunOutcome::Timeout(_))));

    assert_eq!(report.statistics.completed_count, 1);
    assert_eq!(report.statistics.uncompleted_count, 1);
    assert_eq!(report.statistics.failed_profiles, vec!["bob".to_string()]);

    let today = server_date(Local::now().naive_local()).to_string();
    let proxy_times = rig
        .store
        .get_profile_value(rig.script_id, alice, "Data", "ProxyTimes")
        .await
        .expect("proxy times");
    assert_eq!(proxy_times, json!(1));
    let last = rig
        .store
        .get_profile_value(rig.script_id, alice, "Data", "LastProxyDate")
        .await
        .expect("last proxy date");
    assert_eq!(last, json!(today));
    let untouched = rig
        .store
        .get_profile_value(rig.script_id, bob, "Data", "ProxyTimes")
        .await
        .expect("bob proxy times");
    assert_eq!(untouched, json!(0));

    assert!(!rig.store.is_locked(rig.script_id));
    let live = read_json(&rig.layout.config_file);
    assert_eq!(live["Global"]["Live"], json!("original"));
    assert!(!rig.layout.backup_dir().exists());

    let kinds = drain(&mut notifications)
        .into_iter()
        .map(|notification| notification.kind)
        .collect::<Vec<_>>();
    assert!(kinds.contains(&NotificationKind::AttemptsExhausted));
    assert_eq!(kinds.last(), Some(&NotificationKind::RunResult));
}

#[tokio::test]
async fn interruption_stops_the_queue_and_releases_the_lock() {
    let rig = rig("worker.sh", true, |_| {}).await;
    for name in ["one", "two", "three"] {
        rig.store.add_profile(rig.script_id, profile(name, "bad")).await.expect("profile");
    }
    let (ctx, _notifications) = context(&rig);
    let (sink, mut events) = ProgressSink::channel();
    let machine = RunStateMachine::new(
        ctx,
        RunRequest::new(RunMode::AutoProxy, rig.script_id).with_progress(sink),
    );
    let interrupt = machine.interrupter();
    let run = tokio::spawn(machine.run());

    let saw_log = timeout(Duration::from_secs(20), async {
        while let Some(event) = events.recv().await {
            if matches!(event, ProgressEvent::LogBatch { .. }) {
                return true;
            }
        }
        false
    })
    .await
    .expect("log output in time");
    assert!(saw_log);
    assert!(rig.store.is_locked(rig.script_id));

    let cancelled_at = Instant::now();
    interrupt.cancel();
    let report = timeout(RUN_DEADLINE, run)
        .await
        .expect("run finished in time")
        .expect("join")
        .expect("run report");
    assert!(cancelled_at.elapsed() < Duration::from_secs(10));

    assert!(report.interrupted);
    let statuses = report
        .profiles
        .iter()
        .map(|profile| profile.status)
        .collect::<Vec<_>>();
    assert_eq!(
        statuses,
        vec![ProfileStatus::Interrupted, ProfileStatus::Waiting, ProfileStatus::Waiting]
    );
    assert_eq!(report.statistics.interrupted_profiles, vec!["one".to_string()]);
    assert_eq!(report.statistics.waiting_profiles.len(), 2);
    assert_eq!(report.statistics.uncompleted_count, 3);

    assert!(!rig.store.is_locked(rig.script_id));
    let lease = rig.store.try_lock(rig.script_id).expect("lock is free");
    rig.store.unlock(lease).expect("unlock");
}

#[derive(Default)]
struct ScriptedBridge {
    reachable: Vec<String>,
    listed: Vec<String>,
    probes: Mutex<Vec<String>>,
    disconnects: Mutex<Vec<String>>,
}

#[async_trait]
impl DeviceBridge for ScriptedBridge {
    async fn connect(&self, address: &str) -> bool {
        self.probes.lock().expect("probes").push(address.to_string());
        self.reachable.iter().any(|known| known == address)
    }

    async fn disconnect(&self, address: &str) {
        self.disconnects.lock().expect("disconnects").push(address.to_string());
    }

    async fn devices(&self) -> Vec<String> {
        self.listed.clone()
    }
}

struct ScriptedProvider(Arc<ScriptedBridge>);

impl BridgeProvider for ScriptedProvider {
    fn bridge(&self, _bridge_path: &Path) -> Arc<dyn DeviceBridge> {
        self.0.clone()
    }
}

#[tokio::test]
async fn companion_address_is_rediscovered_before_the_worker_starts() {
    let rig = rig("worker.sh", true, |_| {}).await;
    let companion = rig.root.join("companion.sh");
    install("companion.sh", &companion);
    write_json(
        &rig.layout.baseline_path(None),
        &json!({
            "Global": {},
            "Configurations": { "Default": {
                "Start.EmulatorPath": companion.to_string_lossy(),
                "Start.EmulatorWaitSeconds": "0",
                "Connect.AdbPath": "adb",
                "Connect.Address": "127.0.0.1:5555",
            }}
        }),
    );
    rig.store.add_profile(rig.script_id, profile("alice", "good")).await.expect("alice");

    let bridge = Arc::new(ScriptedBridge {
        reachable: vec!["127.0.0.1:5556".to_string(), "127.0.0.1:5554".to_string()],
        listed: vec!["127.0.0.1:5554".to_string()],
        ..Default::default()
    });
    let silence = Arc::new(SilenceRegistry::new());
    let (ctx, _notifications) = context(&rig);
    let ctx = ctx
        .with_bridges(Arc::new(ScriptedProvider(bridge.clone())))
        .with_silence(silence.clone());

    let report = timeout(
        RUN_DEADLINE,
        RunStateMachine::new(ctx, RunRequest::new(RunMode::AutoProxy, rig.script_id)).run(),
    )
    .await
    .expect("run finished in time")
    .expect("run report");
    assert_eq!(report.profiles[0].status, ProfileStatus::Completed);

    assert_eq!(
        *bridge.probes.lock().expect("probes"),
        vec!["127.0.0.1:5555", "127.0.0.1:5556", "127.0.0.1:5554"]
    );
    assert!(bridge
        .disconnects
        .lock()
        .expect("disconnects")
        .contains(&"127.0.0.1:5555".to_string()));

    let seen = read_json(&rig.root.join("seen.json"));
    let patched = &seen["Configurations"]["Default"];
    assert_eq!(patched["Connect.Address"], json!("127.0.0.1:5554"));
    assert_eq!(patched["Start.EmulatorWaitSeconds"], json!("0"));
    assert_eq!(patched["Start.OpenEmulatorAfterLaunch"], json!("True"));
    assert_eq!(patched["MainFunction.PostActions"], json!("12"));

    assert!(silence.silenced_paths().is_empty());
}

#[tokio::test]
async fn interruption_during_companion_boot_never_launches_the_worker() {
    let rig = rig("worker.sh", true, |_| {}).await;
    let companion = rig.root.join("companion.sh");
    install("companion.sh", &companion);
    write_json(
        &rig.layout.baseline_path(None),
        &json!({
            "Global": {},
            "Configurations": { "Default": {
                "Start.EmulatorPath": companion.to_string_lossy(),
                "Connect.AdbPath": "adb",
                "Connect.Address": "127.0.0.1:5555",
            }}
        }),
    );
    rig.store.add_profile(rig.script_id, profile("alice", "good")).await.expect("alice");

    let bridge = Arc::new(ScriptedBridge {
        reachable: vec!["127.0.0.1:5555".to_string()],
        ..Default::default()
    });
    let silence = Arc::new(SilenceRegistry::new());
    let (ctx, _notifications) = context(&rig);
    let ctx = ctx
        .with_bridges(Arc::new(ScriptedProvider(bridge.clone())))
        .with_silence(silence.clone())
        .with_timing(RunTiming {
            companion_wait: Some(Duration::from_secs(30)),
            ..fast_timing()
        });
    let (sink, mut events) = ProgressSink::channel();
    let machine = RunStateMachine::new(
        ctx,
        RunRequest::new(RunMode::AutoProxy, rig.script_id).with_progress(sink),
    );
    let interrupt = machine.interrupter();
    let run = tokio::spawn(machine.run());

    let booting = timeout(Duration::from_secs(20), async {
        while let Some(event) = events.recv().await {
            if let ProgressEvent::Message { text, .. } = event {
                if text.contains("for the companion to boot") {
                    return true;
                }
            }
        }
        false
    })
    .await
    .expect("companion boot wait in time");
    assert!(booting);
    interrupt.cancel();

    let report = timeout(RUN_DEADLINE, run)
        .await
        .expect("run finished in time")
        .expect("join")
        .expect("run report");
    assert!(report.interrupted);
    let alice = &report.profiles[0];
    assert_eq!(alice.status, ProfileStatus::Interrupted);
    let attempts = alice
        .sub_phases
        .iter()
        .flat_map(|phase| phase.attempts.iter())
        .collect::<Vec<_>>();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, RunOutcome::ManuallyInterrupted);

    // The worker sleeps a second before recording what it saw.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!rig.root.join("seen.json").exists());
    assert!(!rig.root.join("debug/gui.log").exists());
    assert!(bridge.probes.lock().expect("probes").is_empty());
    assert!(silence.silenced_paths().is_empty());
    assert!(!rig.store.is_locked(rig.script_id));
}

#[tokio::test]
async fn setup_session_captures_the_default_configuration() {
    let rig = rig("setup.sh", false, |_| {}).await;
    let (ctx, mut notifications) = context(&rig);

    let report = timeout(
        RUN_DEADLINE,
        RunStateMachine::new(ctx, RunRequest::new(RunMode::SetupWorker, rig.script_id)).run(),
    )
    .await
    .expect("run finished in time")
    .expect("run report");

    assert_eq!(report.profiles.len(), 1);
    assert_eq!(report.profiles[0].name, "Default");
    assert_eq!(report.profiles[0].status, ProfileStatus::Completed);

    let baseline = read_json(&rig.layout.baseline_path(None));
    assert_eq!(baseline["Global"]["Marker"], json!("captured"));
    let live = read_json(&rig.layout.config_file);
    assert_eq!(live["Global"]["Live"], json!("original"));
    assert!(!rig.store.is_locked(rig.script_id));
    assert!(drain(&mut notifications).is_empty());
}

#[tokio::test]
async fn manual_check_records_the_verdict_per_profile() {
    let rig = rig("worker.sh", true, |settings| {
        settings.set("Run", "RunTimesLimit", json!(1)).expect("run times");
    })
    .await;
    let mut failing = profile("alice", "good");
    failing.set("Data", "IfPassCheck", json!(false)).expect("pass");
    let alice = rig.store.add_profile(rig.script_id, failing).await.expect("alice");
    let bob = rig.store.add_profile(rig.script_id, profile("bob", "bad")).await.expect("bob");
    let (ctx, _notifications) = context(&rig);

    let report = timeout(
        RUN_DEADLINE,
        RunStateMachine::new(ctx, RunRequest::new(RunMode::ManualCheck, rig.script_id)).run(),
    )
    .await
    .expect("run finished in time")
    .expect("run report");

    assert_eq!(report.profiles[0].sub_phases[0].sub_phase, SubPhase::Check);
    let passed = rig
        .store
        .get_profile_value(rig.script_id, alice, "Data", "IfPassCheck")
        .await
        .expect("alice verdict");
    assert_eq!(passed, json!(true));
    let failed = rig
        .store
        .get_profile_value(rig.script_id, bob, "Data", "IfPassCheck")
        .await
        .expect("bob verdict");
    assert_eq!(failed, json!(false));
    let proxy_times = rig
        .store
        .get_profile_value(rig.script_id, alice, "Data", "ProxyTimes")
        .await
        .expect("proxy times");
    assert_eq!(proxy_times, json!(0));
}

#[tokio::test]
async fn policy_skips_and_missing_captures_never_launch_the_worker() {
    let rig = rig("worker.sh", true, |settings| {
        settings.set("Run", "ProxyTimesLimit", json!(1)).expect("proxy limit");
    })
    .await;
    let today = server_date(Local::now().naive_local()).to_string();
    let mut detailed = profile("carol", "good");
    detailed.set("Info", "Mode", json!("Detailed")).expect("mode");
    let mut exhausted = profile("dave", "good");
    exhausted.set("Data", "ProxyTimes", json!(1)).expect("times");
    exhausted.set("Data", "LastProxyDate", json!(today)).expect("date");
    let mut disabled = profile("erin", "good");
    disabled.set("Info", "Status", json!(false)).expect("status");
    for entry in [detailed, exhausted, disabled] {
        rig.store.add_profile(rig.script_id, entry).await.expect("profile");
    }
    let (ctx, _notifications) = context(&rig);

    let report = timeout(
        RUN_DEADLINE,
        RunStateMachine::new(ctx, RunRequest::new(RunMode::AutoProxy, rig.script_id)).run(),
    )
    .await
    .expect("run finished in time")
    .expect("run report");

    let names = report
        .profiles
        .iter()
        .map(|profile| (profile.name.as_str(), profile.status))
        .collect::<Vec<_>>();
    assert_eq!(
        names,
        vec![("dave", ProfileStatus::Skipped), ("carol", ProfileStatus::Failed)]
    );
    assert!(report.profiles.iter().all(|profile| profile.attempts_consumed() == 0));
    assert_eq!(report.statistics.skipped_profiles, vec!["dave".to_string()]);
    assert_eq!(report.statistics.uncompleted_count, 1);
    assert!(!rig.root.join("seen.json").exists());
}

#[tokio::test]
async fn missing_default_capture_rejects_the_run_before_locking() {
    let rig = rig("worker.sh", false, |_| {}).await;
    rig.store.add_profile(rig.script_id, profile("alice", "good")).await.expect("alice");
    let (ctx, _notifications) = context(&rig);

    let err = RunStateMachine::new(ctx, RunRequest::new(RunMode::AutoProxy, rig.script_id))
        .run()
        .await
        .expect_err("validation failure");
    assert!(err.to_string().starts_with("CONFIG_INVALID"));
    assert!(!rig.store.is_locked(rig.script_id));
    assert!(!rig.layout.backup_dir().exists());
    assert!(!rig.data.join("history").exists());
}
