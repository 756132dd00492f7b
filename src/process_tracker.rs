use crate::errors::{AppError, AppResult};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration, Instant};

/// Tree discovery and liveness poll interval.
pub const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(100);
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone)]
pub struct ProcessGroup {
    pub main_pid: u32,
    pub tracked: BTreeSet<u32>,
    pub discovery_deadline: Instant,
}

#[derive(Default)]
struct TrackerState {
    main_pid: Option<u32>,
    tracked: BTreeSet<u32>,
    discovery_deadline: Option<Instant>,
    tasks: Vec<JoinHandle<()>>,
}

struct TrackerInner {
    label: String,
    poll_interval: Duration,
    state: StdMutex<TrackerState>,
    child: Mutex<Option<Child>>,
    closed: watch::Sender<bool>,
    closed_events: AtomicU64,
}

/// Owns one launched process plus the descendants discovered while its
/// discovery window was open.
#[derive(Clone)]
pub struct ProcessTracker {
    inner: Arc<TrackerInner>,
}

impl ProcessTracker {
    pub fn new(label: impl Into<String>) -> Self {
        Self::with_poll_interval(label, PROCESS_POLL_INTERVAL)
    }

    pub fn with_poll_interval(label: impl Into<String>, poll_interval: Duration) -> Self {
        let (closed, _) = watch::channel(true);
        Self {
            inner: Arc::new(TrackerInner {
                label: label.into(),
                poll_interval,
                state: StdMutex::new(TrackerState::default()),
                child: Mutex::new(None),
                closed,
                closed_events: AtomicU64::new(0),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub async fn start(
        &self,
        path: &Path,
        args: &[String],
        discovery_window: Duration,
    ) -> AppResult<ProcessGroup> {
        self.abort_tasks();

        let cwd = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut command = Command::new(path);
        command
            .args(args)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            // New session so the whole group can be signalled at once.
            unsafe {
                command.pre_exec(|| {
                    nix::unistd::setsid()
                        .map(|_| ())
                        .map_err(std::io::Error::from)
                });
            }
        }

        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let child = command.spawn().map_err(|error| {
            AppError::Launch(format!("failed to spawn {}: {}", path.display(), error))
        })?;
        let main_pid = child.id().ok_or_else(|| {
            AppError::Launch(format!("{} exited before reporting a pid", path.display()))
        })?;
        *self.inner.child.lock().await = Some(child);

        let mut tracked = BTreeSet::from([main_pid]);
        if !discovery_window.is_zero() {
            let tree = process_tree().await;
            tracked.extend(descendants(&tracked, &tree));
        }
        let discovery_deadline = Instant::now() + discovery_window;

        {
            let mut state = self.lock_state();
            state.main_pid = Some(main_pid);
            state.tracked = tracked.clone();
            state.discovery_deadline = Some(discovery_deadline);
        }
        self.inner.closed.send_replace(false);

        tracing::info!(
            process = %self.inner.label,
            pid = main_pid,
            window_ms = discovery_window.as_millis() as u64,
            "process started"
        );

        let mut tasks = Vec::new();
        if !discovery_window.is_zero() {
            let tracker = self.clone();
            tasks.push(tokio::spawn(async move {
                tracker.discovery_loop(discovery_deadline).await;
            }));
        }
        let tracker = self.clone();
        tasks.push(tokio::spawn(async move {
            tracker.liveness_loop().await;
        }));
        self.lock_state().tasks = tasks;

        Ok(ProcessGroup {
            main_pid,
            tracked,
            discovery_deadline,
        })
    }

    async fn discovery_loop(&self, deadline: Instant) {
        loop {
            tokio::time::sleep(self.inner.poll_interval).await;
            if Instant::now() >= deadline {
                break;
            }
            let tree = process_tree().await;
            let mut state = self.lock_state();
            let found = descendants(&state.tracked, &tree);
            let before = state.tracked.len();
            state.tracked.extend(found);
            if state.tracked.len() > before {
                tracing::debug!(
                    process = %self.inner.label,
                    tracked = state.tracked.len(),
                    "discovered descendant processes"
                );
            }
        }
    }

    async fn liveness_loop(&self) {
        loop {
            tokio::time::sleep(self.inner.poll_interval).await;
            if !self.is_running().await {
                tracing::info!(process = %self.inner.label, "tracked processes exited");
                self.emit_closed();
                break;
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        let (main_pid, tracked) = {
            let state = self.lock_state();
            (state.main_pid, state.tracked.clone())
        };
        if tracked.is_empty() {
            return false;
        }

        let mut main_alive = false;
        if let Some(child) = self.inner.child.lock().await.as_mut() {
            main_alive = matches!(child.try_wait(), Ok(None));
        }
        if main_alive {
            return true;
        }

        let others = tracked
            .into_iter()
            .filter(|pid| Some(*pid) != main_pid)
            .collect::<Vec<_>>();
        if others.is_empty() {
            return false;
        }
        !alive_pids(others).await.is_empty()
    }

    /// Terminates every tracked process. With `force`, whole trees are killed first.
    pub async fn kill(&self, force: bool) {
        self.abort_tasks();
        let (main_pid, tracked) = {
            let mut state = self.lock_state();
            let tracked = std::mem::take(&mut state.tracked);
            (state.main_pid.take(), tracked)
        };

        if !tracked.is_empty() {
            tracing::info!(
                process = %self.inner.label,
                force,
                count = tracked.len(),
                "terminating tracked processes"
            );
        }

        if force && !tracked.is_empty() {
            force_kill_trees(&tracked, main_pid).await;
        }
        for pid in &tracked {
            terminate_pid(*pid).await;
        }

        let child = self.inner.child.lock().await.take();
        if let Some(mut child) = child {
            if timeout(GRACEFUL_EXIT_TIMEOUT, child.wait()).await.is_err() {
                let _ = child.start_kill();
                let _ = timeout(Duration::from_secs(2), child.wait()).await;
            }
        }

        self.emit_closed();
    }

    pub fn tracked_pids(&self) -> BTreeSet<u32> {
        self.lock_state().tracked.clone()
    }

    pub fn main_pid(&self) -> Option<u32> {
        self.lock_state().main_pid
    }

    pub fn discovery_open(&self) -> bool {
        self.lock_state()
            .discovery_deadline
            .is_some_and(|deadline| Instant::now() < deadline)
    }

    pub fn subscribe_closed(&self) -> watch::Receiver<bool> {
        self.inner.closed.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Number of running-to-closed transitions observed so far.
    pub fn closed_events(&self) -> u64 {
        self.inner.closed_events.load(Ordering::SeqCst)
    }

    fn emit_closed(&self) {
        if !self.inner.closed.send_replace(true) {
            self.inner.closed_events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn abort_tasks(&self) {
        let tasks = std::mem::take(&mut self.lock_state().tasks);
        for task in tasks {
            task.abort();
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Kills every running process whose executable is `executable`. Returns how many were signalled.
pub async fn kill_by_executable(executable: &Path) -> usize {
    let target = executable
        .canonicalize()
        .unwrap_or_else(|_| executable.to_path_buf());
    tokio::task::spawn_blocking(move || {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::new().with_exe(UpdateKind::OnlyIfNotSet),
        );
        let mut killed = 0;
        for process in system.processes().values() {
            if process.exe() == Some(target.as_path()) && process.kill() {
                killed += 1;
            }
        }
        if killed > 0 {
            tracing::info!(executable = %target.display(), killed, "killed stale worker processes");
        }
        killed
    })
    .await
    .unwrap_or(0)
}

/// Snapshot of parent pid to child pids.
async fn process_tree() -> HashMap<u32, Vec<u32>> {
    tokio::task::spawn_blocking(|| {
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::new());
        let mut tree: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in system.processes() {
            if matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead) {
                continue;
            }
            if let Some(parent) = process.parent() {
                tree.entry(parent.as_u32()).or_default().push(pid.as_u32());
            }
        }
        tree
    })
    .await
    .unwrap_or_default()
}

fn descendants(roots: &BTreeSet<u32>, tree: &HashMap<u32, Vec<u32>>) -> BTreeSet<u32> {
    let mut found = BTreeSet::new();
    let mut stack = roots.iter().copied().collect::<Vec<_>>();
    while let Some(pid) = stack.pop() {
        if let Some(children) = tree.get(&pid) {
            for child in children {
                if !roots.contains(child) && found.insert(*child) {
                    stack.push(*child);
                }
            }
        }
    }
    found
}

async fn alive_pids(pids: Vec<u32>) -> BTreeSet<u32> {
    tokio::task::spawn_blocking(move || {
        let targets = pids.iter().map(|pid| Pid::from_u32(*pid)).collect::<Vec<_>>();
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::new(),
        );
        targets
            .iter()
            .filter(|pid| {
                system.process(**pid).is_some_and(|process| {
                    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
                })
            })
            .map(|pid| pid.as_u32())
            .collect()
    })
    .await
    .unwrap_or_default()
}

#[cfg(unix)]
async fn force_kill_trees(tracked: &BTreeSet<u32>, main_pid: Option<u32>) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid as NixPid;

    let tree = process_tree().await;
    let mut doomed = tracked.clone();
    doomed.extend(descendants(tracked, &tree));
    if let Some(main_pid) = main_pid {
        let _ = killpg(NixPid::from_raw(main_pid as i32), Signal::SIGKILL);
    }
    for pid in doomed {
        let _ = kill(NixPid::from_raw(pid as i32), Signal::SIGKILL);
    }
}

#[cfg(windows)]
async fn force_kill_trees(tracked: &BTreeSet<u32>, _main_pid: Option<u32>) {
    for pid in tracked {
        let _ = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
    }
}

#[cfg(unix)]
async fn terminate_pid(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;
    let _ = kill(NixPid::from_raw(pid as i32), Signal::SIGTERM);
}

#[cfg(windows)]
async fn terminate_pid(pid: u32) {
    let _ = Command::new("taskkill")
        .args(["/PID", &pid.to_string()])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;
}
