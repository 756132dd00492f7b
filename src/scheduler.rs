use crate::errors::{AppError, AppResult};
use crate::models::{RunMode, RunReport};
use crate::runner::{RunContext, RunRequest, RunStateMachine};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub const DEFAULT_GLOBAL_LIMIT: usize = 1;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 64;
const COMPLETION_CHANNEL_CAPACITY: usize = 64;

/// Delivered once per orchestration that left the queue and ran.
#[derive(Debug)]
pub struct RunCompletion {
    pub script_id: Uuid,
    pub mode: RunMode,
    pub result: AppResult<RunReport>,
}

/// FIFO queue of run requests, executing at most `global_limit` orchestrations at once.
#[derive(Clone)]
pub struct Orchestrator {
    ctx: RunContext,
    queue: Arc<Mutex<VecDeque<RunRequest>>>,
    running: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
    notify: Arc<Notify>,
    completions: mpsc::Sender<RunCompletion>,
    global_limit: usize,
    max_queue_size: usize,
}

impl Orchestrator {
    pub fn new(
        ctx: RunContext,
        global_limit: usize,
        max_queue_size: usize,
    ) -> (Self, mpsc::Receiver<RunCompletion>) {
        let (completions, receiver) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);
        let orchestrator = Self {
            ctx,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            notify: Arc::new(Notify::new()),
            completions,
            global_limit: global_limit.max(1),
            max_queue_size,
        };
        (orchestrator, receiver)
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub async fn enqueue(&self, request: RunRequest) -> AppResult<()> {
        {
            let mut queue = self.queue.lock().await;
            let running = self.running.lock().await;
            let script_id = request.script_id;
            if running.contains_key(&script_id) || queue.iter().any(|queued| queued.script_id == script_id) {
                return Err(AppError::Lock(format!(
                    "script {} is already queued or running",
                    script_id
                )));
            }
            if queue.len() >= self.max_queue_size {
                return Err(AppError::Internal(format!(
                    "Queue capacity exceeded (max {}).",
                    self.max_queue_size
                )));
            }
            tracing::info!(script_id = %script_id, mode = request.mode.as_str(), "run queued");
            queue.push_back(request);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Removes a queued request or interrupts a running one. Returns false for unknown scripts.
    pub async fn cancel(&self, script_id: Uuid) -> bool {
        let mut queue = self.queue.lock().await;
        if let Some(index) = queue.iter().position(|queued| queued.script_id == script_id) {
            queue.remove(index);
            tracing::info!(script_id = %script_id, "queued run cancelled");
            return true;
        }
        let running = self.running.lock().await;
        match running.get(&script_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(script_id = %script_id, "running run interrupted");
                true
            }
            None => false,
        }
    }

    pub async fn active(&self) -> Vec<Uuid> {
        let mut ids = self.running.lock().await.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }

    pub async fn queued(&self) -> Vec<Uuid> {
        self.queue
            .lock()
            .await
            .iter()
            .map(|request| request.script_id)
            .collect()
    }

    pub fn start(&self) {
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.run_loop().await;
        });
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            while let Some((request, token)) = self.pick_next().await {
                let orchestrator = self.clone();
                tokio::spawn(async move {
                    orchestrator.execute(request, token).await;
                });
            }
        }
    }

    async fn pick_next(&self) -> Option<(RunRequest, CancellationToken)> {
        let mut queue = self.queue.lock().await;
        let mut running = self.running.lock().await;
        if running.len() >= self.global_limit {
            return None;
        }
        let request = queue.pop_front()?;
        let token = CancellationToken::new();
        running.insert(request.script_id, token.clone());
        Some((request, token))
    }

    async fn execute(&self, request: RunRequest, token: CancellationToken) {
        let script_id = request.script_id;
        let mode = request.mode;
        tracing::info!(script_id = %script_id, mode = mode.as_str(), "run dequeued");
        let result = RunStateMachine::with_interrupt(self.ctx.clone(), request, token)
            .run()
            .await;
        if let Err(error) = &result {
            tracing::warn!(script_id = %script_id, error = %error, "run ended without a report");
        }

        self.running.lock().await.remove(&script_id);
        let completion = RunCompletion {
            script_id,
            mode,
            result,
        };
        if self.completions.send(completion).await.is_err() {
            tracing::debug!(script_id = %script_id, "completion receiver dropped");
        }
        self.notify.notify_one();
    }
}
