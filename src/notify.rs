use crate::models::ProgressEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

const DEFAULT_PROGRESS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    RunResult,
    AttemptsExhausted,
    ProfileStatistics,
    Jackpot,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunResult => "run-result",
            Self::AttemptsExhausted => "attempts-exhausted",
            Self::ProfileStatistics => "profile-statistics",
            Self::Jackpot => "jackpot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub kind: NotificationKind,
    pub title: String,
    pub payload: Value,
}

/// Outbound notification channel. Implementations must not block and must
/// swallow their own delivery failures.
pub trait Notifier: Send + Sync {
    fn push(&self, kind: NotificationKind, title: &str, payload: &Value);
}

/// Writes notifications to the structured log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn push(&self, kind: NotificationKind, title: &str, payload: &Value) {
        tracing::info!(kind = kind.as_str(), title = %title, payload = %payload, "notification");
    }
}

/// Forwards notifications to a single consumer over a bounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn push(&self, kind: NotificationKind, title: &str, payload: &Value) {
        let notification = Notification {
            kind,
            title: title.to_string(),
            payload: payload.clone(),
        };
        if let Err(error) = self.sender.try_send(notification) {
            tracing::warn!(kind = kind.as_str(), error = %error, "notification dropped");
        }
    }
}

/// UI bridge for one orchestration. Sends never wait; a full or closed
/// channel drops the event.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    sender: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel() -> (Self, mpsc::Receiver<ProgressEvent>) {
        Self::with_capacity(DEFAULT_PROGRESS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (
            Self {
                sender: Some(sender),
            },
            receiver,
        )
    }

    /// A sink that discards everything.
    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn send(&self, event: ProgressEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(error) = sender.try_send(event) {
            tracing::debug!(error = %error, "progress event dropped");
        }
    }

    pub fn message(&self, level: &str, text: impl Into<String>) {
        self.send(ProgressEvent::Message {
            level: level.to_string(),
            text: text.into(),
        });
    }
}
