use crate::worker_config::{Scope, WorkerConfig};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

const BRIDGE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Companion launch settings as recorded in the worker's own config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionSettings {
    pub executable: Option<PathBuf>,
    pub args: Vec<String>,
    pub wait_seconds: u64,
    pub bridge_path: Option<PathBuf>,
    pub address: String,
    pub launch_with_worker: bool,
}

impl CompanionSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        let non_empty = |key: &str| {
            config
                .get(Scope::Profile, key)
                .filter(|value| !value.trim().is_empty())
        };
        Self {
            executable: non_empty("Start.EmulatorPath").map(PathBuf::from),
            args: non_empty("Start.EmulatorAddCommand")
                .map(|value| value.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            wait_seconds: non_empty("Start.EmulatorWaitSeconds")
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(0),
            bridge_path: non_empty("Connect.AdbPath").map(PathBuf::from),
            address: non_empty("Connect.Address").unwrap_or_default(),
            launch_with_worker: config.get_flag(Scope::Profile, "Start.OpenEmulatorAfterLaunch"),
        }
    }
}

/// Debug bridge used to reach the companion.
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    async fn connect(&self, address: &str) -> bool;
    async fn disconnect(&self, address: &str);
    async fn devices(&self) -> Vec<String>;
}

pub trait BridgeProvider: Send + Sync {
    fn bridge(&self, bridge_path: &Path) -> Arc<dyn DeviceBridge>;
}

/// Talks to the `adb` command-line client.
pub struct AdbBridge {
    program: PathBuf,
}

impl AdbBridge {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Option<String> {
        let mut command = Command::new(&self.program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        match timeout(BRIDGE_COMMAND_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).to_string()),
            Ok(Err(error)) => {
                tracing::warn!(program = %self.program.display(), error = %error, "bridge command failed");
                None
            }
            Err(_) => {
                tracing::warn!(program = %self.program.display(), ?args, "bridge command timed out");
                None
            }
        }
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn connect(&self, address: &str) -> bool {
        self.run(&["connect", address])
            .await
            .is_some_and(|stdout| stdout.contains("connected"))
    }

    async fn disconnect(&self, address: &str) {
        let _ = self.run(&["disconnect", address]).await;
    }

    async fn devices(&self) -> Vec<String> {
        self.run(&["devices"])
            .await
            .map(|stdout| parse_device_list(&stdout))
            .unwrap_or_default()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AdbBridgeProvider;

impl BridgeProvider for AdbBridgeProvider {
    fn bridge(&self, bridge_path: &Path) -> Arc<dyn DeviceBridge> {
        Arc::new(AdbBridge::new(bridge_path))
    }
}

fn parse_device_list(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some(serial), Some("device")) => Some(serial.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Port offsets probed around the nominal port: 0, +1, -1, +2, -2, ...
pub fn port_offsets(range: u16) -> Vec<i32> {
    let mut offsets = vec![0];
    for step in 1..=i32::from(range) {
        offsets.push(step);
        offsets.push(-step);
    }
    offsets
}

/// Splits `host:port` or `emulator-port` into its prefix, separator and port.
fn split_address(address: &str) -> Option<(&str, char, u16)> {
    let index = address.rfind([':', '-'])?;
    let separator = address[index..].chars().next()?;
    let port = address[index + 1..].parse().ok()?;
    Some((&address[..index], separator, port))
}

pub fn candidate_addresses(nominal: &str, range: u16) -> Vec<String> {
    let Some((host, separator, port)) = split_address(nominal) else {
        return vec![nominal.to_string()];
    };
    port_offsets(range)
        .into_iter()
        .filter_map(|offset| u16::try_from(i32::from(port) + offset).ok())
        .map(|candidate| format!("{}{}{}", host, separator, candidate))
        .collect()
}

/// Probes candidate addresses in order and returns the first one that connects and is
/// listed as a device. Nothing is probed after the first hit.
pub async fn rediscover_address(bridge: &dyn DeviceBridge, nominal: &str, range: u16) -> Option<String> {
    for candidate in candidate_addresses(nominal, range) {
        if !bridge.connect(&candidate).await {
            continue;
        }
        let present = bridge.devices().await.iter().any(|device| device == &candidate);
        if present {
            bridge.disconnect(&candidate).await;
            tracing::info!(nominal = %nominal, address = %candidate, "companion address rediscovered");
            return Some(candidate);
        }
    }
    tracing::warn!(nominal = %nominal, range, "companion address not found; continuing with nominal address");
    None
}
