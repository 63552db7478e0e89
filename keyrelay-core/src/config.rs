use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default upper bound on a single agent protocol frame.
pub const DEFAULT_MAX_MESSAGE_LEN: u32 = 256 * 1024;

/// Smallest accepted frame limit.  Below this an RSA-4096 add request no
/// longer fits.
pub const MIN_MAX_MESSAGE_LEN: u32 = 4096;

/// Hyper-V socket service port shared by host listener and guest connector.
pub const DEFAULT_HYPERV_PORT: u32 = 0x2222_3333;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// How long shutdown waits for listeners to drain.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_max_message_len")]
    pub max_message_len: u32,
    /// Skip the Windows certificate store backend.
    #[serde(default)]
    pub disable_capi: bool,
    /// Key files loaded into the keyring at startup.
    #[serde(default)]
    pub keys: Vec<PathBuf>,
}

impl Config {
    /// Reject settings that parse but cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.service.max_message_len >= MIN_MAX_MESSAGE_LEN,
            "service.max_message_len = {} is below the minimum of {MIN_MAX_MESSAGE_LEN}",
            self.service.max_message_len
        );
        Ok(())
    }
}

impl ServiceConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period_secs(),
            max_message_len: default_max_message_len(),
            disable_capi: false,
            keys: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default)]
    pub named_pipe: NamedPipeConfig,
    #[serde(default)]
    pub wsl: WslConfig,
    #[serde(default)]
    pub cygwin: CygwinConfig,
    #[serde(default)]
    pub hyperv: HyperVConfig,
    #[serde(default)]
    pub pageant: PageantConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedPipeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_pipe_name")]
    pub pipe_name: String,
}

impl Default for NamedPipeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pipe_name: default_pipe_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WslConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Socket file name, created in the user's home directory.
    #[serde(default = "default_wsl_socket_name")]
    pub socket_name: String,
    /// Path suggested to the user for the `socat` relay when the TCP
    /// fallback is active.
    #[serde(default = "default_relay_socket")]
    pub relay_socket: String,
}

impl Default for WslConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_name: default_wsl_socket_name(),
            relay_socket: default_relay_socket(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CygwinConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Socket file name, created in the user's home directory.
    #[serde(default = "default_cygwin_socket_name")]
    pub socket_name: String,
}

impl Default for CygwinConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            socket_name: default_cygwin_socket_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HyperVConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hyperv_port")]
    pub port: u32,
}

impl Default for HyperVConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: DEFAULT_HYPERV_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageantConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for PageantConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_max_message_len() -> u32 {
    DEFAULT_MAX_MESSAGE_LEN
}

fn default_pipe_name() -> String {
    r"\\.\pipe\openssh-ssh-agent".to_string()
}

fn default_wsl_socket_name() -> String {
    ".keyrelay-wsl.sock".to_string()
}

fn default_cygwin_socket_name() -> String {
    ".keyrelay-cygwin.sock".to_string()
}

fn default_relay_socket() -> String {
    "/tmp/keyrelay-agent.sock".to_string()
}

fn default_hyperv_port() -> u32 {
    DEFAULT_HYPERV_PORT
}
