//! 隧道端点配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：客户端与服务端共享一组连接参数（数据报开关、诊断目录、ALPN、拥塞控制、超时），
//!   各自再补充远端地址或监听地址；配置可由宿主以 TOML 文件提供，也可在代码中直接构造；
//! - **契约 (What)**：
//!   - 缺省值：`enable_datagrams = true`、`alpn = "quic-echo-example"`、`congestion_control = "newreno"`、
//!     `idle_timeout_ms = 30000`、地址 `localhost:4242`、`server_name = "localhost"`；
//!   - `qlog_dir` 为空字符串等价于禁用诊断；
//!   - 启用数据报且未显式设置 `initial_mtu` 时取 [`DATAGRAM_INITIAL_MTU`]，使阈值以内的消息
//!     从首个包起即可作为单个数据报发出；
//!   - 未知拥塞控制算法名在解析阶段即被拒绝；
//! - **风险 (Trade-offs)**：地址保持字符串形式，解析延后到绑定或连接时，以支持主机名。

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 默认 ALPN 标识。
pub const DEFAULT_ALPN: &str = "quic-echo-example";
/// 默认端点地址。
pub const DEFAULT_ADDRESS: &str = "localhost:4242";
/// 客户端缺省诊断目录。
pub const DEFAULT_CLIENT_QLOG_DIR: &str = "tunnel-in-logs";
/// 服务端缺省诊断目录。
pub const DEFAULT_SERVER_QLOG_DIR: &str = "tunnel-out-logs";

const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;
/// QUIC 要求的最小初始 MTU。
const MIN_INITIAL_MTU: u16 = 1200;
/// 启用数据报时的缺省初始 MTU。
///
/// 短包头、连接标识、AEAD 标签与 DATAGRAM 帧头合计约 38 字节，1280 字节的 UDP 负载
/// 留出的数据报上限不低于 1200 字节的分发阈值。
pub const DATAGRAM_INITIAL_MTU: u16 = 1280;

/// 配置加载或校验失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown congestion control algorithm `{0}`")]
    UnknownCongestionControl(String),
    #[error("alpn must not be empty")]
    EmptyAlpn,
    #[error("initial_mtu {0} is below the QUIC minimum of 1200")]
    InitialMtuTooSmall(u16),
}

/// 可选的拥塞控制算法。
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CongestionControl {
    #[default]
    NewReno,
    Cubic,
    Bbr,
}

impl CongestionControl {
    pub const ALL: [CongestionControl; 3] = [
        CongestionControl::NewReno,
        CongestionControl::Cubic,
        CongestionControl::Bbr,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CongestionControl::NewReno => "newreno",
            CongestionControl::Cubic => "cubic",
            CongestionControl::Bbr => "bbr",
        }
    }
}

impl fmt::Display for CongestionControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CongestionControl {
    type Err = ConfigError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let normalized = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|candidate| candidate.as_str() == normalized)
            .ok_or_else(|| ConfigError::UnknownCongestionControl(name.to_owned()))
    }
}

/// 客户端与服务端共享的连接参数。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enable_datagrams: bool,
    pub qlog_dir: Option<PathBuf>,
    pub alpn: String,
    pub congestion_control: CongestionControl,
    pub idle_timeout_ms: u64,
    pub keep_alive_ms: Option<u64>,
    pub initial_mtu: Option<u16>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enable_datagrams: true,
            qlog_dir: None,
            alpn: DEFAULT_ALPN.to_owned(),
            congestion_control: CongestionControl::default(),
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            keep_alive_ms: None,
            initial_mtu: None,
        }
    }
}

impl TunnelConfig {
    /// 生效的诊断目录；未配置或为空字符串时返回 `None`。
    pub fn qlog_dir(&self) -> Option<&Path> {
        self.qlog_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// `0` 表示不设空闲超时。
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_ms > 0).then(|| Duration::from_millis(self.idle_timeout_ms))
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.keep_alive_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// 生效的初始 MTU：显式配置优先；否则启用数据报时取 [`DATAGRAM_INITIAL_MTU`]，
    /// 禁用时交给传输层缺省值。
    pub fn effective_initial_mtu(&self) -> Option<u16> {
        self.initial_mtu
            .or_else(|| self.enable_datagrams.then_some(DATAGRAM_INITIAL_MTU))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alpn.is_empty() {
            return Err(ConfigError::EmptyAlpn);
        }
        if let Some(mtu) = self.initial_mtu
            && mtu < MIN_INITIAL_MTU
        {
            return Err(ConfigError::InitialMtuTooSmall(mtu));
        }
        Ok(())
    }
}

/// 客户端（隧道入口）配置。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TunnelClientConfig {
    #[serde(default = "default_address")]
    pub remote: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// 受信任的服务端证书（DER 或 PEM）；缺省时不校验服务端身份。
    #[serde(default)]
    pub trusted_certificate: Option<PathBuf>,
    #[serde(flatten)]
    pub tunnel: TunnelConfig,
}

impl Default for TunnelClientConfig {
    fn default() -> Self {
        Self {
            remote: default_address(),
            server_name: default_server_name(),
            trusted_certificate: None,
            tunnel: TunnelConfig::default(),
        }
    }
}

impl TunnelClientConfig {
    pub fn new(remote: impl Into<String>) -> Self {
        Self {
            remote: remote.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.tunnel.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read(path.as_ref())?)
    }
}

/// 服务端（隧道出口）配置。
#[derive(Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct TunnelServerConfig {
    #[serde(default = "default_address")]
    pub bind: String,
    #[serde(flatten)]
    pub tunnel: TunnelConfig,
}

impl Default for TunnelServerConfig {
    fn default() -> Self {
        Self {
            bind: default_address(),
            tunnel: TunnelConfig::default(),
        }
    }
}

impl TunnelServerConfig {
    pub fn new(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.tunnel.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&read(path.as_ref())?)
    }
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn default_address() -> String {
    DEFAULT_ADDRESS.to_owned()
}

fn default_server_name() -> String {
    "localhost".to_owned()
}
