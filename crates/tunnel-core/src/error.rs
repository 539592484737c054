//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义隧道核心的错误语义：传输缝合层的结构化错误、宿主调用可见的会话错误，以及诊断文件创建失败；
//! - 以结构化变体替代对错误文案的字符串比较，协作式关闭（code `0` + 固定原因）由
//!   [`TransportError::disposition`] 判定。
//!
//! ## 设计要求（What）
//! - 所有错误派生 `thiserror::Error`，可直接交给 `anyhow` 等上层框架；
//! - [`SessionError::Closed`] 是“会话已关闭”的唯一标识，关闭后的任何发送都映射到该变体；
//! - 每个宿主可见错误都带有稳定错误码（`tunnel.session.*`），便于 C ABI 与日志统一口径。

use std::{io, path::PathBuf};

use thiserror::Error;

/// 协作式关闭使用的应用层错误码。
pub const COOPERATIVE_CLOSE_CODE: u64 = 0;
/// 协作式关闭携带的原因字符串。
pub const COOPERATIVE_CLOSE_REASON: &str = "normal shutdown";
/// 传输故障触发会话拆除时使用的应用层错误码。
pub const FAULT_CLOSE_CODE: u64 = 1;
/// 传输故障触发会话拆除时携带的原因字符串。
pub const FAULT_CLOSE_REASON: &str = "transport fault";

/// 传输缝合层返回的结构化错误。
///
/// # 教案式说明
/// - **意图 (Why)**：把底层实现（QUIC 或内存替身）的错误折叠为有限变体，入站循环只需匹配变体即可区分
///   “对端协作关闭”与“传输故障”；
/// - **契约 (What)**：`ApplicationClosed` 保留对端给出的错误码与原因；`LocallyClosed` 表示本端已调用
///   `close`；`Fault` 以 `operation` 标注出错的传输操作；
/// - **风险 (Trade-offs)**：`detail` 仅为可读文本，不参与分类决策。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// 连接被应用层关闭（通常来自对端）。
    #[error("application closed with code {code}: {reason}")]
    ApplicationClosed { code: u64, reason: String },
    /// 本端已经关闭连接，挂起的阻塞调用随之返回。
    #[error("connection closed locally")]
    LocallyClosed,
    /// 连接不支持（或已禁用）不可靠数据报。
    #[error("datagrams are not supported on this connection")]
    DatagramsUnsupported,
    /// 数据报超过传输层的硬上限。
    #[error("datagram of {size} bytes exceeds the {limit} byte limit")]
    DatagramTooLarge { size: usize, limit: usize },
    /// 对端以错误码重置了流。
    #[error("stream reset by peer with code {code}")]
    StreamReset { code: u64 },
    /// 其余一切传输失败。
    #[error("{operation}: {detail}")]
    Fault {
        operation: &'static str,
        detail: String,
    },
}

/// 终止条件的分类结果。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// 协作式关闭：循环应安静退出。
    CooperativeClose,
    /// 传输故障：记录并拆除会话。
    Fault,
}

impl TransportError {
    /// 以操作名与任意可显示错误构造 [`TransportError::Fault`]。
    pub fn fault(operation: &'static str, detail: impl ToString) -> Self {
        TransportError::Fault {
            operation,
            detail: detail.to_string(),
        }
    }

    /// 构造对端协作关闭信号，主要供传输替身与测试使用。
    pub fn cooperative_close() -> Self {
        TransportError::ApplicationClosed {
            code: COOPERATIVE_CLOSE_CODE,
            reason: COOPERATIVE_CLOSE_REASON.to_owned(),
        }
    }

    /// 按结构判定错误属于协作式关闭还是故障。
    ///
    /// - 应用层关闭仅在错误码为 `0` 且原因等于 [`COOPERATIVE_CLOSE_REASON`] 时视为协作关闭；
    /// - `LocallyClosed` 意味着本端已经发起关闭（`stop` 或故障拆除），同样按协作关闭处理；
    /// - 其余变体一律为故障。
    pub fn disposition(&self) -> Disposition {
        match self {
            TransportError::ApplicationClosed { code, reason }
                if *code == COOPERATIVE_CLOSE_CODE && reason == COOPERATIVE_CLOSE_REASON =>
            {
                Disposition::CooperativeClose
            }
            TransportError::LocallyClosed => Disposition::CooperativeClose,
            _ => Disposition::Fault,
        }
    }

    pub fn is_cooperative_close(&self) -> bool {
        self.disposition() == Disposition::CooperativeClose
    }
}

/// 宿主调用（发送、停止）可见的会话错误。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// 会话已进入 `Closing` 或 `Closed`，不再接受发送。
    #[error("session closed")]
    Closed,
    /// 负载超过当前连接允许的数据报上限，未尝试发送。
    #[error("datagram of {size} bytes exceeds the transport limit of {limit} bytes")]
    DatagramTooLarge { size: usize, limit: usize },
    /// 对端未协商数据报扩展，无法走不可靠通道。
    #[error("datagrams are unavailable on this connection")]
    DatagramsUnavailable,
    /// 其余传输失败，原样透出，不做重试。
    #[error(transparent)]
    Transport(TransportError),
}

impl SessionError {
    /// 稳定错误码，供日志与 C ABI 状态映射使用。
    pub fn code(&self) -> &'static str {
        match self {
            SessionError::Closed => "tunnel.session.closed",
            SessionError::DatagramTooLarge { .. } => "tunnel.session.datagram_too_large",
            SessionError::DatagramsUnavailable => "tunnel.session.datagrams_unavailable",
            SessionError::Transport(_) => "tunnel.session.transport_failed",
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        if error.is_cooperative_close() {
            return SessionError::Closed;
        }
        match error {
            TransportError::DatagramTooLarge { size, limit } => {
                SessionError::DatagramTooLarge { size, limit }
            }
            TransportError::DatagramsUnsupported => SessionError::DatagramsUnavailable,
            other => SessionError::Transport(other),
        }
    }
}

/// 诊断写入器创建失败。调用方记录后继续运行，该连接不再产生诊断文件。
#[derive(Debug, Error)]
pub enum DiagnosticsError {
    #[error("failed to create diagnostics directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to create diagnostics file {path}: {source}")]
    CreateFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
