use std::{fmt, io};

use quinn::{ClosedStream, ConnectError, ConnectionError, ReadError, SendDatagramError, WriteError};
use thiserror::Error;
use tunnel_core::{ConfigError, TransportError};

/// QUIC 绑定的错误映射工具。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - **统一错误码**：将 `quinn`、`rustls`、`rcgen` 与标准库 IO 错误转换为稳定的错误码，
///   便于日志与 C ABI 状态统一口径；
/// - **两类出口**：建立连接之前的失败汇总为 [`StartError`]，连接建立之后的失败折叠为
///   `tunnel-core` 的 [`TransportError`]，后者按结构区分协作关闭与故障。
///
/// ## 逻辑（How）
/// - `OperationKind` 记录错误码与操作名；
/// - `map_*` 系列函数根据错误来源生成对应错误，`ApplicationClosed` 与 `LocallyClosed`
///   保持结构化，其余一律落入 `TransportError::Fault`。
///
/// ## 契约（What）
/// - 所有错误码遵循 `tunnel.quic.*` 命名约定；
/// - **前置条件**：调用方需传入与操作对应的 `OperationKind`，保证错误码语义稳定。
///
/// ## 风险与注意（Trade-offs）
/// - `quinn` 错误枚举未来可能扩展，需要同步更新映射函数；
/// - 错误文案统一使用英文描述，以便跨团队排障。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const RESOLVE: OperationKind = OperationKind {
    code: "tunnel.quic.resolve_failed",
    message: "quic resolve",
};

pub(crate) const BIND: OperationKind = OperationKind {
    code: "tunnel.quic.bind_failed",
    message: "quic bind",
};

pub(crate) const CREDENTIALS: OperationKind = OperationKind {
    code: "tunnel.quic.credentials_failed",
    message: "quic credentials",
};

pub(crate) const TLS: OperationKind = OperationKind {
    code: "tunnel.quic.tls_failed",
    message: "quic tls",
};

pub(crate) const CONFIG: OperationKind = OperationKind {
    code: "tunnel.quic.config_invalid",
    message: "quic config",
};

pub(crate) const CONNECT: OperationKind = OperationKind {
    code: "tunnel.quic.connect_failed",
    message: "quic connect",
};

pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "tunnel.quic.accept_failed",
    message: "quic accept",
};

pub(crate) const OPEN_STREAM: OperationKind = OperationKind {
    code: "tunnel.quic.open_stream_failed",
    message: "quic open_stream",
};

pub(crate) const ACCEPT_STREAM: OperationKind = OperationKind {
    code: "tunnel.quic.accept_stream_failed",
    message: "quic accept_stream",
};

pub(crate) const READ: OperationKind = OperationKind {
    code: "tunnel.quic.read_failed",
    message: "quic read",
};

pub(crate) const WRITE: OperationKind = OperationKind {
    code: "tunnel.quic.write_failed",
    message: "quic write",
};

pub(crate) const FINISH: OperationKind = OperationKind {
    code: "tunnel.quic.finish_failed",
    message: "quic finish",
};

pub(crate) const SEND_DATAGRAM: OperationKind = OperationKind {
    code: "tunnel.quic.send_datagram_failed",
    message: "quic send_datagram",
};

pub(crate) const READ_DATAGRAM: OperationKind = OperationKind {
    code: "tunnel.quic.read_datagram_failed",
    message: "quic read_datagram",
};

/// 端点启动（解析、绑定、握手）阶段的失败。启动失败不会重试。
#[derive(Debug, Error)]
#[error("{message}: {detail}")]
pub struct StartError {
    code: &'static str,
    message: &'static str,
    detail: String,
}

impl StartError {
    pub(crate) fn new(kind: OperationKind, detail: impl fmt::Display) -> Self {
        Self {
            code: kind.code,
            message: kind.message,
            detail: detail.to_string(),
        }
    }

    /// 稳定错误码，例如 `tunnel.quic.connect_failed`。
    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }
}

impl From<ConfigError> for StartError {
    fn from(error: ConfigError) -> Self {
        StartError::new(CONFIG, error)
    }
}

pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> StartError {
    StartError::new(kind, error)
}

pub(crate) fn map_connect_error(kind: OperationKind, error: ConnectError) -> StartError {
    StartError::new(kind, error)
}

pub(crate) fn map_handshake_error(kind: OperationKind, error: ConnectionError) -> StartError {
    StartError::new(kind, error)
}

pub(crate) fn map_tls_error(error: rustls::Error) -> StartError {
    StartError::new(TLS, error)
}

pub(crate) fn map_rcgen_error(error: rcgen::Error) -> StartError {
    StartError::new(CREDENTIALS, error)
}

pub(crate) fn closed_error(kind: OperationKind, detail: &'static str) -> StartError {
    StartError::new(kind, detail)
}

/// 连接级错误：协作关闭与本端关闭保持结构化，其余视为故障。
pub(crate) fn map_connection_error(kind: OperationKind, error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::ApplicationClosed(close) => TransportError::ApplicationClosed {
            code: close.error_code.into_inner(),
            reason: String::from_utf8_lossy(&close.reason).into_owned(),
        },
        ConnectionError::LocallyClosed => TransportError::LocallyClosed,
        other => TransportError::fault(kind.message, other),
    }
}

pub(crate) fn map_send_datagram_error(
    error: SendDatagramError,
    size: usize,
    limit: Option<usize>,
) -> TransportError {
    match error {
        SendDatagramError::UnsupportedByPeer | SendDatagramError::Disabled => {
            TransportError::DatagramsUnsupported
        }
        SendDatagramError::TooLarge => TransportError::DatagramTooLarge {
            size,
            limit: limit.unwrap_or_default(),
        },
        SendDatagramError::ConnectionLost(lost) => map_connection_error(SEND_DATAGRAM, lost),
    }
}

pub(crate) fn map_write_error(error: WriteError) -> TransportError {
    match error {
        WriteError::Stopped(code) => TransportError::StreamReset {
            code: code.into_inner(),
        },
        WriteError::ConnectionLost(lost) => map_connection_error(WRITE, lost),
        other @ (WriteError::ClosedStream | WriteError::ZeroRttRejected) => {
            TransportError::fault(WRITE.message, other)
        }
    }
}

pub(crate) fn map_read_error(error: ReadError) -> TransportError {
    match error {
        ReadError::Reset(code) => TransportError::StreamReset {
            code: code.into_inner(),
        },
        ReadError::ConnectionLost(lost) => map_connection_error(READ, lost),
        other @ (ReadError::ClosedStream
        | ReadError::IllegalOrderedRead
        | ReadError::ZeroRttRejected) => TransportError::fault(READ.message, other),
    }
}

pub(crate) fn map_finish_error(error: ClosedStream) -> TransportError {
    TransportError::fault(FINISH.message, error)
}
