//! # tunnel-core
//!
//! ## 定位（Why）
//! - 双通道隧道会话的传输无关核心：把宿主的不透明负载按大小分发到不可靠数据报或可靠单向流，
//!   并把两条通道上的入站消息交还宿主；
//! - 传输能力以 [`TunnelTransport`] 抽象，QUIC 绑定位于 `tunnel-transport-quic`，C ABI 位于 `tunnel-ffi`。
//!
//! ## 模块地图（How）
//! - [`dispatcher`]：出站大小策略（`<= 1200` 字节走数据报）；
//! - `inbound`：数据报循环与流接受循环，逐流按 2048 字节分块重组；
//! - [`shutdown`]：`Running → Closing → Closed` 状态机与协作关闭判定；
//! - [`diagnostics`]：按连接惰性创建 qlog 风格诊断文件；
//! - [`session`]：装配以上部件的会话句柄；
//! - [`config`]：可由 TOML 加载的端点配置；
//! - [`error`]：错误分类与稳定错误码。
//!
//! ## 契约（What）
//! - 每条入站消息恰好交付一次，关闭后的发送返回 [`SessionError::Closed`]；
//! - 线上格式不附加任何应用层帧头，消息边界由数据报边界或流结束标记给出。

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod error;
pub mod host;
mod inbound;
pub mod session;
pub mod shutdown;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    CongestionControl, ConfigError, DATAGRAM_INITIAL_MTU, TunnelClientConfig, TunnelConfig,
    TunnelServerConfig,
};
pub use diagnostics::{DiagnosticsFactory, DiagnosticsWriter, TraceEvent, Vantage};
pub use dispatcher::{DATAGRAM_THRESHOLD, Delivery, OutboundMessage};
pub use error::{DiagnosticsError, Disposition, SessionError, TransportError};
pub use host::HostCallbacks;
pub use inbound::STREAM_CHUNK_SIZE;
pub use session::{SessionOptions, TunnelSession};
pub use shutdown::{CloseReason, Initiator, SessionState};
pub use transport::{ConnectionId, InboundStream, OutboundStream, TunnelTransport};
