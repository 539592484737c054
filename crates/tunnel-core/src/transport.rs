//! 传输缝合层：核心只依赖这里的三个 trait，QUIC 绑定与内存替身分别实现它们。
//!
//! ## 契约（What）
//! - [`TunnelTransport`]：一条已建立的多路复用连接，提供数据报收发、单向流打开/接受以及带错误码的关闭；
//! - [`OutboundStream`]：发送方写完整负载后调用 `finish`，流的结束即消息边界；
//! - [`InboundStream`]：按块读取，`Ok(None)` 表示对端已结束该流；
//! - 异步方法返回 `BoxFuture`（`Send`），以便入站循环在多线程 Tokio 运行时上派生执行。
//!
//! ## 风险与注意（Trade-offs）
//! - `close` 必须能解除所有挂起的 `read_datagram`/`accept_stream`/`read_chunk`，
//!   否则关闭协议无法收敛到 `Closed`；
//! - 本层不做重试与背压，全部委托给实现方的拥塞/流控。

use std::fmt;

use bytes::Bytes;
use futures::future::BoxFuture;

use crate::error::TransportError;

/// 连接标识，诊断文件以其十六进制编码命名。
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ConnectionId(Box<[u8]>);

impl ConnectionId {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into().into_boxed_slice())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// 小写十六进制编码。
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self {
        Self::new(value.to_be_bytes().to_vec())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// 发送侧的单条可靠流。
pub trait OutboundStream: Send {
    /// 写入完整缓冲区。
    fn write_all<'a>(&'a mut self, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>>;

    /// 结束写半部，向接收方宣告消息结束。
    fn finish(&mut self) -> Result<(), TransportError>;
}

/// 接收侧的单条可靠流。
pub trait InboundStream: Send + 'static {
    /// 读取至多 `buf.len()` 字节；`Ok(None)` 表示流已结束。
    fn read_chunk<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<Option<usize>, TransportError>>;
}

/// 一条已建立的安全多路复用连接。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把“打开连接之后”的全部能力收敛为一个 trait，让分发器、入站循环与关闭协议
///   只面向语义编程，QUIC 细节留在 `tunnel-transport-quic`；
///
/// ## 契约（What）
/// - `max_datagram_size`：`None` 表示该连接上数据报不可用；
/// - `send_datagram`：同步入队一个完整数据报，不等待对端确认；
/// - `open_stream`/`accept_stream`：单向流，一条流承载一条消息；
/// - `close`：以应用层错误码与原因关闭连接，必须幂等；
/// - **前置条件**：实现需 `Send + Sync + 'static`，会被会话以 `Arc` 在多个任务间共享。
pub trait TunnelTransport: Send + Sync + 'static {
    type Outbound: OutboundStream;
    type Inbound: InboundStream;

    fn connection_id(&self) -> ConnectionId;

    fn max_datagram_size(&self) -> Option<usize>;

    fn send_datagram(&self, payload: Bytes) -> Result<(), TransportError>;

    fn open_stream(&self) -> BoxFuture<'_, Result<Self::Outbound, TransportError>>;

    fn read_datagram(&self) -> BoxFuture<'_, Result<Bytes, TransportError>>;

    fn accept_stream(&self) -> BoxFuture<'_, Result<Self::Inbound, TransportError>>;

    fn close(&self, code: u64, reason: &[u8]);
}
