use bytes::Bytes;
use futures::future::BoxFuture;
use quinn::{Connection, RecvStream, SendStream, VarInt};
use tunnel_core::{ConnectionId, InboundStream, OutboundStream, TransportError, TunnelTransport};

use crate::error::{self, map_connection_error};

/// `quinn::Connection` 对隧道传输缝合层的实现。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 把 QUIC 连接的数据报与单向流能力映射到 [`TunnelTransport`]，核心层无需感知 `quinn` 类型；
///
/// ## 逻辑（How）
/// - 连接标识取 `stable_id` 的大端字节，诊断文件名由此派生；
/// - 出站可靠消息使用 `open_uni`，入站使用 `accept_uni`，一条流承载一条消息；
/// - `close` 直接调用 `Connection::close`，阻塞中的 `read_datagram`/`accept_uni` 随之以
///   `LocallyClosed` 返回。
///
/// ## 契约（What）
/// - `Connection` 内部为引用计数句柄，克隆开销低；本类型可在多个任务间共享；
/// - 错误码超出 QUIC 变长整数范围时截断为 `VarInt::MAX`。
#[derive(Clone, Debug)]
pub struct QuicTransport {
    connection: Connection,
}

impl QuicTransport {
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }
}

impl TunnelTransport for QuicTransport {
    type Outbound = QuicOutbound;
    type Inbound = QuicInbound;

    fn connection_id(&self) -> ConnectionId {
        ConnectionId::from(self.connection.stable_id() as u64)
    }

    fn max_datagram_size(&self) -> Option<usize> {
        self.connection.max_datagram_size()
    }

    fn send_datagram(&self, payload: Bytes) -> Result<(), TransportError> {
        let size = payload.len();
        self.connection.send_datagram(payload).map_err(|err| {
            error::map_send_datagram_error(err, size, self.connection.max_datagram_size())
        })
    }

    fn open_stream(&self) -> BoxFuture<'_, Result<Self::Outbound, TransportError>> {
        Box::pin(async move {
            let send = self
                .connection
                .open_uni()
                .await
                .map_err(|err| map_connection_error(error::OPEN_STREAM, err))?;
            Ok(QuicOutbound { send })
        })
    }

    fn read_datagram(&self) -> BoxFuture<'_, Result<Bytes, TransportError>> {
        Box::pin(async move {
            self.connection
                .read_datagram()
                .await
                .map_err(|err| map_connection_error(error::READ_DATAGRAM, err))
        })
    }

    fn accept_stream(&self) -> BoxFuture<'_, Result<Self::Inbound, TransportError>> {
        Box::pin(async move {
            let recv = self
                .connection
                .accept_uni()
                .await
                .map_err(|err| map_connection_error(error::ACCEPT_STREAM, err))?;
            Ok(QuicInbound { recv })
        })
    }

    fn close(&self, code: u64, reason: &[u8]) {
        let code = VarInt::from_u64(code).unwrap_or(VarInt::MAX);
        self.connection.close(code, reason);
    }
}

/// 出站单向流。
#[derive(Debug)]
pub struct QuicOutbound {
    send: SendStream,
}

impl OutboundStream for QuicOutbound {
    fn write_all<'a>(&'a mut self, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.send
                .write_all(payload)
                .await
                .map_err(error::map_write_error)
        })
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        self.send.finish().map_err(error::map_finish_error)
    }
}

/// 入站单向流。
#[derive(Debug)]
pub struct QuicInbound {
    recv: RecvStream,
}

impl InboundStream for QuicInbound {
    fn read_chunk<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<Option<usize>, TransportError>> {
        Box::pin(async move { self.recv.read(buf).await.map_err(error::map_read_error) })
    }
}
