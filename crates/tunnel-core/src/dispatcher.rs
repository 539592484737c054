//! 双通道分发器：按负载大小为每条出站消息选择不可靠数据报或可靠流。
//!
//! ## 策略（How）
//! - `len <= 1200`：单个数据报，一次传输调用；
//! - 其余：打开一条新的单向流，写入完整负载后立即 `finish`，流结束即消息边界；
//! - 会话以“禁用数据报”启动时，所有消息都走可靠流。
//!
//! 1200 字节是常见路径 MTU 扣除协议开销后的保守上界，保证数据报无需传输层分片。
//! 发送失败直接返回调用方，不重试、不排队，拥塞与流控交给传输层。

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::{
    error::SessionError,
    transport::{OutboundStream, TunnelTransport},
};

/// 走数据报通道的最大负载长度（含）。
pub const DATAGRAM_THRESHOLD: usize = 1200;

/// 一条出站消息最终采用的通道。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Delivery {
    Datagram,
    Stream,
}

/// 出站消息。`flow_id` 为预留的多流寻址字段，目前恒为 `0`，不参与线上格式。
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OutboundMessage {
    pub flow_id: u64,
    pub payload: Bytes,
}

impl OutboundMessage {
    pub fn new(payload: Bytes) -> Self {
        Self {
            flow_id: 0,
            payload,
        }
    }
}

pub struct Dispatcher<T> {
    transport: Arc<T>,
    datagrams_enabled: bool,
}

impl<T: TunnelTransport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, datagrams_enabled: bool) -> Self {
        Self {
            transport,
            datagrams_enabled,
        }
    }

    /// 纯策略判定，不触发任何传输调用。
    pub fn route(&self, len: usize) -> Delivery {
        if self.datagrams_enabled && len <= DATAGRAM_THRESHOLD {
            Delivery::Datagram
        } else {
            Delivery::Stream
        }
    }

    /// 按大小策略发送一条消息，返回实际采用的通道。
    pub async fn send(&self, message: OutboundMessage) -> Result<Delivery, SessionError> {
        let delivery = self.route(message.payload.len());
        match delivery {
            Delivery::Datagram => self.send_datagram(message.payload)?,
            Delivery::Stream => self.send_stream(&message.payload).await?,
        }
        Ok(delivery)
    }

    /// 强制可靠通道：一条消息占用一条短生命周期的单向流。
    pub async fn send_stream(&self, payload: &[u8]) -> Result<(), SessionError> {
        let mut stream = self.transport.open_stream().await?;
        stream.write_all(payload).await?;
        stream.finish()?;
        trace!(len = payload.len(), "stream message sent");
        Ok(())
    }

    fn send_datagram(&self, payload: Bytes) -> Result<(), SessionError> {
        let size = payload.len();
        let limit = self
            .transport
            .max_datagram_size()
            .ok_or(SessionError::DatagramsUnavailable)?;
        if size > limit {
            return Err(SessionError::DatagramTooLarge { size, limit });
        }
        self.transport.send_datagram(payload)?;
        trace!(len = size, "datagram sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::TransportError,
        testing::{Call, MockPeer, MockTransport},
        transport::ConnectionId,
    };

    fn fixture(limit: Option<usize>, datagrams: bool) -> (Dispatcher<MockTransport>, MockPeer) {
        let (transport, peer) = MockTransport::pair(ConnectionId::from(7_u64), limit);
        (Dispatcher::new(Arc::new(transport), datagrams), peer)
    }

    fn payload(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn small_payloads_use_exactly_one_datagram() {
        for len in [0, 1, 600, DATAGRAM_THRESHOLD] {
            let (dispatcher, peer) = fixture(Some(1400), true);
            let body = payload(len);
            let delivery = dispatcher
                .send(OutboundMessage::new(body.clone()))
                .await
                .expect("send");
            assert_eq!(delivery, Delivery::Datagram);
            assert_eq!(peer.calls(), vec![Call::SendDatagram(body)]);
        }
    }

    #[tokio::test]
    async fn large_payloads_open_write_and_finish_one_stream() {
        for len in [DATAGRAM_THRESHOLD + 1, 5000] {
            let (dispatcher, peer) = fixture(Some(1400), true);
            let body = payload(len);
            let delivery = dispatcher
                .send(OutboundMessage::new(body.clone()))
                .await
                .expect("send");
            assert_eq!(delivery, Delivery::Stream);
            assert_eq!(
                peer.calls(),
                vec![
                    Call::OpenStream { stream: 0 },
                    Call::Write {
                        stream: 0,
                        payload: body
                    },
                    Call::Finish { stream: 0 },
                ]
            );
        }
    }

    #[tokio::test]
    async fn disabled_datagrams_route_everything_through_streams() {
        let (dispatcher, peer) = fixture(Some(1400), false);
        let delivery = dispatcher
            .send(OutboundMessage::new(payload(10)))
            .await
            .expect("send");
        assert_eq!(delivery, Delivery::Stream);
        assert!(matches!(peer.calls()[0], Call::OpenStream { .. }));
    }

    #[tokio::test]
    async fn payloads_above_the_live_limit_are_rejected_without_sending() {
        let (dispatcher, peer) = fixture(Some(1000), true);
        let err = dispatcher
            .send(OutboundMessage::new(payload(1100)))
            .await
            .expect_err("over limit");
        assert_eq!(
            err,
            SessionError::DatagramTooLarge {
                size: 1100,
                limit: 1000
            }
        );
        assert!(peer.calls().is_empty());

        let (dispatcher, peer) = fixture(None, true);
        let err = dispatcher
            .send(OutboundMessage::new(payload(10)))
            .await
            .expect_err("no datagrams");
        assert_eq!(err, SessionError::DatagramsUnavailable);
        assert!(peer.calls().is_empty());
    }

    #[tokio::test]
    async fn transport_errors_surface_without_retry() {
        let (dispatcher, peer) = fixture(Some(1400), true);
        peer.break_connection(TransportError::fault("connection", "timed out"));
        let err = dispatcher
            .send(OutboundMessage::new(payload(10)))
            .await
            .expect_err("broken");
        assert_eq!(err.code(), "tunnel.session.transport_failed");
        assert!(peer.calls().is_empty());

        let err = dispatcher.send_stream(b"abc").await.expect_err("broken");
        assert!(matches!(err, SessionError::Transport(_)));
    }
}
