//! # 会话句柄（Tunnel Session）
//!
//! ## 核心意图（Why）
//! - 一个会话持有一条已建立的连接与一个宿主回调句柄，把分发器、入站复用器、诊断写入器与关闭协议
//!   装配在一起；
//! - 句柄显式持有、可廉价克隆，由调用方决定生命周期，不依赖进程级单例。
//!
//! ## 运行模型（How）
//! - `spawn` 在当前 Tokio 运行时上派生两条入站循环（数据报循环与流接受循环），随即返回；
//! - 宿主的发送调用与入站循环并发执行，互不等待；
//! - 任一循环遇到终止错误时由会话分类：协作关闭安静退出，
//!   传输故障记录 `error` 并以错误码 `1` 关闭连接，以解除另一条循环的阻塞；
//! - 两条循环都退出后会话进入 `Closed`：写入诊断收尾事件、释放写入器、回调宿主，最后唤醒
//!   [`TunnelSession::closed`] 的等待者。
//!
//! ## 契约（What）
//! - `stop` 只在 `Running` 状态下生效一次，之后的 `stop` 与任何发送都返回 [`SessionError::Closed`]；
//! - `spawn` 必须在 Tokio 运行时上下文中调用。

use std::{fmt, sync::Arc};

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use crate::{
    diagnostics::{DiagnosticsFactory, DiagnosticsWriter, TraceEvent, Vantage},
    dispatcher::{Delivery, Dispatcher, OutboundMessage},
    error::{
        COOPERATIVE_CLOSE_CODE, COOPERATIVE_CLOSE_REASON, Disposition, FAULT_CLOSE_CODE,
        FAULT_CLOSE_REASON, SessionError, TransportError,
    },
    host::HostCallbacks,
    inbound::Inbound,
    shutdown::{CloseReason, Initiator, SessionState, ShutdownProtocol},
    transport::{ConnectionId, TunnelTransport},
};

/// 会话启动参数。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionOptions {
    /// 为 `false` 时 `send_datagram` 一律走可靠流。
    pub datagrams_enabled: bool,
    /// 诊断轨迹中记录的观察视角。
    pub vantage: Vantage,
}

impl SessionOptions {
    pub fn client() -> Self {
        Self {
            datagrams_enabled: true,
            vantage: Vantage::Client,
        }
    }

    pub fn server() -> Self {
        Self {
            datagrams_enabled: true,
            vantage: Vantage::Server,
        }
    }

    pub fn with_datagrams(mut self, enabled: bool) -> Self {
        self.datagrams_enabled = enabled;
        self
    }
}

/// 入站循环的标识，仅用于日志。
#[derive(Clone, Copy, Debug)]
enum InboundLoop {
    Datagrams,
    Streams,
}

impl fmt::Display for InboundLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InboundLoop::Datagrams => "datagrams",
            InboundLoop::Streams => "streams",
        })
    }
}

/// 一条隧道会话的句柄。
pub struct TunnelSession<T> {
    inner: Arc<SessionInner<T>>,
}

impl<T> Clone for TunnelSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for TunnelSession<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("connection_id", &self.inner.connection_id)
            .field("state", &self.inner.shutdown.state())
            .finish()
    }
}

struct SessionInner<T> {
    transport: Arc<T>,
    connection_id: ConnectionId,
    dispatcher: Dispatcher<T>,
    shutdown: ShutdownProtocol,
    host: Arc<dyn HostCallbacks>,
    diagnostics: Arc<DiagnosticsFactory>,
    trace: Option<Arc<DiagnosticsWriter>>,
}

impl<T: TunnelTransport> TunnelSession<T> {
    /// 接管一条已建立的连接并启动两条入站循环。
    ///
    /// 诊断文件创建失败不会阻止会话启动，仅记录 `warn`。
    pub fn spawn(
        transport: T,
        host: Arc<dyn HostCallbacks>,
        options: SessionOptions,
        diagnostics: Arc<DiagnosticsFactory>,
    ) -> Self {
        let transport = Arc::new(transport);
        let connection_id = transport.connection_id();
        let trace = match diagnostics.writer_for(&connection_id) {
            Ok(writer) => writer,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "diagnostics disabled for connection");
                None
            }
        };
        if let Some(writer) = &trace {
            writer.record(TraceEvent::ConnectionStarted {
                vantage: options.vantage,
            });
        }

        let inner = Arc::new(SessionInner {
            dispatcher: Dispatcher::new(Arc::clone(&transport), options.datagrams_enabled),
            transport: Arc::clone(&transport),
            connection_id: connection_id.clone(),
            shutdown: ShutdownProtocol::new(2),
            host: Arc::clone(&host),
            diagnostics,
            trace: trace.clone(),
        });

        let inbound = Inbound::new(transport, host, trace);
        let datagrams = inbound.clone();
        let session = Arc::clone(&inner);
        tokio::spawn(async move {
            let error = datagrams.receive_datagrams().await;
            session.loop_terminated(InboundLoop::Datagrams, error);
        });
        let session = Arc::clone(&inner);
        tokio::spawn(async move {
            let error = inbound.accept_streams().await;
            session.loop_terminated(InboundLoop::Streams, error);
        });

        info!(
            connection_id = %connection_id,
            datagrams = options.datagrams_enabled,
            "tunnel session started"
        );
        Self { inner }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.inner.connection_id
    }

    /// 连接当前允许的单个数据报上限；`None` 表示数据报不可用。
    pub fn max_datagram_size(&self) -> Option<usize> {
        self.inner.transport.max_datagram_size()
    }

    pub fn state(&self) -> SessionState {
        self.inner.shutdown.state()
    }

    /// 强制走可靠流发送一条消息。
    pub async fn send_stream(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.inner.shutdown.ensure_running()?;
        self.inner
            .dispatcher
            .send_stream(payload)
            .await
            .map_err(|err| self.inner.settle(err))?;
        self.inner.record(TraceEvent::StreamSent {
            length: payload.len(),
        });
        Ok(())
    }

    /// 按大小策略发送一条消息，返回实际采用的通道。
    pub async fn send_datagram(&self, payload: Bytes) -> Result<Delivery, SessionError> {
        self.inner.shutdown.ensure_running()?;
        let length = payload.len();
        let delivery = self
            .inner
            .dispatcher
            .send(OutboundMessage::new(payload))
            .await
            .map_err(|err| self.inner.settle(err))?;
        self.inner.record(match delivery {
            Delivery::Datagram => TraceEvent::DatagramSent { length },
            Delivery::Stream => TraceEvent::StreamSent { length },
        });
        Ok(delivery)
    }

    /// 发起协作式关闭。
    ///
    /// 以错误码 `0` 与原因 `"normal shutdown"` 关闭连接，阻塞中的入站调用随之返回；
    /// 会话已不在 `Running` 时返回 [`SessionError::Closed`]。
    pub fn stop(&self) -> Result<(), SessionError> {
        let reason = CloseReason::Cooperative {
            initiator: Initiator::Local,
        };
        if !self.inner.shutdown.begin_closing(reason) {
            return Err(SessionError::Closed);
        }
        info!(connection_id = %self.inner.connection_id, "stopping tunnel session");
        self.inner
            .transport
            .close(COOPERATIVE_CLOSE_CODE, COOPERATIVE_CLOSE_REASON.as_bytes());
        Ok(())
    }

    /// 等待会话进入 `Closed` 并返回最终原因。
    pub async fn closed(&self) -> CloseReason {
        let mut closed = self.inner.shutdown.subscribe();
        let reason = closed
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|reason| reason.clone());
        reason.unwrap_or(CloseReason::Cooperative {
            initiator: Initiator::Local,
        })
    }
}

impl<T: TunnelTransport> SessionInner<T> {
    fn record(&self, event: TraceEvent) {
        if let Some(writer) = &self.trace {
            writer.record(event);
        }
    }

    /// 发送途中会话已开始关闭时，统一报告为 `Closed`。
    fn settle(&self, error: SessionError) -> SessionError {
        if self.shutdown.state() == SessionState::Running {
            error
        } else {
            SessionError::Closed
        }
    }

    fn loop_terminated(&self, which: InboundLoop, error: TransportError) {
        match error.disposition() {
            Disposition::CooperativeClose => {
                let initiator = match error {
                    TransportError::LocallyClosed => Initiator::Local,
                    _ => Initiator::Peer,
                };
                if self
                    .shutdown
                    .begin_closing(CloseReason::Cooperative { initiator })
                {
                    info!(
                        connection_id = %self.connection_id,
                        inbound = %which,
                        "cooperative close observed"
                    );
                }
                debug!(connection_id = %self.connection_id, inbound = %which, "inbound loop exited");
            }
            Disposition::Fault => {
                let reason = CloseReason::Fault {
                    detail: error.to_string(),
                };
                if self.shutdown.begin_closing(reason) {
                    error!(
                        connection_id = %self.connection_id,
                        inbound = %which,
                        error = %error,
                        "transport fault, tearing down session"
                    );
                    self.transport
                        .close(FAULT_CLOSE_CODE, FAULT_CLOSE_REASON.as_bytes());
                } else {
                    debug!(
                        connection_id = %self.connection_id,
                        inbound = %which,
                        error = %error,
                        "inbound loop failed while closing"
                    );
                }
            }
        }

        if let Some(reason) = self.shutdown.loop_exited() {
            self.finish(reason);
        }
    }

    fn finish(&self, reason: CloseReason) {
        let (code, detail) = match &reason {
            CloseReason::Cooperative { .. } => {
                (COOPERATIVE_CLOSE_CODE, COOPERATIVE_CLOSE_REASON.to_owned())
            }
            CloseReason::Fault { detail } => (FAULT_CLOSE_CODE, detail.clone()),
        };
        self.record(TraceEvent::ConnectionClosed {
            code,
            reason: detail,
        });
        self.diagnostics.release(&self.connection_id);
        self.host.on_session_closed(&reason);
        info!(connection_id = %self.connection_id, reason = ?reason, "tunnel session closed");
        self.shutdown.publish(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tracing_test::traced_test;

    use super::*;
    use crate::testing::{Call, MockPeer, MockTransport, RecordingHost};

    const WAIT: Duration = Duration::from_secs(5);

    fn start(
        limit: Option<usize>,
        options: SessionOptions,
    ) -> (TunnelSession<MockTransport>, MockPeer, Arc<RecordingHost>) {
        let (transport, peer) = MockTransport::pair(ConnectionId::from(7_u64), limit);
        let host = Arc::new(RecordingHost::default());
        let diagnostics = Arc::new(DiagnosticsFactory::disabled(options.vantage, host.clone()));
        let session = TunnelSession::spawn(transport, host.clone(), options, diagnostics);
        (session, peer, host)
    }

    async fn closed_within(session: &TunnelSession<MockTransport>) -> CloseReason {
        tokio::time::timeout(WAIT, session.closed())
            .await
            .expect("session did not close in time")
    }

    fn close_calls(peer: &MockPeer) -> Vec<Call> {
        peer.calls()
            .into_iter()
            .filter(|call| matches!(call, Call::Close { .. }))
            .collect()
    }

    #[tokio::test]
    async fn inbound_datagrams_and_streams_reach_the_host() {
        let (session, peer, host) = start(Some(1200), SessionOptions::client());
        let body: Vec<u8> = (0..5000).map(|i| (i % 241) as u8).collect();

        peer.send_datagram(Bytes::from_static(b"hello"));
        peer.send_stream(vec![
            Bytes::copy_from_slice(&body[..1000]),
            Bytes::copy_from_slice(&body[1000..]),
        ]);

        let mut messages = host.wait_for_messages(2, WAIT).await.expect("two messages");
        messages.sort_by_key(|message| message.len());
        assert_eq!(messages[0].as_ref(), b"hello");
        assert_eq!(messages[1].as_ref(), body.as_slice());
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn back_to_back_streams_keep_their_boundaries() {
        let (_session, peer, host) = start(Some(1200), SessionOptions::server());
        peer.send_stream(vec![Bytes::from_static(b"first")]);
        peer.send_stream(vec![Bytes::from_static(b"second")]);

        let mut messages = host.wait_for_messages(2, WAIT).await.expect("two messages");
        messages.sort();
        assert_eq!(
            messages,
            vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
        );
    }

    #[tokio::test]
    async fn broken_streams_are_discarded_without_tearing_down() {
        let (session, peer, host) = start(Some(1200), SessionOptions::client());
        peer.send_broken_stream(
            vec![Bytes::from_static(b"partial")],
            TransportError::StreamReset { code: 3 },
        );
        peer.send_stream(vec![Bytes::from_static(b"complete")]);

        let messages = host.wait_for_messages(1, WAIT).await.expect("one message");
        assert_eq!(messages, vec![Bytes::from_static(b"complete")]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(host.messages().len(), 1);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn outbound_sends_follow_the_size_policy() {
        let (session, peer, _host) = start(Some(1200), SessionOptions::client());
        let delivery = session
            .send_datagram(Bytes::from_static(b"ping"))
            .await
            .expect("datagram");
        assert_eq!(delivery, Delivery::Datagram);
        let delivery = session
            .send_datagram(Bytes::from(vec![1_u8; 1201]))
            .await
            .expect("stream fallback");
        assert_eq!(delivery, Delivery::Stream);
        session.send_stream(b"").await.expect("empty stream");

        let calls = peer.calls();
        assert_eq!(calls[0], Call::SendDatagram(Bytes::from_static(b"ping")));
        assert_eq!(
            calls
                .iter()
                .filter(|call| matches!(call, Call::Finish { .. }))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn disabled_datagrams_fall_back_to_streams() {
        let (session, peer, _host) =
            start(Some(1200), SessionOptions::client().with_datagrams(false));
        let delivery = session
            .send_datagram(Bytes::from_static(b"ping"))
            .await
            .expect("send");
        assert_eq!(delivery, Delivery::Stream);
        assert!(
            !peer
                .calls()
                .iter()
                .any(|call| matches!(call, Call::SendDatagram(_)))
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn local_stop_closes_cooperatively_and_rejects_sends() {
        let (session, peer, host) = start(Some(1200), SessionOptions::client());
        session.stop().expect("first stop");
        assert!(logs_contain("stopping tunnel session"));

        assert_eq!(
            close_calls(&peer),
            vec![Call::Close {
                code: 0,
                reason: Bytes::from_static(b"normal shutdown")
            }]
        );
        assert_eq!(session.stop(), Err(SessionError::Closed));
        assert_eq!(
            session.send_datagram(Bytes::from_static(b"late")).await,
            Err(SessionError::Closed)
        );
        assert_eq!(session.send_stream(b"late").await, Err(SessionError::Closed));

        let reason = closed_within(&session).await;
        assert_eq!(
            reason,
            CloseReason::Cooperative {
                initiator: Initiator::Local
            }
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(host.closes(), vec![reason]);
    }

    #[tokio::test]
    async fn peer_cooperative_close_ends_both_loops_quietly() {
        let (session, peer, host) = start(Some(1200), SessionOptions::server());
        peer.close(0, "normal shutdown");

        let reason = closed_within(&session).await;
        assert_eq!(
            reason,
            CloseReason::Cooperative {
                initiator: Initiator::Peer
            }
        );
        assert!(close_calls(&peer).is_empty());
        assert_eq!(host.closes().len(), 1);
        assert_eq!(
            session.send_stream(b"late").await,
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn transport_fault_tears_down_the_session_once() {
        let (session, peer, host) = start(Some(1200), SessionOptions::client());
        peer.break_connection(TransportError::fault("connection", "timed out"));

        let reason = closed_within(&session).await;
        assert!(reason.is_fault());
        assert_eq!(
            close_calls(&peer),
            vec![Call::Close {
                code: 1,
                reason: Bytes::from_static(b"transport fault")
            }]
        );
        assert_eq!(host.closes(), vec![reason]);
        assert_eq!(
            session.send_datagram(Bytes::from_static(b"late")).await,
            Err(SessionError::Closed)
        );
    }

    #[tokio::test]
    async fn datagram_fault_closes_the_transport_and_unblocks_the_stream_loop() {
        let (session, peer, host) = start(Some(1200), SessionOptions::client());
        peer.send_stream(vec![Bytes::from_static(b"before")]);
        host.wait_for_messages(1, WAIT).await.expect("stream delivered");

        peer.fail_datagrams(TransportError::fault("read_datagram", "decrypt failed"));

        let reason = closed_within(&session).await;
        assert_eq!(
            reason,
            CloseReason::Fault {
                detail: "read_datagram: decrypt failed".to_owned()
            }
        );
        assert_eq!(
            close_calls(&peer),
            vec![Call::Close {
                code: 1,
                reason: Bytes::from_static(b"transport fault")
            }]
        );
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(host.closes(), vec![reason]);
    }

    #[tokio::test]
    async fn application_close_with_other_code_is_a_fault() {
        let (session, peer, _host) = start(Some(1200), SessionOptions::client());
        peer.close(7, "normal shutdown");

        let reason = closed_within(&session).await;
        assert!(reason.is_fault());
        assert_eq!(close_calls(&peer).len(), 1);
    }

    #[tokio::test]
    async fn diagnostics_file_is_announced_and_finalised() {
        let scratch = tempfile::tempdir().expect("temp dir");
        let dir = scratch.path().join("traces");

        let (transport, peer) = MockTransport::pair(ConnectionId::from(7_u64), Some(1200));
        let host = Arc::new(RecordingHost::default());
        let diagnostics = Arc::new(DiagnosticsFactory::new(
            Some(dir.clone()),
            Vantage::Client,
            host.clone(),
        ));
        let session =
            TunnelSession::spawn(transport, host.clone(), SessionOptions::client(), diagnostics);
        assert_eq!(host.qlog_filenames(), vec!["0000000000000007.qlog".to_owned()]);

        session.send_datagram(Bytes::from_static(b"x")).await.expect("send");
        session.stop().expect("stop");
        closed_within(&session).await;
        drop(peer);

        let contents =
            std::fs::read_to_string(dir.join("0000000000000007.qlog")).expect("trace file");
        assert!(contents.contains("connectivity:connection_started"));
        assert!(contents.contains("transport:datagram_sent"));
        assert!(contents.contains("connectivity:connection_closed"));
    }
}
