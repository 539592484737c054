//! 测试支撑：记录型宿主与内存传输替身。
//!
//! 仅在单元测试或启用 `test-util` 特性时编译；下游 crate 的集成测试复用 [`RecordingHost`]，
//! 核心自身的测试通过 [`MockTransport`] 观察每一次传输调用。

use std::{collections::VecDeque, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

use crate::{
    error::TransportError,
    host::HostCallbacks,
    shutdown::CloseReason,
    transport::{ConnectionId, InboundStream, OutboundStream, TunnelTransport},
};

/// 记录所有回调的宿主替身。
#[derive(Debug, Default)]
pub struct RecordingHost {
    messages: Mutex<Vec<Bytes>>,
    qlog_filenames: Mutex<Vec<String>>,
    closes: Mutex<Vec<CloseReason>>,
    changed: Notify,
}

impl RecordingHost {
    pub fn messages(&self) -> Vec<Bytes> {
        self.messages.lock().clone()
    }

    pub fn qlog_filenames(&self) -> Vec<String> {
        self.qlog_filenames.lock().clone()
    }

    pub fn closes(&self) -> Vec<CloseReason> {
        self.closes.lock().clone()
    }

    /// 等待至少 `count` 条消息到达，超时返回 `None`。
    pub async fn wait_for_messages(&self, count: usize, within: Duration) -> Option<Vec<Bytes>> {
        tokio::time::timeout(within, async {
            loop {
                let changed = self.changed.notified();
                {
                    let messages = self.messages.lock();
                    if messages.len() >= count {
                        return messages.clone();
                    }
                }
                changed.await;
            }
        })
        .await
        .ok()
    }
}

impl HostCallbacks for RecordingHost {
    fn on_message_received(&self, payload: Bytes) {
        self.messages.lock().push(payload);
        self.changed.notify_waiters();
    }

    fn on_qlog_filename_created(&self, filename: &str) {
        self.qlog_filenames.lock().push(filename.to_owned());
        self.changed.notify_waiters();
    }

    fn on_session_closed(&self, reason: &CloseReason) {
        self.closes.lock().push(reason.clone());
        self.changed.notify_waiters();
    }
}

/// 传输替身观察到的一次调用。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    SendDatagram(Bytes),
    OpenStream { stream: usize },
    Write { stream: usize, payload: Bytes },
    Finish { stream: usize },
    Close { code: u64, reason: Bytes },
}

#[derive(Debug)]
struct MockState {
    calls: Mutex<Vec<Call>>,
    next_stream: Mutex<usize>,
    max_datagram_size: Option<usize>,
    datagrams: AsyncMutex<mpsc::UnboundedReceiver<Result<Bytes, TransportError>>>,
    streams: AsyncMutex<mpsc::UnboundedReceiver<MockInbound>>,
    closed: Mutex<Option<TransportError>>,
    close_signal: Notify,
}

impl MockState {
    fn closed_error(&self) -> Option<TransportError> {
        self.closed.lock().clone()
    }

    fn shut(&self, error: TransportError) {
        let mut closed = self.closed.lock();
        if closed.is_none() {
            *closed = Some(error);
        }
        drop(closed);
        self.close_signal.notify_waiters();
    }

    async fn wait_closed(&self) -> TransportError {
        loop {
            let notified = self.close_signal.notified();
            if let Some(error) = self.closed_error() {
                return error;
            }
            notified.await;
        }
    }
}

/// 内存传输替身：本端调用被记录，入站数据由配对的 [`MockPeer`] 注入。
#[derive(Clone, Debug)]
pub struct MockTransport {
    id: ConnectionId,
    state: Arc<MockState>,
}

/// [`MockTransport`] 的“对端”控制柄。
#[derive(Clone, Debug)]
pub struct MockPeer {
    datagrams: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    streams: mpsc::UnboundedSender<MockInbound>,
    state: Arc<MockState>,
}

impl MockTransport {
    /// 创建替身与对端控制柄；`max_datagram_size` 为 `None` 时模拟未协商数据报。
    pub fn pair(id: ConnectionId, max_datagram_size: Option<usize>) -> (Self, MockPeer) {
        let (datagram_tx, datagram_rx) = mpsc::unbounded_channel();
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();
        let state = Arc::new(MockState {
            calls: Mutex::new(Vec::new()),
            next_stream: Mutex::new(0),
            max_datagram_size,
            datagrams: AsyncMutex::new(datagram_rx),
            streams: AsyncMutex::new(stream_rx),
            closed: Mutex::new(None),
            close_signal: Notify::new(),
        });
        let peer = MockPeer {
            datagrams: datagram_tx,
            streams: stream_tx,
            state: Arc::clone(&state),
        };
        (Self { id, state }, peer)
    }

    fn record(&self, call: Call) {
        self.state.calls.lock().push(call);
    }
}

impl MockPeer {
    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().clone()
    }

    pub fn send_datagram(&self, payload: impl Into<Bytes>) {
        let _ = self.datagrams.send(Ok(payload.into()));
    }

    /// 让本端的下一次 `read_datagram` 返回给定错误。
    pub fn fail_datagrams(&self, error: TransportError) {
        let _ = self.datagrams.send(Err(error));
    }

    /// 以若干分片投递一条流，分片结束即流结束。
    pub fn send_stream(&self, chunks: Vec<Bytes>) {
        let chunks = chunks.into_iter().map(Ok).collect();
        let _ = self.streams.send(MockInbound { chunks });
    }

    /// 投递一条在若干分片之后以错误中止的流。
    pub fn send_broken_stream(&self, chunks: Vec<Bytes>, error: TransportError) {
        let mut chunks: VecDeque<_> = chunks.into_iter().map(Ok).collect();
        chunks.push_back(Err(error));
        let _ = self.streams.send(MockInbound { chunks });
    }

    /// 对端以给定错误码与原因关闭连接。
    pub fn close(&self, code: u64, reason: &str) {
        self.state.shut(TransportError::ApplicationClosed {
            code,
            reason: reason.to_owned(),
        });
    }

    /// 连接以非关闭类错误中断。
    pub fn break_connection(&self, error: TransportError) {
        self.state.shut(error);
    }
}

impl TunnelTransport for MockTransport {
    type Outbound = MockOutbound;
    type Inbound = MockInbound;

    fn connection_id(&self) -> ConnectionId {
        self.id.clone()
    }

    fn max_datagram_size(&self) -> Option<usize> {
        self.state.max_datagram_size
    }

    fn send_datagram(&self, payload: Bytes) -> Result<(), TransportError> {
        if let Some(error) = self.state.closed_error() {
            return Err(error);
        }
        self.record(Call::SendDatagram(payload));
        Ok(())
    }

    fn open_stream(&self) -> BoxFuture<'_, Result<Self::Outbound, TransportError>> {
        Box::pin(async move {
            if let Some(error) = self.state.closed_error() {
                return Err(error);
            }
            let stream = {
                let mut next = self.state.next_stream.lock();
                let stream = *next;
                *next += 1;
                stream
            };
            self.record(Call::OpenStream { stream });
            Ok(MockOutbound {
                stream,
                state: Arc::clone(&self.state),
            })
        })
    }

    fn read_datagram(&self) -> BoxFuture<'_, Result<Bytes, TransportError>> {
        Box::pin(async move {
            let mut datagrams = self.state.datagrams.lock().await;
            tokio::select! {
                biased;
                error = self.state.wait_closed() => Err(error),
                next = datagrams.recv() => match next {
                    Some(result) => result,
                    None => Err(self.state.wait_closed().await),
                },
            }
        })
    }

    fn accept_stream(&self) -> BoxFuture<'_, Result<Self::Inbound, TransportError>> {
        Box::pin(async move {
            let mut streams = self.state.streams.lock().await;
            tokio::select! {
                biased;
                error = self.state.wait_closed() => Err(error),
                next = streams.recv() => match next {
                    Some(stream) => Ok(stream),
                    None => Err(self.state.wait_closed().await),
                },
            }
        })
    }

    fn close(&self, code: u64, reason: &[u8]) {
        self.record(Call::Close {
            code,
            reason: Bytes::copy_from_slice(reason),
        });
        self.state.shut(TransportError::LocallyClosed);
    }
}

/// 替身的发送流，写入与结束都记录为 [`Call`]。
#[derive(Debug)]
pub struct MockOutbound {
    stream: usize,
    state: Arc<MockState>,
}

impl OutboundStream for MockOutbound {
    fn write_all<'a>(&'a mut self, payload: &'a [u8]) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if let Some(error) = self.state.closed_error() {
                return Err(error);
            }
            self.state.calls.lock().push(Call::Write {
                stream: self.stream,
                payload: Bytes::copy_from_slice(payload),
            });
            Ok(())
        })
    }

    fn finish(&mut self) -> Result<(), TransportError> {
        self.state.calls.lock().push(Call::Finish {
            stream: self.stream,
        });
        Ok(())
    }
}

/// 替身的接收流：按调用方缓冲区大小切分预置分片。
#[derive(Debug)]
pub struct MockInbound {
    chunks: VecDeque<Result<Bytes, TransportError>>,
}

impl InboundStream for MockInbound {
    fn read_chunk<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<Option<usize>, TransportError>> {
        Box::pin(async move {
            match self.chunks.pop_front() {
                None => Ok(None),
                Some(Err(error)) => Err(error),
                Some(Ok(mut chunk)) => {
                    let len = chunk.len().min(buf.len());
                    buf[..len].copy_from_slice(&chunk[..len]);
                    let rest = chunk.split_off(len);
                    if !rest.is_empty() {
                        self.chunks.push_front(Ok(rest));
                    }
                    Ok(Some(len))
                }
            }
        })
    }
}
