//! # 入站复用器（Inbound Multiplexer）
//!
//! ## 核心意图（Why）
//! - 两条独立调度的接收循环：数据报循环逐个交付完整数据报；流接受循环为每条被接受的流派生一个
//!   排空任务，按 2048 字节分块累积，直到对端结束该流后整体交付；
//! - 循环只负责“读到终止错误为止”，终止错误的分类与会话拆除由会话层完成。
//!
//! ## 契约（What）
//! - 每个入站单元恰好交付一次；
//! - 流读取遇到非结束类错误时丢弃已累积的部分数据，不做部分交付；
//! - 不同通道之间不保证相对顺序，不同流之间亦然；同一条流内按写入顺序拼接。

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::task::JoinSet;
use tracing::{trace, warn};

use crate::{
    diagnostics::{DiagnosticsWriter, TraceEvent},
    error::TransportError,
    host::HostCallbacks,
    transport::{InboundStream, TunnelTransport},
};

/// 流读取的单次分块大小。
pub const STREAM_CHUNK_SIZE: usize = 2048;

/// 入站循环共享的上下文。
pub(crate) struct Inbound<T> {
    transport: Arc<T>,
    host: Arc<dyn HostCallbacks>,
    trace: Option<Arc<DiagnosticsWriter>>,
}

impl<T> Clone for Inbound<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            host: Arc::clone(&self.host),
            trace: self.trace.clone(),
        }
    }
}

impl<T: TunnelTransport> Inbound<T> {
    pub(crate) fn new(
        transport: Arc<T>,
        host: Arc<dyn HostCallbacks>,
        trace: Option<Arc<DiagnosticsWriter>>,
    ) -> Self {
        Self {
            transport,
            host,
            trace,
        }
    }

    /// 数据报循环：交付每个数据报，直到传输返回错误；返回该终止错误。
    pub(crate) async fn receive_datagrams(self) -> TransportError {
        loop {
            match self.transport.read_datagram().await {
                Ok(payload) => {
                    trace!(len = payload.len(), "datagram received");
                    if let Some(writer) = &self.trace {
                        writer.record(TraceEvent::DatagramReceived {
                            length: payload.len(),
                        });
                    }
                    self.host.on_message_received(payload);
                }
                Err(error) => return error,
            }
        }
    }

    /// 流接受循环：为每条流派生排空任务，直到接受失败；返回该终止错误。
    ///
    /// 退出前等待仍在排空的流结束，连接关闭后它们的读取会随即失败。
    pub(crate) async fn accept_streams(self) -> TransportError {
        let mut drains = JoinSet::new();
        let error = loop {
            match self.transport.accept_stream().await {
                Ok(stream) => {
                    drains.spawn(deliver_stream(
                        stream,
                        Arc::clone(&self.host),
                        self.trace.clone(),
                    ));
                    while drains.try_join_next().is_some() {}
                }
                Err(error) => break error,
            }
        };
        while drains.join_next().await.is_some() {}
        error
    }
}

/// 排空失败：携带已丢弃的字节数。
#[derive(Debug)]
pub(crate) struct PartialStream {
    pub(crate) discarded: usize,
    pub(crate) error: TransportError,
}

/// 读取一条流直到结束，返回其完整内容。
pub(crate) async fn drain_stream<S: InboundStream>(mut stream: S) -> Result<Bytes, PartialStream> {
    let mut message = BytesMut::new();
    let mut chunk = vec![0_u8; STREAM_CHUNK_SIZE];
    loop {
        match stream.read_chunk(&mut chunk).await {
            Ok(Some(read)) => message.extend_from_slice(&chunk[..read]),
            Ok(None) => return Ok(message.freeze()),
            Err(error) => {
                return Err(PartialStream {
                    discarded: message.len(),
                    error,
                });
            }
        }
    }
}

async fn deliver_stream<S: InboundStream>(
    stream: S,
    host: Arc<dyn HostCallbacks>,
    trace: Option<Arc<DiagnosticsWriter>>,
) {
    match drain_stream(stream).await {
        Ok(message) => {
            trace!(len = message.len(), "stream message received");
            if let Some(writer) = &trace {
                writer.record(TraceEvent::StreamReceived {
                    length: message.len(),
                });
            }
            host.on_message_received(message);
        }
        Err(partial) => {
            warn!(
                discarded = partial.discarded,
                error = %partial.error,
                "stream aborted before end of data, discarding partial message"
            );
            if let Some(writer) = &trace {
                writer.record(TraceEvent::StreamDiscarded {
                    length: partial.discarded,
                    error: partial.error.to_string(),
                });
            }
        }
    }
}
