//! # 诊断写入器工厂（Diagnostics Writer Factory）
//!
//! ## 角色定位（Why）
//! - 为每条连接按需生成一个诊断文件（qlog 风格的 JSON-SEQ 轨迹），并把文件名告知宿主；
//! - 目录为空即视为禁用，工厂退化为空操作。
//!
//! ## 行为契约（What）
//! - 首次引用某个连接标识时才创建目录与文件，文件名为 `<连接标识十六进制>.qlog`；
//! - 同一连接标识只会创建一次文件、只触发一次 `on_qlog_filename_created`；
//! - 目录或文件创建失败返回 [`DiagnosticsError`]，调用方记录后继续运行（非致命降级）；
//! - 会话运行期间写入失败仅记录 `warn` 并停用该写入器。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` 分片锁在创建文件期间被持有，避免同一连接的并发首次引用各自建文件；
//! - 宿主回调在释放分片锁之后触发，回调内部再次查询工厂不会死锁。

use std::{
    fs::{self, File},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use dashmap::{DashMap, mapref::entry::Entry};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::{error::DiagnosticsError, host::HostCallbacks, transport::ConnectionId};

const QLOG_VERSION: &str = "0.3";
const QLOG_FORMAT: &str = "JSON-SEQ";
const TRACE_TITLE: &str = "quic-tunnel";
/// JSON-SEQ 记录分隔符（RFC 7464）。
const RECORD_SEPARATOR: u8 = 0x1e;

/// 诊断轨迹的观察视角。
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Vantage {
    Client,
    Server,
}

/// 诊断轨迹中的一条事件。
#[derive(Clone, Debug, Serialize)]
#[serde(untagged)]
pub enum TraceEvent {
    ConnectionStarted { vantage: Vantage },
    DatagramSent { length: usize },
    DatagramReceived { length: usize },
    StreamSent { length: usize },
    StreamReceived { length: usize },
    StreamDiscarded { length: usize, error: String },
    ConnectionClosed { code: u64, reason: String },
}

impl TraceEvent {
    fn name(&self) -> &'static str {
        match self {
            TraceEvent::ConnectionStarted { .. } => "connectivity:connection_started",
            TraceEvent::DatagramSent { .. } => "transport:datagram_sent",
            TraceEvent::DatagramReceived { .. } => "transport:datagram_received",
            TraceEvent::StreamSent { .. } => "transport:stream_sent",
            TraceEvent::StreamReceived { .. } => "transport:stream_received",
            TraceEvent::StreamDiscarded { .. } => "transport:stream_discarded",
            TraceEvent::ConnectionClosed { .. } => "connectivity:connection_closed",
        }
    }
}

#[derive(Serialize)]
struct TraceHeader<'a> {
    qlog_version: &'static str,
    qlog_format: &'static str,
    title: &'static str,
    trace: TraceDescriptor<'a>,
}

#[derive(Serialize)]
struct TraceDescriptor<'a> {
    vantage_point: VantagePoint,
    common_fields: CommonFields<'a>,
}

#[derive(Serialize)]
struct VantagePoint {
    #[serde(rename = "type")]
    kind: Vantage,
}

#[derive(Serialize)]
struct CommonFields<'a> {
    group_id: &'a str,
    time_format: &'static str,
}

#[derive(Serialize)]
struct TraceRecord<'a> {
    time: f64,
    name: &'static str,
    data: &'a TraceEvent,
}

/// 单条连接的诊断输出。
#[derive(Debug)]
pub struct DiagnosticsWriter {
    path: PathBuf,
    file_name: String,
    started: Instant,
    sink: Mutex<Option<BufWriter<File>>>,
}

impl DiagnosticsWriter {
    fn create(
        dir: &Path,
        vantage: Vantage,
        connection_id: &ConnectionId,
    ) -> Result<Self, DiagnosticsError> {
        let group_id = connection_id.to_hex();
        let file_name = format!("{group_id}.qlog");
        let path = dir.join(&file_name);
        let file = File::create(&path).map_err(|source| DiagnosticsError::CreateFile {
            path: path.clone(),
            source,
        })?;

        let writer = Self {
            path,
            file_name,
            started: Instant::now(),
            sink: Mutex::new(Some(BufWriter::new(file))),
        };
        writer.write_record(&TraceHeader {
            qlog_version: QLOG_VERSION,
            qlog_format: QLOG_FORMAT,
            title: TRACE_TITLE,
            trace: TraceDescriptor {
                vantage_point: VantagePoint { kind: vantage },
                common_fields: CommonFields {
                    group_id: &group_id,
                    time_format: "relative",
                },
            },
        });
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// 追加一条带相对时间戳（毫秒）的事件。
    pub fn record(&self, event: TraceEvent) {
        let time = self.started.elapsed().as_secs_f64() * 1000.0;
        self.write_record(&TraceRecord {
            time,
            name: event.name(),
            data: &event,
        });
    }

    /// 刷新并关闭底层文件，之后的 `record` 成为空操作。
    pub fn close(&self) {
        if let Some(mut sink) = self.sink.lock().take()
            && let Err(err) = sink.flush()
        {
            warn!(path = %self.path.display(), error = %err, "failed to flush diagnostics file");
        }
    }

    fn write_record<T: Serialize>(&self, record: &T) {
        let mut guard = self.sink.lock();
        let Some(sink) = guard.as_mut() else {
            return;
        };
        if let Err(err) = append_record(sink, record) {
            warn!(
                path = %self.path.display(),
                error = %err,
                "diagnostics write failed, disabling writer"
            );
            *guard = None;
        }
    }
}

fn append_record<T: Serialize>(sink: &mut BufWriter<File>, record: &T) -> io::Result<()> {
    sink.write_all(&[RECORD_SEPARATOR])?;
    serde_json::to_writer(&mut *sink, record)?;
    sink.write_all(b"\n")
}

/// 按连接标识惰性创建 [`DiagnosticsWriter`] 的工厂。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 让每条连接拥有独立的诊断文件，同时避免在诊断被禁用时产生任何文件系统副作用；
///
/// ## 契约（What）
/// - `new(None | Some(""))` 返回空操作工厂，`writer_for` 恒返回 `Ok(None)`，不触发回调；
/// - `writer_for`：首次调用时创建目录（若缺失）与文件，并通知宿主文件名；重复调用返回同一写入器；
/// - `release`：关闭并移除写入器，连接结束时调用。
pub struct DiagnosticsFactory {
    dir: Option<PathBuf>,
    vantage: Vantage,
    host: Arc<dyn HostCallbacks>,
    writers: DashMap<ConnectionId, Arc<DiagnosticsWriter>>,
}

impl DiagnosticsFactory {
    pub fn new(dir: Option<PathBuf>, vantage: Vantage, host: Arc<dyn HostCallbacks>) -> Self {
        let dir = dir.filter(|path| !path.as_os_str().is_empty());
        Self {
            dir,
            vantage,
            host,
            writers: DashMap::new(),
        }
    }

    /// 空操作工厂。
    pub fn disabled(vantage: Vantage, host: Arc<dyn HostCallbacks>) -> Self {
        Self::new(None, vantage, host)
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn writer_for(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<Arc<DiagnosticsWriter>>, DiagnosticsError> {
        let Some(dir) = self.dir.as_deref() else {
            return Ok(None);
        };

        let writer = match self.writers.entry(connection_id.clone()) {
            Entry::Occupied(existing) => return Ok(Some(Arc::clone(existing.get()))),
            Entry::Vacant(vacant) => {
                ensure_directory(dir)?;
                let writer = Arc::new(DiagnosticsWriter::create(
                    dir,
                    self.vantage,
                    connection_id,
                )?);
                vacant.insert(Arc::clone(&writer));
                writer
            }
        };

        debug!(path = %writer.path().display(), "created diagnostics file");
        self.host.on_qlog_filename_created(writer.file_name());
        Ok(Some(writer))
    }

    pub fn release(&self, connection_id: &ConnectionId) {
        if let Some((_, writer)) = self.writers.remove(connection_id) {
            writer.close();
        }
    }
}

fn ensure_directory(dir: &Path) -> Result<(), DiagnosticsError> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|source| DiagnosticsError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingHost;

    #[test]
    fn creates_one_file_per_connection_and_notifies_once() {
        let host = Arc::new(RecordingHost::default());
        let scratch = tempfile::tempdir().expect("temp dir");
        let dir = scratch.path().join("nested");
        let factory = DiagnosticsFactory::new(Some(dir.clone()), Vantage::Server, host.clone());
        let id = ConnectionId::from(0xabcd_u64);

        let first = factory.writer_for(&id).expect("writer").expect("enabled");
        let second = factory.writer_for(&id).expect("writer").expect("enabled");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(host.qlog_filenames(), vec!["000000000000abcd.qlog".to_owned()]);

        first.record(TraceEvent::DatagramSent { length: 12 });
        factory.release(&id);

        let contents = fs::read_to_string(dir.join("000000000000abcd.qlog")).expect("read");
        let records: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line.trim_start_matches('\u{1e}')).expect("json"))
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["qlog_format"], "JSON-SEQ");
        assert_eq!(records[0]["trace"]["vantage_point"]["type"], "server");
        assert_eq!(records[1]["name"], "transport:datagram_sent");
        assert_eq!(records[1]["data"]["length"], 12);
    }

    #[test]
    fn empty_directory_disables_diagnostics() {
        let host = Arc::new(RecordingHost::default());
        let factory = DiagnosticsFactory::new(Some(PathBuf::new()), Vantage::Client, host.clone());
        assert!(!factory.is_enabled());
        let writer = factory
            .writer_for(&ConnectionId::from(1_u64))
            .expect("no-op factory never fails");
        assert!(writer.is_none());
        assert!(host.qlog_filenames().is_empty());
    }

    #[test]
    fn unwritable_directory_is_reported() {
        let host = Arc::new(RecordingHost::default());
        let blocker = tempfile::NamedTempFile::new().expect("blocker file");

        let factory = DiagnosticsFactory::new(Some(blocker.path().join("qlog")), Vantage::Client, host.clone());
        let err = factory
            .writer_for(&ConnectionId::from(2_u64))
            .expect_err("directory creation must fail");
        assert!(matches!(err, DiagnosticsError::CreateDir { .. }));
        assert!(host.qlog_filenames().is_empty());
    }
}
