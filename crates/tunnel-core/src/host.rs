use bytes::Bytes;

use crate::shutdown::CloseReason;

/// 宿主回调契约（核心 → 宿主）。
///
/// # 教案式说明
/// - **意图 (Why)**：宿主通常位于 FFI 另一侧，核心只通过这组回调把完整消息与诊断文件名交还给它；
/// - **契约 (What)**：
///   - `on_message_received`：每个入站单元（一个数据报，或一条流的全部内容）调用且仅调用一次；
///   - `on_qlog_filename_created`：每创建一个诊断文件调用一次，参数为 `<连接标识十六进制>.qlog`；
///   - `on_session_closed`：会话到达 `Closed` 时调用一次，默认空实现；
/// - **前置条件**：回调会在运行时工作线程上并发触发，实现方需自行保证线程安全且不得阻塞过久；
/// - **风险 (Trade-offs)**：回调内不应再同步等待同一会话的发送结果，否则可能占满工作线程。
pub trait HostCallbacks: Send + Sync + 'static {
    fn on_message_received(&self, payload: Bytes);

    fn on_qlog_filename_created(&self, filename: &str);

    fn on_session_closed(&self, _reason: &CloseReason) {}
}
