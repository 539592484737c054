use std::{
    ffi::{CString, c_char, c_void},
    fmt,
};

use bytes::Bytes;
use tracing::warn;
use tunnel_core::{CloseReason, HostCallbacks, Initiator};

/// 会话关闭类别，随 `on_session_closed` 回调传给宿主。
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunnelCloseKind {
    LocalStop = 0,
    PeerClose = 1,
    Fault = 2,
}

pub type MessageCallback = unsafe extern "C" fn(context: *mut c_void, data: *const u8, len: usize);
pub type QlogCallback = unsafe extern "C" fn(context: *mut c_void, filename: *const c_char);
pub type ClosedCallback =
    unsafe extern "C" fn(context: *mut c_void, kind: TunnelCloseKind, detail: *const c_char);

/// 宿主提供的回调表。
///
/// # 教案式注释
/// - **意图 (Why)**：宿主位于 C ABI 另一侧，以函数指针加不透明上下文的形式接收消息与通知；
/// - **契约 (What)**：
///   - `context` 原样传回每个回调，核心不解引用它；
///   - 回调可能在运行时的任意工作线程上并发触发，宿主需保证 `context` 可跨线程访问；
///   - 回调参数中的指针只在回调执行期间有效，宿主需要时自行复制；
///   - 未设置的回调（空指针）被忽略；
///   - 回调内可以调用 `tunnel_send_*`、`tunnel_stop` 与 `tunnel_free`；在回调内释放句柄时
///     `tunnel_free` 立即返回，会话在后台完成关闭，`on_session_closed` 仍会随后触发一次；
/// - **前置条件**：回调表在句柄释放前保持有效。
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TunnelHostVTable {
    pub context: *mut c_void,
    pub on_message_received: Option<MessageCallback>,
    pub on_qlog_filename_created: Option<QlogCallback>,
    pub on_session_closed: Option<ClosedCallback>,
}

impl fmt::Debug for TunnelHostVTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHostVTable")
            .field("context", &self.context)
            .field("on_message_received", &self.on_message_received.is_some())
            .field("on_qlog_filename_created", &self.on_qlog_filename_created.is_some())
            .field("on_session_closed", &self.on_session_closed.is_some())
            .finish()
    }
}

/// 把 C 回调表适配为 [`HostCallbacks`]。
#[derive(Debug)]
pub(crate) struct ForeignHost {
    vtable: TunnelHostVTable,
}

// SAFETY: 回调表的线程安全由宿主按 `TunnelHostVTable` 的契约保证；本类型只复制指针，
// 从不解引用 `context`。
unsafe impl Send for ForeignHost {}
// SAFETY: 同上，所有访问都是只读的指针复制。
unsafe impl Sync for ForeignHost {}

impl ForeignHost {
    pub(crate) fn new(vtable: TunnelHostVTable) -> Self {
        Self { vtable }
    }
}

impl HostCallbacks for ForeignHost {
    fn on_message_received(&self, payload: Bytes) {
        if let Some(callback) = self.vtable.on_message_received {
            // SAFETY: 指针与长度来自存活的 `Bytes`，回调返回前不会被释放。
            unsafe { callback(self.vtable.context, payload.as_ptr(), payload.len()) };
        }
    }

    fn on_qlog_filename_created(&self, filename: &str) {
        let Some(callback) = self.vtable.on_qlog_filename_created else {
            return;
        };
        match CString::new(filename) {
            // SAFETY: `name` 在回调返回前保持存活且以 NUL 结尾。
            Ok(name) => unsafe { callback(self.vtable.context, name.as_ptr()) },
            Err(err) => warn!(error = %err, "qlog filename is not representable as a C string"),
        }
    }

    fn on_session_closed(&self, reason: &CloseReason) {
        let Some(callback) = self.vtable.on_session_closed else {
            return;
        };
        let (kind, detail) = match reason {
            CloseReason::Cooperative {
                initiator: Initiator::Local,
            } => (TunnelCloseKind::LocalStop, String::new()),
            CloseReason::Cooperative {
                initiator: Initiator::Peer,
            } => (TunnelCloseKind::PeerClose, String::new()),
            CloseReason::Fault { detail } => (TunnelCloseKind::Fault, detail.replace('\0', " ")),
        };
        let detail = CString::new(detail).unwrap_or_default();
        // SAFETY: `detail` 在回调返回前保持存活且以 NUL 结尾。
        unsafe { callback(self.vtable.context, kind, detail.as_ptr()) };
    }
}
