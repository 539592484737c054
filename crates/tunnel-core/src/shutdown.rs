//! # 关闭协议（Shutdown Protocol）
//!
//! ## 核心意图（Why）
//! - 区分协作式关闭与传输故障，并让会话及其两条入站循环确定性地终止；
//! - 关闭后的发送必须得到可识别的 [`SessionError::Closed`]，而不是崩溃或静默丢弃。
//!
//! ## 状态机约束（What）
//! - 合法跃迁：`Running → Closing → Closed`，各状态可自环；
//! - `Running → Closing`：宿主调用 `stop`、对端发来协作关闭信号，或任一循环遇到传输故障；
//! - `Closing → Closed`：两条入站循环都已退出；
//! - 首个进入 `Closing` 的原因即最终 [`CloseReason`]，后续信号不会覆盖它。

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::SessionError;

/// 会话生命周期状态。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    /// 两条入站循环运行中，分发器接受发送。
    Running,
    /// 已发出或收到关闭信号，等待循环退出。
    Closing,
    /// 所有循环已退出，句柄失效。
    Closed,
}

impl SessionState {
    /// 判断状态是否允许跃迁至 `target`。
    pub fn can_transition_to(self, target: SessionState) -> bool {
        matches!(
            (self, target),
            (SessionState::Running, SessionState::Running)
                | (SessionState::Running, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closing)
                | (SessionState::Closing, SessionState::Closed)
                | (SessionState::Closed, SessionState::Closed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// 协作式关闭的发起方。
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Initiator {
    Local,
    Peer,
}

/// 会话终止原因。
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// 任一方以协作关闭信号结束会话。
    Cooperative { initiator: Initiator },
    /// 入站循环遇到无法识别的传输错误，会话被拆除。
    Fault { detail: String },
}

impl CloseReason {
    pub fn is_fault(&self) -> bool {
        matches!(self, CloseReason::Fault { .. })
    }
}

/// 关闭协议的共享状态，入站循环与宿主调用都会并发访问。
///
/// # 教案式注释
/// - **意图 (Why)**：以单把互斥锁串行化状态跃迁与“存活循环计数”，保证 `Closed` 恰好被宣告一次；
/// - **逻辑 (How)**：`begin_closing` 负责 `Running → Closing` 并记录首个原因；`loop_exited` 递减计数，
///   归零时跃迁到 `Closed` 并把原因交还调用方；`publish` 最后通过 `watch` 唤醒等待者；
/// - **契约 (What)**：`publish` 必须在宿主回调之后调用，等待者醒来时回调已完成。
#[derive(Debug)]
pub(crate) struct ShutdownProtocol {
    inner: Mutex<ProtocolState>,
    closed: watch::Sender<Option<CloseReason>>,
}

#[derive(Debug)]
struct ProtocolState {
    state: SessionState,
    reason: Option<CloseReason>,
    live_loops: usize,
}

impl ShutdownProtocol {
    pub(crate) fn new(live_loops: usize) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            inner: Mutex::new(ProtocolState {
                state: SessionState::Running,
                reason: None,
                live_loops,
            }),
            closed,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    pub(crate) fn ensure_running(&self) -> Result<(), SessionError> {
        match self.inner.lock().state {
            SessionState::Running => Ok(()),
            SessionState::Closing | SessionState::Closed => Err(SessionError::Closed),
        }
    }

    /// 尝试进入 `Closing`；仅当本次调用完成了跃迁时返回 `true`。
    pub(crate) fn begin_closing(&self, reason: CloseReason) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Running {
            return false;
        }
        debug_assert!(inner.state.can_transition_to(SessionState::Closing));
        inner.state = SessionState::Closing;
        inner.reason = Some(reason);
        true
    }

    /// 记录一条循环退出；最后一条退出时进入 `Closed` 并返回最终原因。
    pub(crate) fn loop_exited(&self) -> Option<CloseReason> {
        let mut inner = self.inner.lock();
        inner.live_loops = inner.live_loops.saturating_sub(1);
        if inner.live_loops > 0 || inner.state.is_terminal() {
            return None;
        }
        debug_assert!(inner.state.can_transition_to(SessionState::Closed));
        inner.state = SessionState::Closed;
        Some(inner.reason.clone().unwrap_or(CloseReason::Cooperative {
            initiator: Initiator::Local,
        }))
    }

    pub(crate) fn publish(&self, reason: CloseReason) {
        self.closed.send_replace(Some(reason));
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<CloseReason>> {
        self.closed.subscribe()
    }
}
