use tunnel_core::SessionError;

/// C ABI 返回的状态码。`0` 表示成功，负值表示失败类别。
#[repr(i32)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TunnelStatus {
    Ok = 0,
    /// 空指针、非 UTF-8 字符串或长度与指针不匹配。
    InvalidArgument = -1,
    /// 解析、绑定、握手等启动步骤失败。
    StartFailed = -2,
    /// 会话已停止或已关闭。
    SessionClosed = -3,
    DatagramTooLarge = -4,
    DatagramsUnavailable = -5,
    TransportFailed = -6,
    /// 无法创建运行时，或在不支持阻塞的线程上调用。
    RuntimeUnavailable = -7,
    ConfigInvalid = -8,
}

impl TunnelStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl From<&SessionError> for TunnelStatus {
    fn from(error: &SessionError) -> Self {
        match error {
            SessionError::Closed => TunnelStatus::SessionClosed,
            SessionError::DatagramTooLarge { .. } => TunnelStatus::DatagramTooLarge,
            SessionError::DatagramsUnavailable => TunnelStatus::DatagramsUnavailable,
            SessionError::Transport(_) => TunnelStatus::TransportFailed,
        }
    }
}

impl<T> From<Result<T, TunnelStatus>> for TunnelStatus {
    fn from(result: Result<T, TunnelStatus>) -> Self {
        match result {
            Ok(_) => TunnelStatus::Ok,
            Err(status) => status,
        }
    }
}
