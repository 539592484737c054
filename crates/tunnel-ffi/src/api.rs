//! C ABI 函数。
//!
//! 所有函数返回 [`TunnelStatus`] 的整数值（`0` 为成功），从不跨越边界展开 panic；
//! 字符串参数为 NUL 结尾的 UTF-8，负载参数为指针加长度。

use std::{
    ffi::{CStr, CString, c_char},
    path::{Path, PathBuf},
    ptr, slice,
    sync::Arc,
};

use bytes::Bytes;
use tracing::{error, warn};
use tunnel_core::{
    TunnelClientConfig, TunnelServerConfig,
    config::{DEFAULT_CLIENT_QLOG_DIR, DEFAULT_SERVER_QLOG_DIR},
};
use tunnel_transport_quic::capabilities;

use crate::{
    handle::TunnelHandle,
    host::{ForeignHost, TunnelHostVTable},
    logging,
    status::TunnelStatus,
};

/// 以远端地址启动隧道入口，握手完成后返回。
///
/// `qlog_dir` 为空指针时使用 `tunnel-in-logs`，为空字符串时禁用诊断。
///
/// # Safety
/// `address` 必须是有效的 C 字符串；`qlog_dir` 为空指针或有效 C 字符串；
/// `out` 指向可写的句柄指针槽位。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_client_start(
    address: *const c_char,
    enable_datagrams: bool,
    qlog_dir: *const c_char,
    host: TunnelHostVTable,
    out: *mut *mut TunnelHandle,
) -> i32 {
    let result = (|| {
        let mut config = TunnelClientConfig::new(unsafe { read_str(address) }?);
        config.tunnel.enable_datagrams = enable_datagrams;
        config.tunnel.qlog_dir = Some(unsafe { read_qlog_dir(qlog_dir, DEFAULT_CLIENT_QLOG_DIR) }?);
        TunnelHandle::client(config, Arc::new(ForeignHost::new(host)))
    })();
    unsafe { publish(result, out) }
}

/// 绑定地址并接受恰好一条连接后返回。
///
/// `qlog_dir` 为空指针时使用 `tunnel-out-logs`，为空字符串时禁用诊断。
///
/// # Safety
/// 同 [`tunnel_client_start`]。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_server_start(
    bind_address: *const c_char,
    enable_datagrams: bool,
    qlog_dir: *const c_char,
    host: TunnelHostVTable,
    out: *mut *mut TunnelHandle,
) -> i32 {
    let result = (|| {
        let mut config = TunnelServerConfig::new(unsafe { read_str(bind_address) }?);
        config.tunnel.enable_datagrams = enable_datagrams;
        config.tunnel.qlog_dir = Some(unsafe { read_qlog_dir(qlog_dir, DEFAULT_SERVER_QLOG_DIR) }?);
        TunnelHandle::server(config, Arc::new(ForeignHost::new(host)))
    })();
    unsafe { publish(result, out) }
}

/// 以 TOML 配置文件启动隧道入口。
///
/// # Safety
/// `config_path` 必须是有效的 C 字符串；`out` 指向可写的句柄指针槽位。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_client_start_with_config(
    config_path: *const c_char,
    host: TunnelHostVTable,
    out: *mut *mut TunnelHandle,
) -> i32 {
    let result = (|| {
        let path = unsafe { read_str(config_path) }?;
        let config = TunnelClientConfig::from_path(Path::new(&path)).map_err(|err| {
            error!(path = %path, error = %err, "invalid client configuration");
            TunnelStatus::ConfigInvalid
        })?;
        TunnelHandle::client(config, Arc::new(ForeignHost::new(host)))
    })();
    unsafe { publish(result, out) }
}

/// 以 TOML 配置文件启动隧道出口。
///
/// # Safety
/// 同 [`tunnel_client_start_with_config`]。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_server_start_with_config(
    config_path: *const c_char,
    host: TunnelHostVTable,
    out: *mut *mut TunnelHandle,
) -> i32 {
    let result = (|| {
        let path = unsafe { read_str(config_path) }?;
        let config = TunnelServerConfig::from_path(Path::new(&path)).map_err(|err| {
            error!(path = %path, error = %err, "invalid server configuration");
            TunnelStatus::ConfigInvalid
        })?;
        TunnelHandle::server(config, Arc::new(ForeignHost::new(host)))
    })();
    unsafe { publish(result, out) }
}

/// 发起协作式关闭。之后的发送返回 `SessionClosed`。
///
/// # Safety
/// `handle` 必须是 `tunnel_*_start` 返回且尚未释放的句柄。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_stop(handle: *const TunnelHandle) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return TunnelStatus::InvalidArgument.code();
    };
    TunnelStatus::from(handle.stop()).code()
}

/// 强制走可靠流发送一条消息。
///
/// # Safety
/// `handle` 同 [`tunnel_stop`]；`data` 指向至少 `len` 个可读字节，`len` 为 `0` 时可为空指针。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_send_stream(
    handle: *const TunnelHandle,
    data: *const u8,
    len: usize,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return TunnelStatus::InvalidArgument.code();
    };
    let result = unsafe { read_payload(data, len) }.and_then(|payload| handle.send_stream(payload));
    TunnelStatus::from(result).code()
}

/// 按大小策略发送一条消息（`<= 1200` 字节走数据报）。
///
/// # Safety
/// 同 [`tunnel_send_stream`]。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_send_datagram(
    handle: *const TunnelHandle,
    data: *const u8,
    len: usize,
) -> i32 {
    let Some(handle) = (unsafe { handle.as_ref() }) else {
        return TunnelStatus::InvalidArgument.code();
    };
    let result = unsafe { read_payload(data, len) }
        .and_then(|payload| handle.send_datagram(Bytes::copy_from_slice(payload)));
    TunnelStatus::from(result).code()
}

/// 关闭会话并释放句柄。空指针为空操作。
///
/// 在普通线程上调用时等待会话关闭完成；在回调内调用时只发出关闭信号并立即返回。
///
/// # Safety
/// `handle` 必须是 `tunnel_*_start` 返回的句柄，且之后不再使用。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_free(handle: *mut TunnelHandle) {
    if handle.is_null() {
        return;
    }
    let handle = unsafe { Box::from_raw(handle) };
    handle.shutdown();
}

/// 返回能力描述 JSON，调用方以 [`tunnel_string_free`] 释放；失败时返回空指针。
#[unsafe(no_mangle)]
pub extern "C" fn tunnel_capabilities_json() -> *mut c_char {
    let json = match capabilities().to_json() {
        Ok(json) => json,
        Err(err) => {
            error!(error = %err, "failed to encode capabilities");
            return ptr::null_mut();
        }
    };
    CString::new(json).map_or(ptr::null_mut(), CString::into_raw)
}

/// 释放本库返回的字符串。空指针为空操作。
///
/// # Safety
/// `value` 必须来自本库且只释放一次。
#[unsafe(no_mangle)]
pub unsafe extern "C" fn tunnel_string_free(value: *mut c_char) {
    if !value.is_null() {
        drop(unsafe { CString::from_raw(value) });
    }
}

/// 安装进程级日志订阅器（`RUST_LOG`，缺省 `info`）。重复调用无副作用。
#[unsafe(no_mangle)]
pub extern "C" fn tunnel_init_logging() -> i32 {
    if !logging::init_logging() {
        warn!("a global tracing subscriber is already installed");
    }
    TunnelStatus::Ok.code()
}

unsafe fn read_str(value: *const c_char) -> Result<String, TunnelStatus> {
    if value.is_null() {
        return Err(TunnelStatus::InvalidArgument);
    }
    unsafe { CStr::from_ptr(value) }
        .to_str()
        .map(str::to_owned)
        .map_err(|_| TunnelStatus::InvalidArgument)
}

unsafe fn read_qlog_dir(value: *const c_char, default: &str) -> Result<PathBuf, TunnelStatus> {
    if value.is_null() {
        return Ok(PathBuf::from(default));
    }
    unsafe { read_str(value) }.map(PathBuf::from)
}

unsafe fn read_payload<'a>(data: *const u8, len: usize) -> Result<&'a [u8], TunnelStatus> {
    match (data.is_null(), len) {
        (true, 0) => Ok(&[]),
        (true, _) => Err(TunnelStatus::InvalidArgument),
        (false, _) => Ok(unsafe { slice::from_raw_parts(data, len) }),
    }
}

unsafe fn publish(result: Result<TunnelHandle, TunnelStatus>, out: *mut *mut TunnelHandle) -> i32 {
    if out.is_null() {
        if let Ok(handle) = result {
            handle.shutdown();
        }
        return TunnelStatus::InvalidArgument.code();
    }
    match result {
        Ok(handle) => {
            unsafe { out.write(Box::into_raw(Box::new(handle))) };
            TunnelStatus::Ok.code()
        }
        Err(status) => {
            unsafe { out.write(ptr::null_mut()) };
            status.code()
        }
    }
}
