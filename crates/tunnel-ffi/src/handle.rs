use std::{
    future::Future,
    sync::{Arc, mpsc},
    thread,
};

use bytes::Bytes;
use tokio::runtime::{Builder, Handle, Runtime, RuntimeFlavor};
use tracing::{debug, error};
use tunnel_core::{Delivery, HostCallbacks, SessionError, TunnelClientConfig, TunnelServerConfig};
use tunnel_transport_quic::{StartError, TunnelClient, TunnelEndpoint, TunnelServer};

use crate::status::TunnelStatus;

/// 宿主持有的隧道句柄：一个专用多线程运行时加一个已建立的端点。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - 取代进程级单例：每次 `start` 返回独立句柄，宿主显式释放；
/// - C 调用方是同步的，句柄在自带的运行时上阻塞等待异步操作完成。
///
/// ## 契约（What）
/// - 在非运行时线程上调用时直接 `block_on`；在多线程运行时的工作线程上（例如在回调内部）
///   调用时先让出工作线程再阻塞；其余情况返回 [`TunnelStatus::RuntimeUnavailable`]；
/// - `shutdown` 在运行时外部调用时阻塞到会话 `Closed` 且端点排空；在运行时内部调用时立即返回，
///   排空在释放线程上完成。
#[derive(Debug)]
pub struct TunnelHandle {
    runtime: Runtime,
    endpoint: TunnelEndpoint,
}

impl TunnelHandle {
    pub(crate) fn client(
        config: TunnelClientConfig,
        host: Arc<dyn HostCallbacks>,
    ) -> Result<Self, TunnelStatus> {
        let runtime = build_runtime()?;
        let endpoint = block_on(&runtime, TunnelClient::start(&config, host))?
            .map_err(|err| start_failed("client", &err))?;
        Ok(Self { runtime, endpoint })
    }

    pub(crate) fn server(
        config: TunnelServerConfig,
        host: Arc<dyn HostCallbacks>,
    ) -> Result<Self, TunnelStatus> {
        let runtime = build_runtime()?;
        let endpoint = block_on(&runtime, TunnelServer::start(config, host))?
            .map_err(|err| start_failed("server", &err))?;
        Ok(Self { runtime, endpoint })
    }

    pub(crate) fn stop(&self) -> Result<(), TunnelStatus> {
        self.endpoint.stop().map_err(|err| session_failed(&err))
    }

    pub(crate) fn send_stream(&self, payload: &[u8]) -> Result<(), TunnelStatus> {
        block_on(&self.runtime, self.endpoint.send_stream(payload))?
            .map_err(|err| session_failed(&err))
    }

    pub(crate) fn send_datagram(&self, payload: Bytes) -> Result<Delivery, TunnelStatus> {
        block_on(&self.runtime, self.endpoint.send_datagram(payload))?
            .map_err(|err| session_failed(&err))
    }

    /// 协作关闭会话并释放运行时。
    ///
    /// 在任一运行时内部调用（例如在宿主回调中）时只发出关闭信号，等待 `Closed` 与释放运行时
    /// 交给独立的释放线程完成：触发回调的入站循环要等回调返回后才能退出，原地等待会死锁。
    pub(crate) fn shutdown(self) {
        let Self { runtime, endpoint } = self;
        if endpoint.stop().is_err() {
            debug!("session already closing before release");
        }
        if Handle::try_current().is_ok() {
            release_detached(runtime, endpoint);
        } else {
            release(runtime, endpoint);
        }
    }
}

fn release(runtime: Runtime, endpoint: TunnelEndpoint) {
    let reason = runtime.block_on(endpoint.shutdown());
    debug!(reason = ?reason, "tunnel handle released");
}

fn release_detached(runtime: Runtime, endpoint: TunnelEndpoint) {
    let (handoff, pending) = mpsc::channel::<(Runtime, TunnelEndpoint)>();
    let spawned = thread::Builder::new()
        .name("tunnel-release".to_owned())
        .spawn(move || {
            if let Ok((runtime, endpoint)) = pending.recv() {
                release(runtime, endpoint);
            }
        });
    let leftover = match spawned {
        Ok(_) => handoff.send((runtime, endpoint)).err().map(|returned| returned.0),
        Err(err) => {
            error!(error = %err, "failed to spawn release thread");
            Some((runtime, endpoint))
        }
    };
    if let Some((runtime, endpoint)) = leftover {
        drop(endpoint);
        runtime.shutdown_background();
    }
}

fn build_runtime() -> Result<Runtime, TunnelStatus> {
    Builder::new_multi_thread()
        .enable_all()
        .thread_name("tunnel-runtime")
        .build()
        .map_err(|err| {
            error!(error = %err, "failed to build tunnel runtime");
            TunnelStatus::RuntimeUnavailable
        })
}

fn block_on<F: Future>(runtime: &Runtime, future: F) -> Result<F::Output, TunnelStatus> {
    match Handle::try_current() {
        Err(_) => Ok(runtime.block_on(future)),
        Ok(current) if current.runtime_flavor() == RuntimeFlavor::MultiThread => {
            Ok(tokio::task::block_in_place(|| runtime.block_on(future)))
        }
        Ok(_) => {
            error!("tunnel call made from a current-thread runtime, refusing to block");
            Err(TunnelStatus::RuntimeUnavailable)
        }
    }
}

fn start_failed(role: &'static str, err: &StartError) -> TunnelStatus {
    error!(role, code = err.code(), error = %err, "tunnel start failed");
    TunnelStatus::StartFailed
}

fn session_failed(err: &SessionError) -> TunnelStatus {
    debug!(code = err.code(), error = %err, "tunnel call failed");
    TunnelStatus::from(err)
}
