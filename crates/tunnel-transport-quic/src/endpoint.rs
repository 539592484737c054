use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use bytes::Bytes;
use quinn::{
    ClientConfig, Connection, Endpoint, IdleTimeout, ServerConfig, TransportConfig, congestion,
};
use rustls_pki_types::CertificateDer;
use tracing::{debug, info};
use tunnel_core::{
    CloseReason, CongestionControl, Delivery, DiagnosticsFactory, HostCallbacks, SessionError,
    SessionOptions, TunnelClientConfig, TunnelConfig, TunnelServerConfig, TunnelSession, Vantage,
};

use crate::{
    error::{self, StartError},
    tls::{self, Identity},
    transport::QuicTransport,
};

/// 端点关闭后等待关闭帧发出的上限。
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 一条已建立并正在运行会话的隧道端点。
///
/// # 教案式注释
///
/// ## 意图（Why）
/// - **生命周期绑定**：`quinn::Endpoint` 必须比其上的连接活得更久，否则关闭帧可能来不及发出；
///   本类型把 Endpoint、连接与会话句柄放在一起，由调用方整体持有；
/// - **对称接口**：客户端与服务端建立连接后的操作完全一致（发送、停止、等待关闭）。
///
/// ## 契约（What）
/// - `send_*`/`stop`/`closed` 直接委托给 [`TunnelSession`]；
/// - `shutdown`：若会话仍在运行则协作关闭，等待会话进入 `Closed`，再等待 Endpoint 空闲；
/// - **前置条件**：必须在 Tokio 多线程运行时中使用。
#[derive(Debug)]
pub struct TunnelEndpoint {
    endpoint: Endpoint,
    connection: Connection,
    session: TunnelSession<QuicTransport>,
}

impl TunnelEndpoint {
    fn establish(
        endpoint: Endpoint,
        connection: Connection,
        host: Arc<dyn HostCallbacks>,
        tunnel: &TunnelConfig,
        vantage: Vantage,
    ) -> Self {
        let diagnostics = Arc::new(DiagnosticsFactory::new(
            tunnel.qlog_dir().map(Path::to_path_buf),
            vantage,
            Arc::clone(&host),
        ));
        let options = SessionOptions {
            datagrams_enabled: tunnel.enable_datagrams,
            vantage,
        };
        let session = TunnelSession::spawn(
            QuicTransport::new(connection.clone()),
            host,
            options,
            diagnostics,
        );
        Self {
            endpoint,
            connection,
            session,
        }
    }

    pub fn session(&self) -> &TunnelSession<QuicTransport> {
        &self.session
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr().ok()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    pub async fn send_stream(&self, payload: &[u8]) -> Result<(), SessionError> {
        self.session.send_stream(payload).await
    }

    pub async fn send_datagram(&self, payload: Bytes) -> Result<Delivery, SessionError> {
        self.session.send_datagram(payload).await
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.session.stop()
    }

    pub async fn closed(&self) -> CloseReason {
        self.session.closed().await
    }

    /// 关闭会话并释放 UDP Socket。
    pub async fn shutdown(self) -> CloseReason {
        if self.session.stop().is_err() {
            debug!(connection_id = %self.session.connection_id(), "session already closing");
        }
        let reason = self.session.closed().await;
        if tokio::time::timeout(DRAIN_TIMEOUT, self.endpoint.wait_idle())
            .await
            .is_err()
        {
            debug!("endpoint did not drain before timeout");
        }
        reason
    }
}

/// 隧道入口：拨号到远端并启动会话。
#[derive(Debug)]
pub struct TunnelClient;

impl TunnelClient {
    pub async fn start(
        config: &TunnelClientConfig,
        host: Arc<dyn HostCallbacks>,
    ) -> Result<TunnelEndpoint, StartError> {
        config.tunnel.validate()?;
        let remote = resolve(&config.remote).await?;
        let bind: SocketAddr = if remote.is_ipv6() {
            SocketAddr::from(([0_u16; 8], 0))
        } else {
            SocketAddr::from(([0_u8; 4], 0))
        };

        let trusted = config
            .trusted_certificate
            .as_deref()
            .map(tls::load_certificates)
            .transpose()?;
        let crypto = tls::client_crypto(trusted.as_deref(), &config.tunnel.alpn)?;
        let mut client_config = ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(Arc::new(transport_config(&config.tunnel)?));

        let mut endpoint =
            Endpoint::client(bind).map_err(|err| error::map_io_error(error::BIND, err))?;
        endpoint.set_default_client_config(client_config);

        let connecting = endpoint
            .connect(remote, &config.server_name)
            .map_err(|err| error::map_connect_error(error::CONNECT, err))?;
        let connection = connecting
            .await
            .map_err(|err| error::map_handshake_error(error::CONNECT, err))?;
        info!(
            remote = %remote,
            datagrams = config.tunnel.enable_datagrams,
            congestion_control = %config.tunnel.congestion_control,
            "tunnel client connected"
        );

        Ok(TunnelEndpoint::establish(
            endpoint,
            connection,
            host,
            &config.tunnel,
            Vantage::Client,
        ))
    }
}

/// 隧道出口：绑定地址后接受恰好一条连接。
///
/// `bind` 与 `accept` 分开提供，调用方可在对端连接前取得实际监听端口。
#[derive(Debug)]
pub struct TunnelServer {
    endpoint: Endpoint,
    config: TunnelServerConfig,
    certificate: CertificateDer<'static>,
    local_addr: SocketAddr,
}

impl TunnelServer {
    /// 以 `localhost` 自签名证书绑定。
    pub async fn bind(config: TunnelServerConfig) -> Result<Self, StartError> {
        let identity = Identity::self_signed(vec!["localhost".to_owned()])?;
        Self::bind_with_identity(config, identity).await
    }

    pub async fn bind_with_identity(
        config: TunnelServerConfig,
        identity: Identity,
    ) -> Result<Self, StartError> {
        config.tunnel.validate()?;
        let addr = resolve(&config.bind).await?;
        let crypto = tls::server_crypto(&identity, &config.tunnel.alpn)?;
        let mut server_config = ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(Arc::new(transport_config(&config.tunnel)?));

        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|err| error::map_io_error(error::BIND, err))?;
        let local_addr = endpoint
            .local_addr()
            .map_err(|err| error::map_io_error(error::BIND, err))?;
        info!(local_addr = %local_addr, "tunnel server listening");
        Ok(Self {
            endpoint,
            config,
            certificate: identity.certificate().clone(),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 服务端证书，供对端配置为受信任证书。
    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    /// 等待并接受一条连接；之后 Endpoint 拒绝新的连接。
    pub async fn accept(self, host: Arc<dyn HostCallbacks>) -> Result<TunnelEndpoint, StartError> {
        let incoming = self
            .endpoint
            .accept()
            .await
            .ok_or_else(|| error::closed_error(error::ACCEPT, "endpoint closed"))?;
        self.endpoint.set_server_config(None);
        let connecting = incoming
            .accept()
            .map_err(|err| error::map_handshake_error(error::ACCEPT, err))?;
        let connection = connecting
            .await
            .map_err(|err| error::map_handshake_error(error::ACCEPT, err))?;
        info!(remote = %connection.remote_address(), "tunnel server accepted connection");

        Ok(TunnelEndpoint::establish(
            self.endpoint,
            connection,
            host,
            &self.config.tunnel,
            Vantage::Server,
        ))
    }

    /// 绑定并接受一条连接。
    pub async fn start(
        config: TunnelServerConfig,
        host: Arc<dyn HostCallbacks>,
    ) -> Result<TunnelEndpoint, StartError> {
        Self::bind(config).await?.accept(host).await
    }
}

async fn resolve(address: &str) -> Result<SocketAddr, StartError> {
    tokio::net::lookup_host(address)
        .await
        .map_err(|err| error::map_io_error(error::RESOLVE, err))?
        .next()
        .ok_or_else(|| error::closed_error(error::RESOLVE, "address resolved to nothing"))
}

/// 由共享配置构造 QUIC 传输参数。
///
/// 禁用数据报时不向对端通告接收缓冲，对端的 `max_datagram_size` 随之为空；
/// 初始 MTU 取 [`TunnelConfig::effective_initial_mtu`]。
pub(crate) fn transport_config(tunnel: &TunnelConfig) -> Result<TransportConfig, StartError> {
    let mut transport = TransportConfig::default();
    if !tunnel.enable_datagrams {
        transport.datagram_receive_buffer_size(None);
    }
    let idle_timeout = tunnel
        .idle_timeout()
        .map(IdleTimeout::try_from)
        .transpose()
        .map_err(|err| StartError::new(error::CONFIG, err))?;
    transport.max_idle_timeout(idle_timeout);
    transport.keep_alive_interval(tunnel.keep_alive());
    if let Some(mtu) = tunnel.effective_initial_mtu() {
        transport.initial_mtu(mtu);
    }
    match tunnel.congestion_control {
        CongestionControl::NewReno => {
            transport.congestion_controller_factory(Arc::new(congestion::NewRenoConfig::default()))
        }
        CongestionControl::Cubic => {
            transport.congestion_controller_factory(Arc::new(congestion::CubicConfig::default()))
        }
        CongestionControl::Bbr => {
            transport.congestion_controller_factory(Arc::new(congestion::BbrConfig::default()))
        }
    };
    Ok(transport)
}
