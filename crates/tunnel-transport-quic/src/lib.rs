#![doc = r#"
# tunnel-transport-quic

## 设计动机（Why）
- **落地传输缝合层**：以 `quinn` 实现 `tunnel-core` 的 `TunnelTransport`，数据报走 QUIC DATAGRAM 扩展，
  可靠消息走单向流；
- **端点生命周期**：客户端拨号、服务端绑定并接受恰好一条连接，随后在连接上启动隧道会话；
- **开箱即用**：服务端即时生成自签名证书，客户端默认不校验服务端身份，与实验网络的部署方式一致。

## 核心契约（What）
- `TunnelClient::start` / `TunnelServer::{bind, accept, start}`：失败以 `StartError` 返回，不重试；
- `TunnelEndpoint`：持有 Endpoint、连接与会话，提供发送、停止、等待关闭与整体收尾；
- `capabilities`：报告实现名、通道与可选拥塞控制算法。

## 实现策略（How）
- `error` 模块统一维护错误码映射，`ApplicationClosed`/`LocallyClosed` 保持结构化，交给核心判定协作关闭；
- `transport_config` 将共享配置映射为 `quinn::TransportConfig`（数据报开关、空闲超时、保活、初始 MTU、拥塞控制）。

## 风险与注意（Trade-offs）
- 跳过证书校验仅适用于受控网络，生产部署应配置 `trusted_certificate`；
- 初始路径 MTU 为 1200 字节时，实际可用数据报上限略低于 1200，超限负载会被拒绝而非分片。
"#]

mod capabilities;
mod endpoint;
mod error;
mod tls;
mod transport;

pub use capabilities::{Capabilities, capabilities};
pub use endpoint::{TunnelClient, TunnelEndpoint, TunnelServer};
pub use error::StartError;
pub use tls::{Identity, load_certificates};
pub use transport::{QuicInbound, QuicOutbound, QuicTransport};
