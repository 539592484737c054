#![doc = r#"
# tunnel-ffi

## 设计动机（Why）
- 宿主进程（UI、移动端或其他语言运行时）通过 C ABI 驱动隧道端点，核心逻辑与 QUIC 适配层保持纯 Rust；
- 以显式句柄取代进程级单例：同一进程可以同时持有入口与出口，释放顺序由宿主决定。

## 交互契约（What）
- `tunnel_client_start` / `tunnel_server_start` 完成握手后经 `out` 返回句柄；
- `tunnel_send_datagram` 按大小策略选择通道，`tunnel_send_stream` 强制走可靠流；
- `tunnel_stop` 发起协作关闭，`tunnel_free` 关闭并释放句柄；
- 宿主以 [`TunnelHostVTable`] 接收消息、诊断文件名与关闭通知；
- 所有函数返回 [`TunnelStatus`] 的整数值。

## 风险提示（Trade-offs）
- 每个句柄自带多线程运行时，调用在该运行时上阻塞等待；从单线程运行时内部调用会返回
  `RuntimeUnavailable`。
"#]

pub mod api;
mod handle;
pub mod host;
pub mod logging;
pub mod status;

pub use api::{
    tunnel_capabilities_json, tunnel_client_start, tunnel_client_start_with_config, tunnel_free,
    tunnel_init_logging, tunnel_send_datagram, tunnel_send_stream, tunnel_server_start,
    tunnel_server_start_with_config, tunnel_stop, tunnel_string_free,
};
pub use handle::TunnelHandle;
pub use host::{ClosedCallback, MessageCallback, QlogCallback, TunnelCloseKind, TunnelHostVTable};
pub use status::TunnelStatus;
