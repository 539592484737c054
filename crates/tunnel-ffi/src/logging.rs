use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 安装进程级 `fmt` 日志订阅器。
///
/// 过滤规则取自 `RUST_LOG`，缺省为 `info`。已有全局订阅器时返回 `false`，不覆盖宿主的安装。
pub fn init_logging() -> bool {
    tracing_subscriber::registry()
        .with(build_env_filter())
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::init_logging;

    #[test]
    fn second_installation_is_refused() {
        init_logging();
        assert!(!init_logging());
    }
}
