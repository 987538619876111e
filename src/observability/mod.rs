//! 可观测性：tracing 订阅器初始化
//!
//! 默认 info 级别，RUST_LOG 环境变量可覆盖（如 RUST_LOG=opcore=debug）。

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init() {
    init_with_filter("info");
}

/// 以指定默认级别初始化；嵌入方已有订阅器时不要调用
pub fn init_with_filter(default_directive: &str) {
    let filter = EnvFilter::from_default_env()
        .add_directive(default_directive.parse().unwrap_or_else(|_| {
            tracing_subscriber::filter::LevelFilter::INFO.into()
        }));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}
