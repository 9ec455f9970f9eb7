//! 共享库
//!
//! 包含策略守护进程共用的配置加载与日志初始化代码。

pub mod config;
pub mod observability;
