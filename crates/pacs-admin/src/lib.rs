//! # PACS管理模块
//!
//! 提供配置加载、校验和日志初始化

pub mod config;
pub mod logging;

pub use config::{ConfigManager, ConfigOverrides, ConfigValidator, PacsConfig};
pub use logging::{init_logging, LogFormat};
