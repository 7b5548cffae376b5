//! # PACS Core
//!
//! PACS导入系统的核心模块，提供提取记录、索引实体、导入任务等数据结构，
//! 以及统一的错误定义和通用工具。

pub mod error;
pub mod models;
pub mod utils;

pub use error::{PacsError, Result};
pub use models::*;
