//! # PACS数据库模块
//!
//! 负责四级影像索引 (患者、检查、序列、图像) 的存储，提供SQLite连接池、
//! 按批次事务写入的分层 upsert 引擎，以及读取、删除、缩略图缓存和保存查询等操作。

pub mod connection;
pub mod models;
pub mod queries;
pub mod upsert;

#[cfg(test)]
mod testing;

// 重新导出主要类型
pub use connection::{DatabaseOptions, DatabasePool};
pub use models::*;
pub use queries::DatabaseQueries;
pub use upsert::{BatchOutcome, HierarchyWriter, TouchedSet};
