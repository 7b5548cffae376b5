//! 错误定义模块

use thiserror::Error;

/// PACS系统统一错误类型
#[derive(Error, Debug)]
pub enum PacsError {
    #[error("数据库错误: {0}")]
    Database(String),

    #[error("DICOM解析错误: {0}")]
    DicomParseError(String),

    #[error("DICOM处理错误: {0}")]
    Dicom(String),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("提取工作线程错误: {0}")]
    Worker(String),

    #[error("已有导入任务正在进行: {0}")]
    ImportInProgress(uuid::Uuid),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

/// PACS系统统一结果类型
pub type Result<T> = std::result::Result<T, PacsError>;
