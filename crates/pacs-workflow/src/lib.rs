//! # PACS导入工作流模块
//!
//! 提供批量导入的完整流程：
//! - 任务状态机：pending → active → completed / failed
//! - 提取工作池：每个任务一个 rayon 线程池，按批次并行解析文件
//! - 任务跟踪：单任务闸门和按批次顺序推送的进度事件
//! - 导入编排：批次依次经过提取和分层写入，错误转为任务终态

pub mod engine;
pub mod job;
pub mod state_machine;
pub mod worker_pool;

// 重新导出主要类型
pub use engine::{ImportHandle, ImportOptions, ImportOrchestrator, DEFAULT_BATCH_SIZE, MAX_BATCH_SIZE};
pub use job::{ImportEvent, ImportGate, ImportPermit, JobTracker};
pub use state_machine::{JobEvent, JobStateMachine};
pub use worker_pool::{BatchExtraction, ExtractionPool, MAX_WORKERS};
