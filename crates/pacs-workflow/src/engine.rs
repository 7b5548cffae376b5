//! 导入编排引擎
//!
//! 将输入路径按固定大小切成批次，依次交给提取工作池和分层写入器。
//! 一个批次的写入事务结束后才开始下一个批次的提取，索引库写入只发生在任务自身的 tokio 任务中。

use crate::job::{ImportEvent, ImportGate, JobTracker};
use crate::worker_pool::ExtractionPool;
use pacs_core::{ImportJob, PacsError, Result};
use pacs_database::{BatchOutcome, DatabasePool, HierarchyWriter};
use std::path::PathBuf;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

/// 默认批次大小
pub const DEFAULT_BATCH_SIZE: usize = 25;
/// 最大批次大小
pub const MAX_BATCH_SIZE: usize = 1000;

/// 导入参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    pub batch_size: usize,
    /// 0 表示使用可用并行度
    pub worker_threads: usize,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            worker_threads: 0,
        }
    }
}

impl ImportOptions {
    fn batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// 已提交导入任务的句柄
#[derive(Debug)]
pub struct ImportHandle {
    job_id: Uuid,
    task: JoinHandle<ImportJob>,
}

impl ImportHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// 等待任务进入终态
    pub async fn wait(self) -> Result<ImportJob> {
        self.task
            .await
            .map_err(|e| PacsError::Internal(format!("导入任务 {} 异常终止: {}", self.job_id, e)))
    }
}

/// 导入编排器
pub struct ImportOrchestrator {
    database: DatabasePool,
    options: ImportOptions,
    gate: ImportGate,
    events: UnboundedSender<ImportEvent>,
}

impl ImportOrchestrator {
    /// 创建编排器，返回导入事件接收端
    pub fn new(
        database: DatabasePool,
        options: ImportOptions,
    ) -> (Self, UnboundedReceiver<ImportEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        if options.batch_size() != options.batch_size {
            warn!(
                "批次大小 {} 超出范围，使用 {}",
                options.batch_size,
                options.batch_size()
            );
        }

        (
            Self {
                database,
                options,
                gate: ImportGate::new(),
                events,
            },
            receiver,
        )
    }

    /// 当前正在进行的导入任务
    pub fn active_job(&self) -> Option<Uuid> {
        self.gate.active()
    }

    /// 提交导入任务
    ///
    /// 任务在后台执行；已有任务进行时立即返回 `ImportInProgress`。
    /// 必须在 tokio 运行时中调用。
    pub fn submit(&self, paths: Vec<PathBuf>) -> Result<ImportHandle> {
        let job = ImportJob::new(paths.len());
        let job_id = job.id;
        let permit = self.gate.try_acquire(job_id)?;
        let tracker = JobTracker::new(job, permit, self.events.clone());

        let database = self.database.clone();
        let options = self.options.clone();
        let task = tokio::spawn(run_job(database, options, paths, tracker));

        Ok(ImportHandle { job_id, task })
    }
}

async fn run_job(
    database: DatabasePool,
    options: ImportOptions,
    paths: Vec<PathBuf>,
    mut tracker: JobTracker,
) -> ImportJob {
    let pool = match ExtractionPool::new(options.worker_threads) {
        Ok(pool) => pool,
        Err(e) => {
            if let Err(transition) = tracker.fail(&e, 0) {
                error!("无法标记任务失败: {}", transition);
            }
            return tracker.into_job();
        }
    };

    if let Err(e) = tracker.start() {
        error!("无法启动导入任务: {}", e);
        return tracker.into_job();
    }

    let writer = HierarchyWriter::new(&database);
    let mut committed = 0usize;

    for chunk in paths.chunks(options.batch_size()) {
        match import_chunk(&pool, &writer, chunk).await {
            Ok((skipped, outcome)) => {
                committed += chunk.len();
                tracker.record_batch(committed, skipped, &outcome);
            }
            Err(e) => {
                if let Err(transition) = tracker.fail(&e, committed) {
                    error!("无法标记任务失败: {}", transition);
                }
                return tracker.into_job();
            }
        }
    }

    if let Err(e) = tracker.complete() {
        error!("无法完成导入任务: {}", e);
    }
    tracker.into_job()
}

async fn import_chunk(
    pool: &ExtractionPool,
    writer: &HierarchyWriter<'_>,
    chunk: &[PathBuf],
) -> Result<(usize, BatchOutcome)> {
    let extraction = pool.extract_batch(chunk.to_vec()).await?;
    let outcome = writer.import_batch(&extraction.records).await?;
    Ok((extraction.skipped, outcome))
}
