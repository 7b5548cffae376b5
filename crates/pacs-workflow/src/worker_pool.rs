//! 批量提取工作池
//!
//! 每个导入任务构建一个 rayon 线程池，批次内的文件并行读取和解析。
//! 单个文件的失败只会让该文件被跳过；整批失败 (工作线程 panic、结果通道断开)
//! 以 `PacsError::Worker` 返回给调用方。工作线程从不访问索引库。

use pacs_core::{ImportRecord, PacsError, Result};
use pacs_dicom::{resolve_folder_hint, DicomParser};
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// 最大工作线程数
pub const MAX_WORKERS: usize = 64;

/// 一个批次的提取结果，记录顺序与输入路径一致
#[derive(Debug, Default)]
pub struct BatchExtraction {
    pub records: Vec<ImportRecord>,
    pub skipped: usize,
}

/// 提取工作池
#[derive(Clone)]
pub struct ExtractionPool {
    pool: Arc<ThreadPool>,
    workers: usize,
}

impl ExtractionPool {
    /// 构建工作池，0 表示使用可用并行度
    pub fn new(worker_threads: usize) -> Result<Self> {
        let workers = if worker_threads == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            worker_threads
        }
        .clamp(1, MAX_WORKERS);

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("pacs-extract-{}", index))
            .build()
            .map_err(|e| PacsError::Worker(format!("无法创建工作线程池: {}", e)))?;

        debug!("提取工作池已创建: {} 个线程", workers);
        Ok(Self {
            pool: Arc::new(pool),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// 并行提取一个批次
    pub async fn extract_batch(&self, paths: Vec<PathBuf>) -> Result<BatchExtraction> {
        self.run_batch(paths, process_file).await
    }

    async fn run_batch<F>(&self, paths: Vec<PathBuf>, extract: F) -> Result<BatchExtraction>
    where
        F: Fn(&Path) -> Option<ImportRecord> + Send + Sync + 'static,
    {
        let (sender, receiver) = oneshot::channel();

        self.pool.spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                paths
                    .par_iter()
                    .map(|path| extract(path.as_path()))
                    .collect::<Vec<_>>()
            }));
            // 接收方已放弃时结果直接丢弃
            let _ = sender.send(outcome);
        });

        let results = receiver
            .await
            .map_err(|_| PacsError::Worker("提取结果通道已断开".to_string()))?
            .map_err(|payload| PacsError::Worker(panic_message(&*payload)))?;

        let total = results.len();
        let records: Vec<ImportRecord> = results.into_iter().flatten().collect();
        Ok(BatchExtraction {
            skipped: total - records.len(),
            records,
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "未知错误".to_string());
    format!("提取工作线程异常终止: {}", detail)
}

/// 处理单个文件：读取、解析、解析患者身份
///
/// 无法读取或无法识别的文件返回 None。
pub fn process_file(path: &Path) -> Option<ImportRecord> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            warn!("无法读取文件 {:?}: {}", path, e);
            return None;
        }
    };

    let metadata = DicomParser::parse_bytes(&data, path)?;
    let folder_hint = resolve_folder_hint(&metadata, path);

    Some(ImportRecord {
        metadata,
        file_path: path.to_string_lossy().into_owned(),
        file_size: data.len() as i64,
        folder_hint,
    })
}
