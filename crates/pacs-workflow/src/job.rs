//! 导入任务跟踪
//!
//! `ImportGate` 保证进程内同一时间只有一个导入任务；`JobTracker` 维护任务状态
//! 并通过事件通道按批次顺序推送进度。

use crate::state_machine::{JobEvent, JobStateMachine};
use chrono::Utc;
use pacs_core::{ImportJob, PacsError, Result};
use pacs_database::BatchOutcome;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};
use uuid::Uuid;

/// 导入事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImportEvent {
    /// 任务状态或进度变化
    Job(ImportJob),
    /// 一个批次提交后被触及的检查和序列
    DataChanged {
        job_id: Uuid,
        study_uids: Vec<String>,
        series_uids: Vec<String>,
    },
}

/// 单任务闸门
#[derive(Debug, Clone, Default)]
pub struct ImportGate {
    active: Arc<Mutex<Option<Uuid>>>,
}

impl ImportGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Uuid>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 获取导入许可，已有任务进行时返回 `ImportInProgress`
    pub fn try_acquire(&self, job_id: Uuid) -> Result<ImportPermit> {
        let mut active = self.lock();
        if let Some(current) = *active {
            return Err(PacsError::ImportInProgress(current));
        }
        *active = Some(job_id);
        Ok(ImportPermit {
            gate: self.clone(),
            job_id,
        })
    }

    /// 当前持有许可的任务
    pub fn active(&self) -> Option<Uuid> {
        *self.lock()
    }
}

/// 导入许可，释放时闸门重新打开
#[derive(Debug)]
pub struct ImportPermit {
    gate: ImportGate,
    job_id: Uuid,
}

impl ImportPermit {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

impl Drop for ImportPermit {
    fn drop(&mut self) {
        let mut active = self.gate.lock();
        if *active == Some(self.job_id) {
            *active = None;
        }
    }
}

/// 任务跟踪器
pub struct JobTracker {
    job: ImportJob,
    state_machine: JobStateMachine,
    events: UnboundedSender<ImportEvent>,
    permit: Option<ImportPermit>,
}

impl JobTracker {
    /// 创建跟踪器并推送 pending 事件
    pub fn new(job: ImportJob, permit: ImportPermit, events: UnboundedSender<ImportEvent>) -> Self {
        let tracker = Self {
            job,
            state_machine: JobStateMachine::new(),
            events,
            permit: Some(permit),
        };
        tracker.emit(ImportEvent::Job(tracker.job.clone()));
        tracker
    }

    pub fn job(&self) -> &ImportJob {
        &self.job
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(JobEvent::Start)?;
        self.job.details = format!("Importing {} files", self.job.total_files);
        info!("导入任务 {} 开始: {} 个文件", self.job.id, self.job.total_files);
        self.emit(ImportEvent::Job(self.job.clone()));
        Ok(())
    }

    /// 记录一个已提交批次
    pub fn record_batch(&mut self, processed_files: usize, skipped: usize, outcome: &BatchOutcome) {
        self.job.processed_files = processed_files;
        self.job.images_indexed += outcome.images_written;
        self.job.files_skipped += skipped;
        self.job.progress = self.percent().max(self.job.progress);
        self.job.details = format!(
            "Processed {}/{} files",
            self.job.processed_files, self.job.total_files
        );
        self.job.updated_at = Utc::now();

        debug!(
            "导入任务 {} 进度 {}% ({} 个图像, {} 个跳过)",
            self.job.id, self.job.progress, self.job.images_indexed, self.job.files_skipped
        );
        self.emit(ImportEvent::Job(self.job.clone()));

        if !outcome.study_uids.is_empty() || !outcome.series_uids.is_empty() {
            self.emit(ImportEvent::DataChanged {
                job_id: self.job.id,
                study_uids: outcome.study_uids.clone(),
                series_uids: outcome.series_uids.clone(),
            });
        }
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(JobEvent::Complete)?;
        self.job.progress = 100;
        self.job.details = format!(
            "Imported {} images ({} files skipped)",
            self.job.images_indexed, self.job.files_skipped
        );
        info!(
            "导入任务 {} 完成: {} 个图像, {} 个文件跳过",
            self.job.id, self.job.images_indexed, self.job.files_skipped
        );
        self.finish();
        Ok(())
    }

    /// 标记失败，`first_unprocessed` 为第一个未提交文件的下标
    pub fn fail(&mut self, cause: &PacsError, first_unprocessed: usize) -> Result<()> {
        self.transition(JobEvent::Fail)?;
        self.job.error = Some(cause.to_string());
        self.job.first_unprocessed = Some(first_unprocessed);
        self.job.details = format!(
            "Failed after {}/{} files",
            self.job.processed_files, self.job.total_files
        );
        error!("导入任务 {} 失败: {}", self.job.id, cause);
        self.finish();
        Ok(())
    }

    pub fn into_job(self) -> ImportJob {
        self.job
    }

    fn percent(&self) -> u8 {
        if self.job.total_files == 0 {
            return 100;
        }
        (self.job.processed_files.min(self.job.total_files) * 100 / self.job.total_files) as u8
    }

    fn transition(&mut self, event: JobEvent) -> Result<()> {
        self.job.status = self.state_machine.transition(self.job.status, event)?;
        self.job.updated_at = Utc::now();
        Ok(())
    }

    /// 进入终态：先释放许可，再推送终态事件
    fn finish(&mut self) {
        debug_assert!(self.job.status.is_terminal());
        self.permit.take();
        self.emit(ImportEvent::Job(self.job.clone()));
    }

    fn emit(&self, event: ImportEvent) {
        if self.events.send(event).is_err() {
            debug!("导入事件接收方已关闭");
        }
    }
}

impl std::fmt::Debug for JobTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTracker")
            .field("job", &self.job)
            .field("holds_permit", &self.permit.is_some())
            .finish()
    }
}
