//! 导入任务状态机
//!
//! pending → active → {completed | failed}，以及 pending → failed。
//! 终态不再接受任何事件。

use pacs_core::{JobStatus, PacsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 任务状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobEvent {
    Start,
    Complete,
    Fail,
}

/// 任务状态机
#[derive(Debug)]
pub struct JobStateMachine {
    transitions: HashMap<(JobStatus, JobEvent), JobStatus>,
}

impl JobStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        let mut transitions = HashMap::new();

        transitions.insert((JobStatus::Pending, JobEvent::Start), JobStatus::Active);
        transitions.insert((JobStatus::Pending, JobEvent::Fail), JobStatus::Failed);
        transitions.insert((JobStatus::Active, JobEvent::Complete), JobStatus::Completed);
        transitions.insert((JobStatus::Active, JobEvent::Fail), JobStatus::Failed);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: JobStatus, event: JobEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: JobStatus, event: JobEvent) -> Result<JobStatus> {
        self.transitions
            .get(&(from, event))
            .copied()
            .ok_or_else(|| PacsError::InvalidStateTransition {
                from: format!("{:?}", from),
                event: format!("{:?}", event),
            })
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current_state: JobStatus) -> Vec<JobEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current_state)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for JobStateMachine {
    fn default() -> Self {
        Self::new()
    }
}
