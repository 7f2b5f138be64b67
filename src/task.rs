//! Task model: one unit of OCR work for a (file, backend) pair.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::indicators::Indicator;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Synthetic task id: a process-wide sequence number plus a random suffix.
/// Ordering by id follows creation order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    sequence: u64,
    nonce: Uuid,
}

impl TaskId {
    pub fn generate() -> Self {
        Self {
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            nonce: Uuid::new_v4(),
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let nonce = self.nonce.simple().to_string();
        write!(f, "{}-{}", self.sequence, &nonce[..8])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Processing => 1,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 2,
        }
    }

    /// Transitions only move forward: pending → processing → terminal, with
    /// pending allowed to jump straight to a terminal state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

/// Error recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub batch_id: String,
    pub file_id: String,
    pub backend_id: String,
    pub status: TaskStatus,
    /// 0-100
    pub progress: u8,
    pub extracted_text: Option<String>,
    pub indicators: Option<Vec<Indicator>>,
    pub error: Option<TaskError>,
}

impl Task {
    pub fn new(
        batch_id: impl Into<String>,
        file_id: impl Into<String>,
        backend_id: impl Into<String>,
    ) -> Self {
        Self {
            id: TaskId::generate(),
            batch_id: batch_id.into(),
            file_id: file_id.into(),
            backend_id: backend_id.into(),
            status: TaskStatus::Pending,
            progress: 0,
            extracted_text: None,
            indicators: None,
            error: None,
        }
    }

    /// Move to `next` if that is a forward transition. Terminal states pin
    /// progress at 100. Returns false when the transition is refused.
    pub fn advance(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        if next.is_terminal() {
            self.progress = 100;
        }
        true
    }

    /// Raise progress of a running task. Never lowers it and never reaches 100
    /// before the task is terminal.
    pub fn set_progress(&mut self, percent: u8) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let percent = percent.min(99);
        if percent <= self.progress {
            return false;
        }
        self.progress = percent;
        true
    }

    pub fn complete(&mut self, text: String, indicators: Vec<Indicator>) -> bool {
        if !self.advance(TaskStatus::Completed) {
            return false;
        }
        self.extracted_text = Some(text);
        self.indicators = Some(indicators);
        true
    }

    pub fn fail(&mut self, message: impl Into<String>, retryable: bool) -> bool {
        if !self.advance(TaskStatus::Failed) {
            return false;
        }
        self.error = Some(TaskError {
            message: message.into(),
            retryable,
        });
        true
    }

    pub fn cancel(&mut self) -> bool {
        self.advance(TaskStatus::Cancelled)
    }
}

/// Derived progress over a set of tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressAggregate {
    /// Tasks in a terminal state.
    pub completed_tasks: usize,
    pub total_tasks: usize,
    /// Mean task progress, 0-100.
    pub overall_progress: f64,
}

impl ProgressAggregate {
    pub fn from_tasks<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut completed_tasks = 0;
        let mut total_tasks = 0;
        let mut progress_sum = 0u64;

        for task in tasks {
            total_tasks += 1;
            progress_sum += u64::from(task.progress);
            if task.status.is_terminal() {
                completed_tasks += 1;
            }
        }

        let overall_progress = if total_tasks == 0 {
            0.0
        } else {
            progress_sum as f64 / total_tasks as f64
        };

        Self {
            completed_tasks,
            total_tasks,
            overall_progress,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.completed_tasks == self.total_tasks
    }
}
