use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use forgequeue_core::{WorkId, WorkItem, WorkOutput};

/// Topic of a [`WorkEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkEventKind {
    Added,
    Allocated,
    Done,
    Finished,
    Deleted,
}

impl WorkEventKind {
    /// Stable topic name (e.g. "finished").
    pub fn topic(&self) -> &'static str {
        match self {
            WorkEventKind::Added => "added",
            WorkEventKind::Allocated => "allocated",
            WorkEventKind::Done => "done",
            WorkEventKind::Finished => "finished",
            WorkEventKind::Deleted => "deleted",
        }
    }
}

/// A work lifecycle fact, published after the corresponding change was persisted.
///
/// `Done` is the exception: it carries the raw adapter outcome before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum WorkEvent {
    Added { work: WorkItem },
    Allocated { work: WorkItem },
    Done {
        work_id: WorkId,
        output: WorkOutput,
        occurred_at: DateTime<Utc>,
    },
    Finished { work: WorkItem },
    Deleted { work: WorkItem },
}

impl WorkEvent {
    pub fn kind(&self) -> WorkEventKind {
        match self {
            WorkEvent::Added { .. } => WorkEventKind::Added,
            WorkEvent::Allocated { .. } => WorkEventKind::Allocated,
            WorkEvent::Done { .. } => WorkEventKind::Done,
            WorkEvent::Finished { .. } => WorkEventKind::Finished,
            WorkEvent::Deleted { .. } => WorkEventKind::Deleted,
        }
    }

    /// The work item carried by the event (`None` for `Done`).
    pub fn work(&self) -> Option<&WorkItem> {
        match self {
            WorkEvent::Added { work }
            | WorkEvent::Allocated { work }
            | WorkEvent::Finished { work }
            | WorkEvent::Deleted { work } => Some(work),
            WorkEvent::Done { .. } => None,
        }
    }

    pub fn work_id(&self) -> WorkId {
        match self {
            WorkEvent::Added { work }
            | WorkEvent::Allocated { work }
            | WorkEvent::Finished { work }
            | WorkEvent::Deleted { work } => work.id,
            WorkEvent::Done { work_id, .. } => *work_id,
        }
    }
}
