use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use coursegen_core::{SmeTaskId, SubmissionId, TenantId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Pending,
    Processed,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubmissionStatus::Pending => "pending",
            SubmissionStatus::Processed => "processed",
            SubmissionStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(SubmissionStatus::Pending),
            "processed" => Some(SubmissionStatus::Processed),
            "failed" => Some(SubmissionStatus::Failed),
            _ => None,
        }
    }
}

/// Raw material handed in by a subject-matter expert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmeSubmission {
    pub id: SubmissionId,
    pub tenant_id: TenantId,
    pub sme_task_id: SmeTaskId,
    pub source_name: String,
    pub content: String,
    pub status: SubmissionStatus,
    pub summary: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// A unit of ingested SME knowledge used to ground generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub tenant_id: TenantId,
    pub sme_task_id: SmeTaskId,
    pub submission_id: SubmissionId,
    pub content: String,
    pub position: u32,
}
