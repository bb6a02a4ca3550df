//! Shared data models used across modules

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ItemStatus::Pending),
            "processing" => Some(ItemStatus::Processing),
            "completed" => Some(ItemStatus::Completed),
            "failed" => Some(ItemStatus::Failed),
            _ => None,
        }
    }

    /// Items in these states may be reset to pending by the retry operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, ItemStatus::Pending | ItemStatus::Failed)
    }

    /// Items in these states may be deleted by their owner
    pub fn is_deletable(&self) -> bool {
        !matches!(self, ItemStatus::Processing)
    }
}

/// The structured artifact produced for a completed item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryJson {
    pub summary: String,
    pub key_points: Vec<String>,
    pub action_items: Vec<String>,
    pub timestamps: Vec<String>,
}

/// One user's request to summarize one video; doubles as the result record
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: Uuid,
    pub user_id: Uuid,
    pub video_id: String,
    pub video_title: Option<String>,
    pub video_channel: Option<String>,
    pub video_duration_seconds: Option<i32>,
    pub status: ItemStatus,
    /// Client-supplied transcript awaiting processing; never sent back to clients
    #[serde(skip)]
    pub transcript: Option<String>,
    pub summary_json: Option<SummaryJson>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when a new item is inserted
#[derive(Debug, Clone)]
pub struct NewQueueItem {
    pub user_id: Uuid,
    pub video_id: String,
    pub video_title: Option<String>,
    pub video_channel: Option<String>,
    pub video_duration_seconds: Option<i32>,
    pub transcript: Option<String>,
}

/// Subscription tier, supplied by billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    /// Daily summary allowance for the tier
    pub fn daily_limit(&self) -> u32 {
        match self {
            Plan::Free => 5,
            Plan::Pro => 100,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
        }
    }

    /// Unknown or missing plan values fall back to the free tier
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("pro") => Plan::Pro,
            _ => Plan::Free,
        }
    }
}

/// Stored per-user daily usage counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerEntry {
    pub daily_count: u32,
    pub reset_boundary: NaiveDate,
}
