use serde::{Deserialize, Serialize};

/// Current time as Unix seconds
pub fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Ledger entry for one problem of one notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemStateRecord {
    pub notification_id: i64,
    pub checksum: String,
    /// No re-announcement before this time
    pub expires: i64,
    pub last_seen: i64,
    pub app_data: Option<String>,
}
