use serde::{Deserialize, Serialize};

/// An analysis session as listed by `session/get_sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionInfo {
    pub session_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRename<'a> {
    pub name: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanRequest<'a> {
    pub session_id: &'a str,
    pub clean_strategy: &'a str,
}
