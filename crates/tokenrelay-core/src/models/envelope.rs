use serde::{Deserialize, Serialize};

/// Envelope `code` that denotes logical success, independent of HTTP status.
pub const SUCCESS_CODE: i64 = 200;

/// Response wrapper used by every business endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Envelope<T> {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    pub data: Option<T>,
}

impl<T> Envelope<T> {
    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }
}
