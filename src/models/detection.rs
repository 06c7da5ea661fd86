use serde::{Deserialize, Serialize};

/// Why the detector flagged (or cleared) a series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Normal,
    Spike,
    Trend,
    HostDown,
    TooShort,
}

/// Result of one detector pass over a single series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub is_anomaly: bool,
    pub reason: Reason,
    pub confidence: f64,
    pub explanation: String,
}
