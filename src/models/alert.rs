use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::detection::Detection;

/// Process-wide alert state, persisted as `alerts_state.json` between cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertState {
    /// Per-fingerprint ring of recent detection bits (append-right, drop-left).
    #[serde(default)]
    pub windows: HashMap<String, Vec<u8>>,
    /// Fingerprints currently in the FIRING state.
    #[serde(default)]
    pub firing: HashMap<String, FiringEntry>,
    /// Last time any alert was emitted per fingerprint (redundant projection).
    #[serde(default)]
    pub last_alert_at: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiringEntry {
    pub last_detection: Detection,
    pub last_alert_at: String,
}

/// Kind of transition emitted by the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Firing,
    Repeating,
    Resolved,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Firing => "firing",
            AlertStatus::Repeating => "repeating",
            AlertStatus::Resolved => "resolved",
        }
    }
}

/// Metadata handed to every notification channel alongside the rendered body.
#[derive(Debug, Clone)]
pub struct AlertMeta {
    pub instance: String,
    pub severity: &'static str,
    pub status: AlertStatus,
    pub summary: String,
}

// ── Status snapshot (status.json) ──

#[derive(Debug, Serialize)]
pub struct StatusDoc {
    pub last_run: String,
    pub total_series: usize,
    pub metrics: Vec<MetricStatus>,
}

#[derive(Debug, Serialize)]
pub struct MetricStatus {
    pub fingerprint: String,
    pub job: Option<String>,
    pub instance: Option<String>,
    pub points_count: i64,
    pub stage: &'static str,
    pub is_unstable: bool,
    pub is_firing: bool,
}
