use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};

use crate::models::alert::{AlertState, AlertStatus, FiringEntry};
use crate::models::detection::{Detection, Reason};

/// On-disk persistence for the alert state. Reads tolerate a missing or
/// corrupt file (treated as empty state); writes go through a temp file and
/// rename so a crash never leaves a torn file behind.
pub struct AlertStore {
    path: PathBuf,
}

impl AlertStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load(&self) -> AlertState {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    tracing::warn!(
                        "alert state at {} unreadable ({e}), starting clean",
                        self.path.display()
                    );
                    AlertState::default()
                }
            },
            Err(_) => AlertState::default(),
        }
    }

    pub fn save(&self, state: &AlertState) -> anyhow::Result<()> {
        write_atomic(&self.path, &serde_json::to_vec(state)?)
    }
}

/// Write-to-temp then rename, so concurrent readers and the next cycle never
/// observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Per-series debouncing of raw detections into firing/repeating/resolved
/// transitions. Driven once per cycle per fingerprint, single-threaded.
#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    /// Ring length S: how many recent detection bits are kept.
    pub suppression_window: usize,
    /// M: anomalous bits within the ring required to fire.
    pub min_anomalies: usize,
    /// Minimum spacing between `repeating` emissions.
    pub repeat_interval_minutes: i64,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            suppression_window: 5,
            min_anomalies: 3,
            repeat_interval_minutes: 60,
        }
    }
}

impl StateMachine {
    pub fn with_repeat_interval(minutes: i64) -> Self {
        Self {
            repeat_interval_minutes: minutes,
            ..Self::default()
        }
    }

    /// Push the current detection bit and advance the fingerprint's state.
    /// Returns the transition to notify, if any.
    pub fn apply(
        &self,
        state: &mut AlertState,
        fingerprint: &str,
        detection: &Detection,
        now: DateTime<Utc>,
    ) -> Option<AlertStatus> {
        let window = state.windows.entry(fingerprint.to_string()).or_default();
        window.push(if detection.is_anomaly { 1 } else { 0 });
        if window.len() > self.suppression_window {
            let excess = window.len() - self.suppression_window;
            window.drain(..excess);
        }
        let bits = window.clone();

        let m = self.min_anomalies;
        if state.firing.contains_key(fingerprint) {
            // Resolve once the last M bits are all clear.
            if bits.len() >= m && bits[bits.len() - m..].iter().all(|&b| b == 0) {
                state.firing.remove(fingerprint);
                state
                    .windows
                    .insert(fingerprint.to_string(), vec![0; self.suppression_window]);
                return Some(AlertStatus::Resolved);
            }
            if detection.is_anomaly {
                let last_alert = state
                    .firing
                    .get(fingerprint)
                    .and_then(|e| parse_rfc3339(&e.last_alert_at))
                    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
                if now - last_alert >= Duration::minutes(self.repeat_interval_minutes) {
                    self.record_alert(state, fingerprint, detection, now);
                    return Some(AlertStatus::Repeating);
                }
            }
            return None;
        }

        let anomalous = bits.iter().filter(|&&b| b == 1).count();
        if anomalous >= m || detection.reason == Reason::HostDown {
            self.record_alert(state, fingerprint, detection, now);
            return Some(AlertStatus::Firing);
        }
        None
    }

    fn record_alert(
        &self,
        state: &mut AlertState,
        fingerprint: &str,
        detection: &Detection,
        now: DateTime<Utc>,
    ) {
        let stamp = now.to_rfc3339();
        state.firing.insert(
            fingerprint.to_string(),
            FiringEntry {
                last_detection: detection.clone(),
                last_alert_at: stamp.clone(),
            },
        );
        state.last_alert_at.insert(fingerprint.to_string(), stamp);
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detection(anomalous: bool) -> Detection {
        Detection {
            is_anomaly: anomalous,
            reason: if anomalous { Reason::Spike } else { Reason::Normal },
            confidence: if anomalous { 0.9 } else { 0.0 },
            explanation: "last=1.000, mean=0.000, std=0.100, z=10.00, slope=0.0000".to_string(),
        }
    }

    fn host_down() -> Detection {
        Detection {
            is_anomaly: true,
            reason: Reason::HostDown,
            confidence: 1.0,
            explanation: "CRITICAL: Host is DOWN (up=0).".to_string(),
        }
    }

    fn drive(bits: &[bool]) -> (AlertState, Vec<Option<AlertStatus>>) {
        let machine = StateMachine::default();
        let mut state = AlertState::default();
        let mut out = Vec::new();
        let mut now = Utc::now();
        for &b in bits {
            out.push(machine.apply(&mut state, "fp", &detection(b), now));
            now += Duration::minutes(5);
        }
        (state, out)
    }

    #[test]
    fn fires_on_three_of_five() {
        let (state, out) = drive(&[true, false, true, false, true]);
        assert_eq!(out, vec![None, None, None, None, Some(AlertStatus::Firing)]);
        assert!(state.firing.contains_key("fp"));
    }

    #[test]
    fn two_of_five_stays_silent() {
        let (state, out) = drive(&[true, false, true, false, false]);
        assert!(out.iter().all(Option::is_none));
        assert!(state.firing.is_empty());
    }

    #[test]
    fn host_down_short_circuits_the_window() {
        let machine = StateMachine::default();
        let mut state = AlertState::default();
        let got = machine.apply(&mut state, "fp", &host_down(), Utc::now());
        assert_eq!(got, Some(AlertStatus::Firing));
        assert!(state.firing.contains_key("fp"));
    }

    #[test]
    fn repeat_is_throttled_until_the_interval() {
        let machine = StateMachine::with_repeat_interval(60);
        let mut state = AlertState::default();
        let start = Utc::now();

        let mut now = start;
        for i in 0..3 {
            let got = machine.apply(&mut state, "fp", &detection(true), now);
            if i == 2 {
                assert_eq!(got, Some(AlertStatus::Firing));
            }
            now += Duration::minutes(5);
        }
        // Still inside the throttle: anomalous but silent.
        let got = machine.apply(&mut state, "fp", &detection(true), now);
        assert_eq!(got, None);
        // Exactly at the interval boundary: repeating fires.
        let fired_at = start + Duration::minutes(10);
        let got = machine.apply(&mut state, "fp", &detection(true), fired_at + Duration::minutes(60));
        assert_eq!(got, Some(AlertStatus::Repeating));
    }

    #[test]
    fn resolves_after_three_clear_bits_and_resets_window() {
        let machine = StateMachine::default();
        let mut state = AlertState::default();
        let mut now = Utc::now();
        for _ in 0..3 {
            machine.apply(&mut state, "fp", &detection(true), now);
            now += Duration::minutes(5);
        }
        assert!(state.firing.contains_key("fp"));

        let mut emitted = Vec::new();
        for _ in 0..5 {
            emitted.push(machine.apply(&mut state, "fp", &detection(false), now));
            now += Duration::minutes(5);
        }
        assert_eq!(
            emitted,
            vec![None, None, Some(AlertStatus::Resolved), None, None],
            "exactly one resolved, on the third clear cycle"
        );
        assert_eq!(state.windows["fp"], vec![0, 0, 0, 0, 0]);
        assert!(state.firing.is_empty());
    }

    #[test]
    fn reapplying_the_same_inputs_is_deterministic() {
        let machine = StateMachine::default();
        let now = Utc::now();
        let mut a = AlertState::default();
        let mut b = AlertState::default();
        let inputs = [true, true, true, false, false, false, true];
        let run = |state: &mut AlertState| {
            let mut t = now;
            let mut out = Vec::new();
            for &bit in &inputs {
                out.push(machine.apply(state, "fp", &detection(bit), t));
                t += Duration::minutes(5);
            }
            out
        };
        assert_eq!(run(&mut a), run(&mut b));
        assert_eq!(a.windows, b.windows);
    }

    #[test]
    fn corrupt_state_file_loads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts_state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let store = AlertStore::new(&path);
        let state = store.load();
        assert!(state.windows.is_empty());
        assert!(state.firing.is_empty());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AlertStore::new(dir.path().join("alerts_state.json"));
        let machine = StateMachine::default();
        let mut state = AlertState::default();
        machine.apply(&mut state, "fp", &host_down(), Utc::now());
        store.save(&state).unwrap();

        let loaded = store.load();
        assert!(loaded.firing.contains_key("fp"));
        assert_eq!(loaded.windows["fp"], vec![1]);
        assert!(loaded.last_alert_at.contains_key("fp"));
    }
}
