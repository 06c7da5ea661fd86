use std::collections::HashMap;

use crate::models::detection::{Detection, Reason};
use crate::models::metric::metric_name_of;

struct Family {
    name: &'static str,
    impact: &'static str,
    action: &'static str,
}

/// Map a metric name substring to a human-readable family with an impact
/// statement and a prescriptive action hint. Notification-layer concern; the
/// detector knows nothing about metric families.
fn family_of(metric_name: &str) -> Family {
    if metric_name == "up" || metric_name.starts_with("up_") {
        Family {
            name: "Server liveness",
            impact: "The host is not responding; every service on it is unreachable.",
            action: "Check power and network connectivity, or restart the node.",
        }
    } else if metric_name.contains("cpu") {
        Family {
            name: "CPU usage",
            impact: "Applications slow down and may become unresponsive.",
            action: "Inspect the busiest processes (top/htop).",
        }
    } else if metric_name.contains("memory") {
        Family {
            name: "Available memory",
            impact: "The system risks out-of-memory kills.",
            action: "Free memory or investigate a possible leak.",
        }
    } else if metric_name.contains("filesystem") {
        Family {
            name: "Disk space",
            impact: "Writes may start failing; databases and logs can corrupt.",
            action: "Remove old logs or grow the volume.",
        }
    } else if metric_name.contains("network") {
        Family {
            name: "Network throughput",
            impact: "Service latency or packet loss is likely.",
            action: "Check interface saturation and recent traffic spikes.",
        }
    } else {
        Family {
            name: "System metric",
            impact: "Service degradation or interruption is possible.",
            action: "Check system logs and the state of running services.",
        }
    }
}

/// Parse the detector's canonical `k=v, k=v, ...` explanation string. The
/// host-down prefix sentence is tolerated and skipped.
fn parse_explanation(explanation: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    for part in explanation.split(", ") {
        for piece in part.split(". ") {
            if let Some((k, v)) = piece.split_once('=') {
                fields.insert(k.trim().to_lowercase(), v.trim().to_string());
            }
        }
    }
    fields
}

/// Render the HTML alert body for a detection: headline, current value vs.
/// baseline, impact, action hint, confidence footer.
pub fn render_alert(fingerprint: &str, detection: &Detection) -> String {
    let fields = parse_explanation(&detection.explanation);
    let last = fields.get("last").map(String::as_str).unwrap_or("N/A");
    let mean = fields.get("mean").map(String::as_str).unwrap_or("N/A");
    let std = fields.get("std").map(String::as_str).unwrap_or("N/A");

    let metric_name = metric_name_of(fingerprint).unwrap_or(fingerprint);
    let family = family_of(metric_name);

    let (title, status_text) = if detection.reason == Reason::HostDown {
        (
            "❌ SERVER NOT RESPONDING".to_string(),
            format!("Current value: {last} (expected 1 for a live target)"),
        )
    } else {
        (
            format!("⚠️ ANOMALY: {}", family.name.to_uppercase()),
            format!("Current value: {last}"),
        )
    };

    format!(
        "<b>{title}</b>\n\n\
         📍 <b>Current state:</b> {status_text}\n\
         📉 <b>Expected baseline:</b> ~{mean} (±{std})\n\
         🔥 <b>Impact:</b> {impact}\n\
         🛡️ <b>Action:</b> {action}\n\n\
         <i>-- confidence {confidence:.0}% --</i>",
        impact = family.impact,
        action = family.action,
        confidence = detection.confidence * 100.0,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_explanation() {
        let fields =
            parse_explanation("last=85.500, mean=20.200, std=5.100, z=12.80, slope=0.5000");
        assert_eq!(fields.get("last").map(String::as_str), Some("85.500"));
        assert_eq!(fields.get("slope").map(String::as_str), Some("0.5000"));
    }

    #[test]
    fn parses_host_down_prefixed_explanation() {
        let fields = parse_explanation(
            "CRITICAL: Host is DOWN (up=0). last=0.000, mean=1.000, std=0.000, z=0.00, slope=0.0000",
        );
        assert_eq!(fields.get("last").map(String::as_str), Some("0.000"));
        assert_eq!(fields.get("mean").map(String::as_str), Some("1.000"));
    }

    #[test]
    fn host_down_gets_liveness_headline() {
        let detection = Detection {
            is_anomaly: true,
            reason: Reason::HostDown,
            confidence: 1.0,
            explanation:
                "CRITICAL: Host is DOWN (up=0). last=0.000, mean=1.000, std=0.000, z=0.00, slope=0.0000"
                    .to_string(),
        };
        let body = render_alert("__name__=up|instance=h1|job=node", &detection);
        assert!(body.contains("SERVER NOT RESPONDING"));
        assert!(body.contains("Current value: 0.000"));
        assert!(body.contains("confidence 100%"));
    }

    #[test]
    fn metric_families_pick_the_right_hint() {
        let detection = Detection {
            is_anomaly: true,
            reason: Reason::Trend,
            confidence: 0.92,
            explanation: "last=1024.000, mean=5000.000, std=100.000, z=39.76, slope=-500.0000"
                .to_string(),
        };
        let body = render_alert(
            "__name__=node_filesystem_avail_bytes|instance=h1",
            &detection,
        );
        assert!(body.contains("DISK SPACE"));
        assert!(body.contains("grow the volume"));
    }

    #[test]
    fn cpu_family_is_not_confused_with_liveness() {
        assert_eq!(family_of("node_cpu_seconds_total").name, "CPU usage");
        assert_eq!(family_of("up").name, "Server liveness");
        assert_eq!(family_of("go_goroutines").name, "System metric");
    }
}
