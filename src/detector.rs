use crate::models::detection::{Detection, Reason};
use crate::models::metric::SamplePoint;

/// How many trailing points feed the trend fit.
const TREND_WINDOW: usize = 20;
/// Minimum series length the statistics are meaningful for.
const MIN_POINTS: usize = 5;

/// Per-series statistical detector. Pure: no I/O, no shared state; safe to run
/// inline inside the worker tasks.
#[derive(Debug, Clone, Copy)]
pub struct Detector {
    contamination: f64,
}

impl Detector {
    pub fn new(contamination: f64) -> Self {
        Self { contamination }
    }

    /// Run detection over an ordered sample sequence. The fingerprint is only
    /// consulted for the liveness guard on `up` series.
    pub fn detect(&self, points: &[SamplePoint], fingerprint: Option<&str>) -> Detection {
        let ys = preprocess(points);
        let n = ys.len();
        if n < MIN_POINTS {
            return Detection {
                is_anomaly: false,
                reason: Reason::TooShort,
                confidence: 0.0,
                explanation: format!("series too short for detection (n={n})"),
            };
        }

        let last = ys[n - 1];
        let hist: Vec<f64> = ys[..n - 1].iter().copied().filter(|v| !v.is_nan()).collect();
        let (mean, std) = if hist.len() >= 3 {
            mean_std(&hist)
        } else {
            let all: Vec<f64> = ys.iter().copied().filter(|v| !v.is_nan()).collect();
            mean_std(&all)
        };

        let z = if std > 0.0 {
            ((last - mean) / std).abs()
        } else if (last - mean).abs() > 0.0 {
            // A perfectly flat baseline: any deviation is a spike.
            10.0
        } else {
            0.0
        };

        let z_threshold = if self.contamination <= 0.01 {
            2.0
        } else if self.contamination <= 0.02 {
            2.5
        } else {
            3.0
        };

        let mut confidence = (z / 6.0).min(1.0);

        let window = n.min(TREND_WINDOW);
        let tail = &ys[n - window..];
        let slope = least_squares_slope(tail);
        let tail_mag = tail
            .iter()
            .filter(|v| !v.is_nan())
            .map(|v| v.abs())
            .sum::<f64>()
            / tail.iter().filter(|v| !v.is_nan()).count().max(1) as f64;

        let is_spike = z >= z_threshold;
        let is_trend = slope.abs() > 0.1 * tail_mag.max(1.0);

        let mut is_anomaly = is_spike || is_trend;
        let mut reason = if is_spike {
            Reason::Spike
        } else if is_trend {
            Reason::Trend
        } else {
            Reason::Normal
        };
        let mut explanation = format!(
            "last={last:.3}, mean={mean:.3}, std={std:.3}, z={z:.2}, slope={slope:.4}"
        );

        // Liveness guard: up=0 is a hard fault no matter what the stats say.
        if fingerprint.is_some_and(is_liveness_fingerprint) && last == 0.0 {
            is_anomaly = true;
            reason = Reason::HostDown;
            confidence = 1.0;
            explanation = format!("CRITICAL: Host is DOWN (up=0). {explanation}");
        }

        if is_spike && reason != Reason::HostDown {
            confidence = confidence.max((0.3 + z / 4.0).min(1.0));
        }
        if is_trend && reason != Reason::HostDown {
            confidence = confidence.max((slope.abs() / (1.0 + mean.abs())).min(1.0));
        }

        Detection {
            is_anomaly,
            reason,
            confidence,
            explanation,
        }
    }
}

/// True when the fingerprint identifies the binary liveness metric `up`.
fn is_liveness_fingerprint(fingerprint: &str) -> bool {
    fingerprint.starts_with("__name__=up|")
        || fingerprint == "up"
        || fingerprint.contains("|__name__=up|")
}

/// Fill gaps by linear interpolation weighted on the timestamps, then back-
/// and forward-fill whatever is left at the boundaries. A series with no
/// numeric values at all is returned untouched.
fn preprocess(points: &[SamplePoint]) -> Vec<f64> {
    let mut ys: Vec<f64> = points.iter().map(|p| p.y).collect();
    if !ys.iter().any(|v| v.is_nan()) {
        return ys;
    }

    let known: Vec<usize> = (0..ys.len()).filter(|&i| !ys[i].is_nan()).collect();
    if known.is_empty() {
        return ys;
    }

    for i in 0..ys.len() {
        if !ys[i].is_nan() {
            continue;
        }
        let prev = known.iter().rev().find(|&&k| k < i).copied();
        let next = known.iter().find(|&&k| k > i).copied();
        ys[i] = match (prev, next) {
            (Some(p), Some(q)) => {
                let span = (points[q].ds - points[p].ds) as f64;
                if span > 0.0 {
                    let frac = (points[i].ds - points[p].ds) as f64 / span;
                    ys[p] + (ys[q] - ys[p]) * frac
                } else {
                    ys[p]
                }
            }
            (None, Some(q)) => ys[q],
            (Some(p), None) => ys[p],
            (None, None) => ys[i],
        };
    }
    ys
}

/// Population mean and standard deviation; NaN for an empty slice.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Slope of the least-squares line over `values` with x = 0..n.
fn least_squares_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = values.iter().sum::<f64>() / n as f64;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    if den == 0.0 { 0.0 } else { num / den }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Sine baseline plus bounded noise, n points at 5m spacing ending now-ish.
    fn synthetic(n: usize, seed: u64) -> Vec<SamplePoint> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|i| {
                let x = 4.0 * std::f64::consts::PI * i as f64 / n as f64;
                SamplePoint {
                    ds: 1_700_000_000 + (i as i64) * 300,
                    y: 10.0 * x.sin() + 50.0 + rng.random_range(-1.0..1.0),
                }
            })
            .collect()
    }

    #[test]
    fn stable_on_noise() {
        let detector = Detector::new(0.05);
        let result = detector.detect(&synthetic(300, 7), None);
        assert!(!result.is_anomaly, "noise flagged: {}", result.explanation);
        assert_eq!(result.reason, Reason::Normal);
    }

    #[test]
    fn detects_spike() {
        let detector = Detector::new(0.01);
        let mut points = synthetic(300, 7);
        points.last_mut().unwrap().y += 20.0;
        let result = detector.detect(&points, None);
        assert!(result.is_anomaly);
        assert_eq!(result.reason, Reason::Spike);
        assert!(result.confidence > 0.5, "confidence {}", result.confidence);
    }

    #[test]
    fn detects_trend() {
        let detector = Detector::new(0.01);
        let mut points = synthetic(300, 7);
        let n = points.len();
        for (j, p) in points[n - 10..].iter_mut().enumerate() {
            p.y -= 15.0 * j as f64 / 9.0;
        }
        // Pin the endpoint to the trend floor so the check is seed-independent.
        points[n - 1].y = 34.0;
        let result = detector.detect(&points, None);
        assert!(result.is_anomaly, "trend missed: {}", result.explanation);
        assert!(matches!(result.reason, Reason::Spike | Reason::Trend));
    }

    #[test]
    fn tolerates_gaps_without_false_positive() {
        let detector = Detector::new(0.05);
        let mut rng = StdRng::seed_from_u64(11);
        let mut points = synthetic(300, 7);
        for p in points.iter_mut() {
            if rng.random_range(0.0..1.0) < 0.1 {
                p.y = f64::NAN;
            }
        }
        // The last point must stay numeric for the test to be meaningful.
        let n = points.len();
        points[n - 1].y = 50.0;
        let result = detector.detect(&points, None);
        assert!(!result.is_anomaly, "gaps flagged: {}", result.explanation);
    }

    #[test]
    fn short_series_abstains() {
        let detector = Detector::new(0.05);
        let points = synthetic(4, 7);
        let result = detector.detect(&points, Some("__name__=up|instance=h1"));
        assert!(!result.is_anomaly);
        assert_eq!(result.reason, Reason::TooShort);
        assert_eq!(result.confidence, 0.0);
    }

    #[test]
    fn liveness_override_fires_on_zero() {
        let detector = Detector::new(0.05);
        let mut points: Vec<SamplePoint> = (0..50)
            .map(|i| SamplePoint { ds: i * 300, y: 1.0 })
            .collect();
        points.last_mut().unwrap().y = 0.0;
        let result = detector.detect(&points, Some("__name__=up|instance=h1|job=node"));
        assert!(result.is_anomaly);
        assert_eq!(result.reason, Reason::HostDown);
        assert_eq!(result.confidence, 1.0);
        assert!(result.explanation.starts_with("CRITICAL: Host is DOWN (up=0)."));
    }

    #[test]
    fn liveness_metric_up_is_not_flagged() {
        let detector = Detector::new(0.05);
        let points: Vec<SamplePoint> = (0..50)
            .map(|i| SamplePoint { ds: i * 300, y: 1.0 })
            .collect();
        let result = detector.detect(&points, Some("__name__=up|instance=h1"));
        assert!(!result.is_anomaly);
    }

    #[test]
    fn flat_baseline_forces_spike_on_any_change() {
        let detector = Detector::new(0.05);
        let mut points: Vec<SamplePoint> = (0..100)
            .map(|i| SamplePoint { ds: i * 300, y: 5.0 })
            .collect();
        points.last_mut().unwrap().y = 6.0;
        let result = detector.detect(&points, None);
        assert!(result.is_anomaly);
        assert_eq!(result.reason, Reason::Spike);
    }

    #[test]
    fn explanation_has_canonical_form() {
        let detector = Detector::new(0.05);
        let points: Vec<SamplePoint> = (0..30)
            .map(|i| SamplePoint { ds: i * 300, y: 5.0 })
            .collect();
        let result = detector.detect(&points, None);
        assert_eq!(
            result.explanation,
            "last=5.000, mean=5.000, std=0.000, z=0.00, slope=0.0000"
        );
    }

    #[test]
    fn interpolation_is_time_weighted() {
        // Gap at an uneven timestamp: value must follow the time fraction.
        let points = vec![
            SamplePoint { ds: 0, y: 0.0 },
            SamplePoint { ds: 300, y: f64::NAN },
            SamplePoint { ds: 1200, y: 12.0 },
        ];
        let ys = preprocess(&points);
        assert!((ys[1] - 3.0).abs() < 1e-9);
    }

    #[test]
    fn boundary_nans_are_filled() {
        let points = vec![
            SamplePoint { ds: 0, y: f64::NAN },
            SamplePoint { ds: 300, y: 2.0 },
            SamplePoint { ds: 600, y: 4.0 },
            SamplePoint { ds: 900, y: f64::NAN },
        ];
        let ys = preprocess(&points);
        assert_eq!(ys, vec![2.0, 2.0, 4.0, 4.0]);
    }
}
