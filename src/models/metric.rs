use std::collections::BTreeMap;

/// Label name → value mapping for one series. Ordered so that iteration is
/// already in fingerprint order.
pub type LabelSet = BTreeMap<String, String>;

/// One row of the `metrics` table: a distinct series observed at least once.
#[derive(Debug, Clone)]
pub struct Metric {
    pub id: i64,
    pub fingerprint: String,
    pub job: Option<String>,
    pub instance: Option<String>,
    pub last_updated: String,
}

/// A single `(timestamp, value)` sample. `ds` is unix seconds; `y` may be NaN
/// for gap points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePoint {
    pub ds: i64,
    pub y: f64,
}

/// Canonical series identity: sorted `label=value` pairs joined by `|`.
/// Stable across cycles; primary key of all per-series state.
pub fn fingerprint(labels: &LabelSet) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Build a fully-qualified selector `name{k="v",…}` from a metric name and its
/// label set. `__name__` and empty values are dropped; with no labels left the
/// bare name is returned.
pub fn selector(metric_name: &str, labels: &LabelSet) -> String {
    let parts: Vec<String> = labels
        .iter()
        .filter(|(k, v)| k.as_str() != "__name__" && !v.is_empty())
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .collect();
    if parts.is_empty() {
        metric_name.to_string()
    } else {
        format!("{metric_name}{{{}}}", parts.join(","))
    }
}

/// Extract the metric name from a fingerprint, if it carries a `__name__` label.
pub fn metric_name_of(fingerprint: &str) -> Option<&str> {
    fingerprint
        .split('|')
        .find_map(|pair| pair.strip_prefix("__name__="))
}

/// Pull the `instance` label value out of a fingerprint for display; falls back
/// to the whole fingerprint when the label is absent.
pub fn instance_of(fingerprint: &str) -> &str {
    match fingerprint.split_once("|instance=") {
        Some((_, rest)) => rest.split('|').next().unwrap_or(rest),
        None => fingerprint,
    }
}
