use std::collections::BTreeMap;
use std::time::Duration;

use regex::Regex;

use crate::models::metric::{LabelSet, SamplePoint};

const INSTANT_TIMEOUT: Duration = Duration::from_secs(10);
const RANGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure at the metric-source boundary. Per-task errors skip the metric for
/// the cycle; a discovery failure skips the whole cycle.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("prometheus api error: {0}")]
    Api(String),
}

#[derive(Debug, serde::Deserialize)]
struct ApiResponse<T> {
    status: String,
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, serde::Deserialize)]
struct VectorData {
    result: Vec<VectorResult>,
}

#[derive(Debug, serde::Deserialize)]
struct VectorResult {
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

#[derive(Debug, Default, serde::Deserialize)]
struct MatrixData {
    result: Vec<MatrixSeries>,
}

#[derive(Debug, serde::Deserialize)]
struct MatrixSeries {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

/// Current value of one series matching an instant query.
#[derive(Debug, Clone)]
pub struct InstantSample {
    pub labels: LabelSet,
    pub ds: i64,
    pub y: f64,
}

/// All samples returned for one series of a range query.
#[derive(Debug, Clone)]
pub struct RangeSeries {
    pub labels: LabelSet,
    pub samples: Vec<SamplePoint>,
}

pub struct PrometheusClient {
    base_url: String,
    http: reqwest::Client,
}

impl PrometheusClient {
    /// `base_url` without a scheme is assumed to be `http://`.
    pub fn new(base_url: &str, verify_ssl: bool) -> anyhow::Result<Self> {
        let base = if base_url.starts_with("http://") || base_url.starts_with("https://") {
            base_url.to_string()
        } else {
            format!("http://{base_url}")
        };
        let base = base.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .build()?;
        tracing::info!("prometheus client initialized at {base} (tls verify: {verify_ssl})");
        Ok(Self {
            base_url: base,
            http,
        })
    }

    /// All metric names known to the TSDB, filtered by the anchored pattern.
    /// An empty result is not an error; a transport or API failure is.
    pub async fn discover_metrics(&self, pattern: &Regex) -> Result<Vec<String>, SourceError> {
        let url = format!("{}/api/v1/label/__name__/values", self.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(INSTANT_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let body: ApiResponse<Vec<String>> = resp.json().await?;
        let names = check(body)?;
        Ok(names.into_iter().filter(|n| pattern.is_match(n)).collect())
    }

    /// Current value of every series matching `query`.
    pub async fn fetch_instant(&self, query: &str) -> Result<Vec<InstantSample>, SourceError> {
        let url = format!("{}/api/v1/query", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[("query", query)])
            .timeout(INSTANT_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let body: ApiResponse<VectorData> = resp.json().await?;
        let data = check(body)?;
        Ok(data
            .result
            .into_iter()
            .map(|r| InstantSample {
                labels: r.metric,
                ds: r.value.0 as i64,
                y: r.value.1.parse().unwrap_or(f64::NAN),
            })
            .collect())
    }

    /// Range query over `[start, end]` at `step`, one entry per distinct series.
    /// Unparseable sample values are coerced to NaN rather than dropped.
    pub async fn fetch_range(
        &self,
        query: &str,
        start: i64,
        end: i64,
        step: &str,
    ) -> Result<Vec<RangeSeries>, SourceError> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("query", query),
                ("start", &start.to_string()),
                ("end", &end.to_string()),
                ("step", step),
            ])
            .timeout(RANGE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        let body: ApiResponse<MatrixData> = resp.json().await?;
        let data = check(body)?;
        Ok(data
            .result
            .into_iter()
            .map(|s| RangeSeries {
                labels: s.metric,
                samples: s
                    .values
                    .into_iter()
                    .map(|(ts, v)| SamplePoint {
                        ds: ts as i64,
                        y: v.parse().unwrap_or(f64::NAN),
                    })
                    .collect(),
            })
            .collect())
    }
}

fn check<T>(body: ApiResponse<T>) -> Result<T, SourceError> {
    if body.status != "success" {
        return Err(SourceError::Api(
            body.error.unwrap_or_else(|| "query failed".to_string()),
        ));
    }
    body.data
        .ok_or_else(|| SourceError::Api("missing data field".to_string()))
}
