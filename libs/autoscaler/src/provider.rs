//! Pluggable metric providers for the autoscaler.

use crate::crd::{MetricProviderKind, MetricSpec};

use vertiop_k8s_util::error::{Error, Result};

use serde::Deserialize;
use tokio::time::Duration;
use tracing::trace;

const METRIC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Deserialize)]
struct MetricResponse {
    value: f64,
}

/// Read the current metric value through the provider the spec selects.
pub async fn current_value(metric: &MetricSpec) -> Result<f64> {
    match metric.provider {
        MetricProviderKind::Static => metric
            .static_value
            .ok_or_else(|| Error::MissingData("static metric without staticValue".to_string())),
        MetricProviderKind::Http => {
            let endpoint = metric
                .endpoint
                .as_ref()
                .ok_or_else(|| Error::MissingData("http metric without endpoint".to_string()))?;
            let client = reqwest::Client::builder()
                .timeout(METRIC_TIMEOUT)
                .build()
                .map_err(|e| Error::ParseError(format!("failed to build metric client: {e}")))?;
            let mut request = client.get(endpoint);
            if let Some(query) = &metric.query {
                request = request.query(&[("query", query)]);
            }
            let response = request
                .send()
                .await
                .map_err(|e| Error::ExecTransient(format!("metric request to {endpoint}: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::ExecTransient(format!(
                    "metric provider returned {}",
                    response.status()
                )));
            }
            let parsed: MetricResponse = response
                .json()
                .await
                .map_err(|e| Error::ParseError(format!("invalid metric response: {e}")))?;
            trace!(msg = "read metric", value = parsed.value);
            Ok(parsed.value)
        }
    }
}

/// Desired subcluster size for a metric total: the per-node target divides
/// the total, rounded up, clamped into the configured bounds.
pub fn compute_desired_size(value: f64, target_average: f64, min: i32, max: i32) -> i32 {
    if target_average <= 0.0 {
        return min;
    }
    let desired = (value / target_average).ceil() as i32;
    desired.clamp(min, max)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compute_desired_size() {
        assert_eq!(compute_desired_size(100.0, 40.0, 1, 10), 3);
        assert_eq!(compute_desired_size(100.0, 100.0, 1, 10), 1);
        assert_eq!(compute_desired_size(0.0, 40.0, 2, 10), 2);
        // clamped into bounds
        assert_eq!(compute_desired_size(1000.0, 10.0, 1, 5), 5);
        assert_eq!(compute_desired_size(1.0, 40.0, 3, 10), 3);
        // degenerate target never divides by zero
        assert_eq!(compute_desired_size(100.0, 0.0, 2, 10), 2);
    }

    #[tokio::test]
    async fn test_static_provider() {
        let metric = MetricSpec {
            provider: MetricProviderKind::Static,
            static_value: Some(120.0),
            target_average_value: 40.0,
            ..Default::default()
        };
        assert_eq!(current_value(&metric).await.unwrap(), 120.0);
    }

    #[tokio::test]
    async fn test_static_provider_without_value() {
        let metric = MetricSpec {
            provider: MetricProviderKind::Static,
            target_average_value: 40.0,
            ..Default::default()
        };
        assert!(current_value(&metric).await.is_err());
    }

    #[tokio::test]
    async fn test_http_provider_without_endpoint() {
        let metric = MetricSpec {
            provider: MetricProviderKind::Http,
            target_average_value: 40.0,
            ..Default::default()
        };
        assert!(current_value(&metric).await.is_err());
    }
}
