use std::{
    task::{Context, Poll},
    time::Instant,
};

use http::{Request, Response};
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tower::{Layer, Service};
use tracing::debug;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub endpoint: String,
    pub status: StatusLabel,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum StatusLabel {
    Ok,
    ClientError,
    ServerError,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub endpoint: String,
}

/// Metrics layer for monitoring HTTP requests against the apiserver
#[derive(Clone)]
pub struct MetricsLayer {
    request_count: Family<RequestLabels, Counter>,
    request_duration: Family<EndpointLabels, Histogram>,
}

impl MetricsLayer {
    pub fn new(registry: &mut Registry) -> Self {
        debug!("Initializing Kubernetes client metrics");
        let request_count = Family::<RequestLabels, Counter>::default();
        registry.register(
            "kubernetes_client_http_requests",
            "Total number of HTTP requests against the apiserver",
            request_count.clone(),
        );

        let request_duration = Family::<EndpointLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.05, 0.1, 0.5, 1.0].into_iter())
        });
        registry.register(
            "kubernetes_client_http_request_duration_seconds",
            "HTTP request duration against the apiserver in seconds",
            request_duration.clone(),
        );

        Self {
            request_count,
            request_duration,
        }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        MetricsService {
            inner: service,
            request_count: self.request_count.clone(),
            request_duration: self.request_duration.clone(),
        }
    }
}

#[derive(Clone)]
pub struct MetricsService<S> {
    inner: S,
    request_count: Family<RequestLabels, Counter>,
    request_duration: Family<EndpointLabels, Histogram>,
}

/// Reduce a request path to the resource collection it addresses so the
/// metric cardinality stays bounded: object names and namespaces are
/// dropped, group/version/kind segments are kept.
fn endpoint_template(path: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut segments = path.split('/').filter(|s| !s.is_empty()).peekable();
    while let Some(segment) = segments.next() {
        match segment {
            "namespaces" => {
                // skip the namespace name
                segments.next();
                kept.push("namespaces/{namespace}");
            }
            _ => kept.push(segment),
        }
    }
    // a trailing segment after the resource plural is an object name
    let resource_index = kept
        .iter()
        .rposition(|s| *s == "namespaces/{namespace}")
        .map(|i| i + 2)
        .unwrap_or(usize::MAX);
    if kept.len() > resource_index {
        kept.truncate(resource_index);
        kept.push("{name}");
    }
    format!("/{}", kept.join("/"))
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = MetricsFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let endpoint = url_escape::encode_path(&endpoint_template(req.uri().path())).to_string();
        let start = Instant::now();

        let future = self.inner.call(req);

        MetricsFuture {
            future,
            endpoint,
            start,
            request_count: self.request_count.clone(),
            request_duration: self.request_duration.clone(),
        }
    }
}

#[pin_project::pin_project]
pub struct MetricsFuture<F> {
    #[pin]
    future: F,
    endpoint: String,
    start: Instant,
    request_count: Family<RequestLabels, Counter>,
    request_duration: Family<EndpointLabels, Histogram>,
}

impl<F, ResBody, E> std::future::Future for MetricsFuture<F>
where
    F: std::future::Future<Output = Result<Response<ResBody>, E>>,
{
    type Output = F::Output;

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.future.poll(cx);

        if let Poll::Ready(Ok(response)) = &poll_result {
            let duration = this.start.elapsed().as_secs_f64();
            let status = if response.status().is_server_error() {
                StatusLabel::ServerError
            } else if response.status().is_client_error() {
                StatusLabel::ClientError
            } else {
                StatusLabel::Ok
            };

            this.request_count
                .get_or_create(&RequestLabels {
                    endpoint: this.endpoint.clone(),
                    status,
                })
                .inc();
            this.request_duration
                .get_or_create(&EndpointLabels {
                    endpoint: this.endpoint.clone(),
                })
                .observe(duration);
        }

        poll_result
    }
}

#[cfg(test)]
mod test {
    use super::endpoint_template;

    #[test]
    fn test_endpoint_template_collection() {
        assert_eq!(
            endpoint_template("/apis/apps/v1/namespaces/default/statefulsets"),
            "/apis/apps/v1/namespaces/{namespace}/statefulsets"
        );
    }

    #[test]
    fn test_endpoint_template_object() {
        assert_eq!(
            endpoint_template("/apis/apps/v1/namespaces/default/statefulsets/mydb-sc1"),
            "/apis/apps/v1/namespaces/{namespace}/statefulsets/{name}"
        );
    }

    #[test]
    fn test_endpoint_template_cluster_scope() {
        assert_eq!(endpoint_template("/api/v1/nodes"), "/api/v1/nodes");
    }
}
