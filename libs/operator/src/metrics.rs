use crate::controller::ControllerId;

use std::collections::HashMap;
use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use tokio::time::Instant;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ControllerLabels {
    controller: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ObjectLabels {
    controller: &'static str,
    namespace: String,
    name: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SubclusterLabels {
    namespace: String,
    name: String,
    subcluster: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct AdminActionLabels {
    action: String,
    outcome: AdminOutcome,
}

/// Outcome of an administrative action against the database, as exposed on
/// the metrics endpoint.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum AdminOutcome {
    Success,
    AlreadyDone,
    Retryable,
    Fatal,
}

pub struct Metrics {
    pub registry: Arc<Registry>,
    pub controllers: HashMap<ControllerId, Arc<ControllerMetrics>>,
}

impl Metrics {
    pub fn new(mut registry: Registry, controller_names: &[&'static str]) -> Self {
        let shared = SharedMetrics::register(&mut registry);
        let controllers = controller_names
            .iter()
            .map(|&id| (id, Arc::new(ControllerMetrics::new(id, shared.clone()))))
            .collect::<HashMap<ControllerId, Arc<ControllerMetrics>>>();

        Self {
            registry: Arc::new(registry),
            controllers,
        }
    }
}

/// Metric families are registered once and shared; each controller binds its
/// own label set.
#[derive(Clone)]
struct SharedMetrics {
    reconcile_operations: Family<ControllerLabels, Counter>,
    reconcile_failures: Family<ControllerLabels, Counter>,
    reconcile_duration: Family<ControllerLabels, Histogram>,
    status_update_errors: Family<ControllerLabels, Counter>,
    watch_operations_failed: Family<ControllerLabels, Counter>,
    ready: Family<ControllerLabels, Gauge>,
    subcluster_size: Family<SubclusterLabels, Gauge>,
    subcluster_up_nodes: Family<SubclusterLabels, Gauge>,
    admin_actions: Family<AdminActionLabels, Counter>,
}

impl SharedMetrics {
    fn register(registry: &mut Registry) -> Self {
        let reconcile_operations = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "reconcile_operations",
            "Total number of reconcile operations",
            reconcile_operations.clone(),
        );

        let reconcile_failures = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "reconcile_failures",
            "Number of errors that occurred during reconcile operations",
            reconcile_failures.clone(),
        );

        let reconcile_duration = Family::<ControllerLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.1, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter())
        });
        registry.register(
            "reconcile_duration_seconds",
            "Histogram of reconcile operations",
            reconcile_duration.clone(),
        );

        let status_update_errors = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "status_update_errors",
            "Number of errors that occurred during update operations to status subresources",
            status_update_errors.clone(),
        );

        let watch_operations_failed = Family::<ControllerLabels, Counter>::default();
        registry.register(
            "watch_operations_failed",
            "Total number of watch operations that failed",
            watch_operations_failed.clone(),
        );

        let ready = Family::<ControllerLabels, Gauge>::default();
        registry.register(
            "ready",
            "1 when the controller is ready to reconcile resources, 0 otherwise",
            ready.clone(),
        );

        let subcluster_size = Family::<SubclusterLabels, Gauge>::default();
        registry.register(
            "subcluster_size",
            "Number of desired pods per subcluster",
            subcluster_size.clone(),
        );

        let subcluster_up_nodes = Family::<SubclusterLabels, Gauge>::default();
        registry.register(
            "subcluster_up_nodes",
            "Number of database nodes that are up per subcluster",
            subcluster_up_nodes.clone(),
        );

        let admin_actions = Family::<AdminActionLabels, Counter>::default();
        registry.register(
            "admin_actions",
            "Administrative actions against the database by action and outcome",
            admin_actions.clone(),
        );

        Self {
            reconcile_operations,
            reconcile_failures,
            reconcile_duration,
            status_update_errors,
            watch_operations_failed,
            ready,
            subcluster_size,
            subcluster_up_nodes,
            admin_actions,
        }
    }
}

#[derive(Clone)]
pub struct ControllerMetrics {
    controller: &'static str,
    shared: SharedMetrics,
}

impl ControllerMetrics {
    fn new(controller: &'static str, shared: SharedMetrics) -> Self {
        Self { controller, shared }
    }

    fn labels(&self) -> ControllerLabels {
        ControllerLabels {
            controller: self.controller,
        }
    }

    pub fn reconcile_failure_inc(&self) {
        self.shared
            .reconcile_failures
            .get_or_create(&self.labels())
            .inc();
    }

    pub fn reconcile_count_and_measure(&self) -> ReconcileMeasurer {
        self.shared
            .reconcile_operations
            .get_or_create(&self.labels())
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: self.labels(),
            metric: self.shared.reconcile_duration.clone(),
        }
    }

    pub fn status_update_errors_inc(&self) {
        self.shared
            .status_update_errors
            .get_or_create(&self.labels())
            .inc();
    }

    pub fn watch_operations_failed_inc(&self) {
        self.shared
            .watch_operations_failed
            .get_or_create(&self.labels())
            .inc();
    }

    pub fn ready_set(&self, status: i64) {
        self.shared.ready.get_or_create(&self.labels()).set(status);
    }

    pub fn subcluster_size_set(&self, namespace: &str, name: &str, subcluster: &str, size: i32) {
        self.shared
            .subcluster_size
            .get_or_create(&SubclusterLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                subcluster: subcluster.to_string(),
            })
            .set(size as i64);
    }

    pub fn subcluster_up_nodes_set(&self, namespace: &str, name: &str, subcluster: &str, up: i32) {
        self.shared
            .subcluster_up_nodes
            .get_or_create(&SubclusterLabels {
                namespace: namespace.to_string(),
                name: name.to_string(),
                subcluster: subcluster.to_string(),
            })
            .set(up as i64);
    }

    pub fn admin_action_inc(&self, action: &str, outcome: AdminOutcome) {
        self.shared
            .admin_actions
            .get_or_create(&AdminActionLabels {
                action: action.to_string(),
                outcome,
            })
            .inc();
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        let mut registry = Registry::default();
        ControllerMetrics::new("test", SharedMetrics::register(&mut registry))
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: ControllerLabels,
    metric: Family<ControllerLabels, Histogram>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.metric.get_or_create(&self.labels).observe(duration);
    }
}

#[cfg(test)]
mod test {
    use super::Metrics;
    use prometheus_client::registry::Registry;

    #[test]
    fn test_all_controller_ids_registered() {
        let metrics = Metrics::new(Registry::default(), &["verticadb", "sandbox"]);
        assert!(metrics.controllers.contains_key("verticadb"));
        assert!(metrics.controllers.contains_key("sandbox"));
        metrics.controllers["verticadb"].reconcile_failure_inc();
        metrics.controllers["verticadb"].admin_action_inc(
            "create_db",
            super::AdminOutcome::Success,
        );
    }
}
