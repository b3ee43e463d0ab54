use vertiop_autoscaler::crd::VerticaAutoscaler;

use kube::runtime::reflector::Store;

/// Shared caches backing the cross-object validations.
#[derive(Clone)]
pub struct WebhookState {
    pub autoscaler_store: Store<VerticaAutoscaler>,
}

impl WebhookState {
    pub fn new(autoscaler_store: Store<VerticaAutoscaler>) -> Self {
        Self { autoscaler_store }
    }
}
