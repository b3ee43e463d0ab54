//! Publishes events for objects for kubernetes >= 1.19
use std::hash::{Hash, Hasher};
use std::{collections::HashMap, sync::Arc};

use k8s_openapi::{
    api::{
        core::v1::ObjectReference,
        events::v1::{Event as K8sEvent, EventSeries},
    },
    apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta},
    jiff::{SignedDuration, Timestamp},
};
use kube::ResourceExt;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    Client,
};
use tokio::sync::RwLock;
use tracing::debug;

const EVENT_FINISH_TIME: SignedDuration = SignedDuration::from_mins(6);
const BURST_WINDOW: SignedDuration = SignedDuration::from_mins(1);

pub const DEFAULT_EVENT_BURST: usize = 100;

/// Minimal event type for publishing through [`Recorder::publish`].
///
/// All string fields must be human readable.
pub struct Event {
    /// The event severity.
    ///
    /// Shows up in `kubectl describe` as `Type`.
    pub type_: EventType,

    /// The short reason explaining why the `action` was taken, at most 128
    /// characters, generally in `PascalCase`. Shows up in `kubectl describe`
    /// as `Reason`.
    pub reason: String,

    /// An optional description of the status of the `action`, at most 1kB.
    /// Shows up in `kubectl describe` as `Message`.
    pub note: Option<String>,

    /// The action that was taken (either successfully or unsuccessfully)
    /// against the main object, at most 128 characters in `PascalCase`.
    pub action: String,

    /// Optional secondary object related to the main object, e.g. the
    /// StatefulSet a VerticaDB event concerns. Mapped to `related` in the
    /// events API.
    pub secondary: Option<ObjectReference>,
}

/// The event severity or type.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventType {
    /// An event took place - nothing to worry about.
    Normal,
    /// Something is not working as expected - it might be worth to have a look.
    Warning,
}

/// ObjectReference with Hash and Eq implementations
#[derive(Clone, Debug, PartialEq)]
pub struct Reference(ObjectReference);

impl Eq for Reference {}

impl Hash for Reference {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.api_version.hash(state);
        self.0.kind.hash(state);
        self.0.name.hash(state);
        self.0.namespace.hash(state);
        self.0.uid.hash(state);
    }
}

/// Isomorphic key for caching similar events
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub event_type: EventType,
    pub action: String,
    pub reason: String,
    pub reporting_controller: String,
    pub reporting_instance: Option<String>,
    pub regarding: Reference,
    pub related: Option<Reference>,
}

/// Information about the reporting controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Reporter {
    /// The name of the reporting controller that is publishing the event.
    pub controller: String,

    /// The id of the controller publishing the event, likely the pod name.
    /// Defaults to the hostname, falling back to the controller name.
    pub instance: Option<String>,
}

impl From<String> for Reporter {
    fn from(es: String) -> Self {
        Self {
            controller: es,
            instance: None,
        }
    }
}

impl From<&str> for Reporter {
    fn from(es: &str) -> Self {
        let instance = hostname::get().ok().and_then(|h| h.into_string().ok());
        Self {
            controller: es.into(),
            instance,
        }
    }
}

/// A publisher abstraction to emit Kubernetes' events.
///
/// Repeated identical events within a six minute window are folded into an
/// `EventSeries` instead of creating new objects. A rolling one-minute burst
/// limit caps how many events a single controller can emit so a crash-looping
/// reconcile cannot flood the apiserver.
#[derive(Clone)]
pub struct Recorder {
    client: Client,
    reporter: Reporter,
    burst: usize,
    events_cache: Arc<RwLock<HashMap<EventKey, K8sEvent>>>,
    burst_window: Arc<RwLock<(Timestamp, usize)>>,
}

impl Recorder {
    /// Create a new recorder with the default burst limit.
    #[must_use]
    pub fn new(client: Client, reporter: Reporter) -> Self {
        Self::with_burst(client, reporter, DEFAULT_EVENT_BURST)
    }

    #[must_use]
    pub fn with_burst(client: Client, reporter: Reporter, burst: usize) -> Self {
        Self {
            client,
            reporter,
            burst,
            events_cache: Arc::default(),
            burst_window: Arc::new(RwLock::new((Timestamp::now(), 0))),
        }
    }

    /// Builds unique event key based on reportingController, reportingInstance,
    /// regarding, reason and note
    fn get_event_key(&self, ev: &Event, regarding: &ObjectReference) -> EventKey {
        EventKey {
            event_type: ev.type_,
            action: ev.action.clone(),
            reason: ev.reason.clone(),
            reporting_controller: self.reporter.controller.clone(),
            reporting_instance: self.reporter.instance.clone(),
            regarding: Reference(regarding.clone()),
            related: ev.secondary.clone().map(Reference),
        }
    }

    fn generate_event(&self, ev: &Event, reference: &ObjectReference) -> K8sEvent {
        let now = Timestamp::now();
        K8sEvent {
            action: Some(ev.action.clone()),
            reason: Some(ev.reason.clone()),
            deprecated_count: None,
            deprecated_first_timestamp: None,
            deprecated_last_timestamp: None,
            deprecated_source: None,
            event_time: Some(MicroTime(now)),
            regarding: Some(reference.clone()),
            note: ev.note.clone().map(Into::into),
            metadata: ObjectMeta {
                namespace: reference.namespace.clone(),
                name: Some(format!(
                    "{}.{}",
                    reference.name.as_ref().unwrap_or(&self.reporter.controller),
                    now.as_second()
                )),
                ..Default::default()
            },
            reporting_controller: Some(self.reporter.controller.clone()),
            reporting_instance: Some(
                self.reporter
                    .instance
                    .clone()
                    .unwrap_or_else(|| self.reporter.controller.clone()),
            ),
            series: None,
            type_: match ev.type_ {
                EventType::Normal => Some("Normal".into()),
                EventType::Warning => Some("Warning".into()),
            },
            related: ev.secondary.clone(),
        }
    }

    async fn over_burst(&self) -> bool {
        let now = Timestamp::now();
        let mut window = self.burst_window.write().await;
        if now.duration_since(window.0) > BURST_WINDOW {
            *window = (now, 0);
        }
        window.1 += 1;
        window.1 > self.burst
    }

    /// Publish a new Kubernetes' event attached to `reference`.
    ///
    /// The event object is created in the namespace of the [`ObjectReference`]
    /// and requires `create`/`patch` on `events.k8s.io` events.
    pub async fn publish(&self, ev: &Event, reference: &ObjectReference) -> Result<(), kube::Error> {
        if self.over_burst().await {
            debug!(
                msg = "event burst limit reached, dropping event",
                reason = ev.reason
            );
            return Ok(());
        }
        let now = Timestamp::now();

        let key = self.get_event_key(ev, reference);
        let event = match self.events_cache.read().await.get(&key) {
            Some(e) => {
                let series = match &e.series {
                    Some(series) => EventSeries {
                        count: series.count + 1,
                        last_observed_time: MicroTime(now),
                    },
                    None => EventSeries {
                        count: 2,
                        last_observed_time: MicroTime(now),
                    },
                };
                let mut event = e.clone();
                event.series = Some(series);
                event
            }
            None => self.generate_event(ev, reference),
        };

        let events = Api::namespaced(
            self.client.clone(),
            reference
                .namespace
                .as_ref()
                .unwrap_or(&"default".to_string()),
        );
        if event.series.is_some() {
            events
                .patch(
                    &event.name_any(),
                    &PatchParams::default(),
                    &Patch::Merge(&event),
                )
                .await?;
        } else {
            events.create(&PostParams::default(), &event).await?;
        };

        {
            let mut cache = self.events_cache.write().await;
            cache.insert(key, event);
            cache.clone().iter().for_each(|(k, v)| {
                if let Some(series) = v.series.as_ref() {
                    if now.duration_since(series.last_observed_time.0) > EVENT_FINISH_TIME {
                        cache.remove(k);
                    }
                } else if let Some(event_time) = v.event_time.as_ref() {
                    if now.duration_since(event_time.0) > EVENT_FINISH_TIME {
                        cache.remove(k);
                    }
                }
            });
        }
        Ok(())
    }
}
