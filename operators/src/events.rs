//! Posting of Kubernetes events for operator transitions.

use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{Event, ObjectReference},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{Api, ObjectMeta, PostParams},
    Client, Resource, ResourceExt,
};
use tracing::error;

/// Post an event against the given resource, typically to indicate that
/// something happened. Events should not be used to "log" generic
/// information; they are GC-ed by k8s automatically. Failing to post one is
/// never worth failing a reconciliation over, so errors are only logged.
///
/// action:
///     What action was taken/failed regarding to the involved object.
/// reason:
///     This should be a short, machine understandable string that gives the
///     reason for the transition into the object's current status.
/// message:
///     A human-readable description of the status of this operation.
/// type_:
///     Type of this event (Normal, Warning).
pub async fn notify<K>(
    k8s: &Client,
    resource: &K,
    component: &str,
    action: &str,
    reason: &str,
    message: &str,
    type_: &str,
) where
    K: Resource<DynamicType = ()>,
{
    let ns = resource.namespace().expect("must be namespaced");
    let events: Api<Event> = Api::namespaced(k8s.clone(), &ns);
    let pp = PostParams::default();
    let time = Utc::now();

    let metadata = ObjectMeta {
        // the name must be unique for all events we post
        generate_name: Some(format!("{}.{:x}", resource.name(), time.timestamp())),
        namespace: Some(ns),
        ..Default::default()
    };

    let _ = events
        .create(
            &pp,
            &Event {
                event_time: Some(MicroTime(time)),
                involved_object: ObjectReference {
                    api_version: Some(K::api_version(&()).to_string()),
                    field_path: None,
                    kind: Some(K::kind(&()).to_string()),
                    name: Some(resource.name()),
                    namespace: resource.namespace(),
                    resource_version: resource.resource_version(),
                    uid: resource.uid(),
                },
                action: Some(action.into()),
                reason: Some(reason.into()),
                type_: Some(type_.into()),
                metadata,
                reporting_component: Some(component.to_string()),
                reporting_instance: Some(
                    std::env::var("MY_POD_NAME")
                        .ok()
                        .unwrap_or_else(|| component.to_string()),
                ),
                message: Some(message.into()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| error!(?e));
}
