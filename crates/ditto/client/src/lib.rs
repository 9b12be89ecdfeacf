use anyhow::{anyhow, Result};
use async_trait::async_trait;
use ditto_api::resource::GroupVersionResource;
use futures::{stream::BoxStream, StreamExt};
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{ListParams, Patch, PatchParams, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject},
    Api, Client, Resource, ResourceExt,
};
use tracing::{instrument, Level};

/// Field manager identity recorded against every server-side apply, so other
/// writers can coexist with the replicated fields.
pub const FIELD_MANAGER: &str = "ditto-operator";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    Added(String),
    Modified(String),
    Deleted(String),
}

/// A live watch; an `Err` item is a stream-level error event.
pub type ClusterEventStream = BoxStream<'static, Result<ClusterEvent>>;

/// The cluster API surface the replication engine consumes. Handles are
/// cheap to share and safe for concurrent use.
#[async_trait]
pub trait Cluster
where
    Self: Send + Sync + 'static,
{
    async fn list_namespaces(&self) -> Result<Vec<String>>;

    async fn watch_namespaces(&self) -> Result<ClusterEventStream>;

    async fn get_object(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject>;

    async fn watch_objects(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
    ) -> Result<ClusterEventStream>;

    /// Server-side apply with a forced takeover under [`FIELD_MANAGER`].
    async fn apply_object(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
        name: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject>;
}

#[derive(Clone)]
pub struct KubeCluster {
    kube: Client,
}

impl KubeCluster {
    /// Infers the connection the usual way: in-cluster service account or
    /// the local kubeconfig.
    pub async fn try_default() -> Result<Self> {
        Ok(Self {
            kube: Client::try_default()
                .await
                .map_err(|error| anyhow!("failed to create a kubernetes client: {error}"))?,
        })
    }

    pub fn new(kube: Client) -> Self {
        Self { kube }
    }

    fn api_dynamic(&self, resource: &GroupVersionResource, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.kube.clone(), namespace, &to_api_resource(resource))
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn list_namespaces(&self) -> Result<Vec<String>> {
        let api = Api::<Namespace>::all(self.kube.clone());
        Ok(api
            .list(&ListParams::default())
            .await
            .map_err(|error| anyhow!("failed to list namespaces: {error}"))?
            .items
            .into_iter()
            .map(|namespace| namespace.name_any())
            .collect())
    }

    async fn watch_namespaces(&self) -> Result<ClusterEventStream> {
        let api = Api::<Namespace>::all(self.kube.clone());
        let stream = api
            .watch(&WatchParams::default(), "0")
            .await
            .map_err(|error| anyhow!("failed to watch namespaces: {error}"))?;
        Ok(into_cluster_events(stream))
    }

    #[instrument(level = Level::INFO, skip(self), err(Display))]
    async fn get_object(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
        name: &str,
    ) -> Result<DynamicObject> {
        self.api_dynamic(resource, namespace)
            .get(name)
            .await
            .map_err(|error| anyhow!("failed to get {resource} {namespace}/{name}: {error}"))
    }

    async fn watch_objects(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
    ) -> Result<ClusterEventStream> {
        let stream = self
            .api_dynamic(resource, namespace)
            .watch(&WatchParams::default(), "0")
            .await
            .map_err(|error| anyhow!("failed to watch {resource} in {namespace}: {error}"))?;
        Ok(into_cluster_events(stream))
    }

    #[instrument(level = Level::INFO, skip(self, object), err(Display))]
    async fn apply_object(
        &self,
        resource: &GroupVersionResource,
        namespace: &str,
        name: &str,
        object: &DynamicObject,
    ) -> Result<DynamicObject> {
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        self.api_dynamic(resource, namespace)
            .patch(name, &pp, &Patch::Apply(object))
            .await
            .map_err(|error| anyhow!("failed to apply {resource} {namespace}/{name}: {error}"))
    }
}

fn into_cluster_events<K, S>(stream: S) -> ClusterEventStream
where
    K: Resource + Send + 'static,
    S: ::futures::Stream<Item = ::kube::Result<WatchEvent<K>>> + Send + 'static,
{
    stream
        .filter_map(|event| async move {
            match event {
                Ok(WatchEvent::Added(object)) => Some(Ok(ClusterEvent::Added(object.name_any()))),
                Ok(WatchEvent::Modified(object)) => {
                    Some(Ok(ClusterEvent::Modified(object.name_any())))
                }
                Ok(WatchEvent::Deleted(object)) => {
                    Some(Ok(ClusterEvent::Deleted(object.name_any())))
                }
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(error)) => Some(Err(anyhow!("watch error: {error}"))),
                Err(error) => Some(Err(anyhow!("watch stream failed: {error}"))),
            }
        })
        .boxed()
}

/// The replicated objects carry their own `apiVersion`/`kind` from the
/// source fetch, so only the URL-building fields matter here.
fn to_api_resource(resource: &GroupVersionResource) -> ApiResource {
    ApiResource {
        group: resource.group.clone(),
        version: resource.version.clone(),
        api_version: resource.api_version(),
        kind: String::default(),
        plural: resource.resource.clone(),
    }
}
