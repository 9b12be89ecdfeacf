use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Result};
use ditto_api::task::Task;
use ditto_client::{Cluster, ClusterEvent};
use futures::{future, StreamExt};
use kube::core::{DynamicObject, ObjectMeta};
use tokio::{
    sync::mpsc::{self, Sender},
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Level};
use uuid::Uuid;

/// Fallback full pass when no trigger arrives, guarding against missed
/// watch events.
const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
/// Pause between watch reconnect attempts.
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// One reconcile request. Carried on a capacity-1 channel: while a pass is
/// running, at most one trigger is buffered and the coordinator blocks on
/// send, coalescing event bursts into a single follow-up pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// Rescan every matching destination namespace.
    FullSync,
    /// Reconcile a single newly-matched namespace.
    Namespace(String),
}

/// The replication engine for one task: a watch coordinator feeding a serial
/// reconcile loop. Never shared; the version cache has a single writer.
pub struct Session {
    id: Uuid,
    task: Arc<Task>,
    cluster: Arc<dyn Cluster>,
    /// destination namespace -> last successfully applied source resourceVersion
    versions: HashMap<String, String>,
}

impl Session {
    pub fn new(task: Task, cluster: Arc<dyn Cluster>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task: Arc::new(task),
            cluster,
            versions: HashMap::new(),
        }
    }

    /// Runs reconcile passes until `token` is cancelled. Passes are strictly
    /// serialized; a failed pass is logged and retried on the next trigger
    /// or idle timeout.
    #[instrument(level = Level::INFO, skip_all, fields(
        session = %self.id,
        resource = %self.task.resource,
        source_namespace = %self.task.source_namespace,
        source_name = %self.task.source_name,
    ))]
    pub async fn run(mut self, token: CancellationToken) {
        let (triggers, mut requests) = mpsc::channel(1);
        let coordinator = tokio::spawn(watch(
            self.id,
            self.task.clone(),
            self.cluster.clone(),
            triggers,
            token.child_token(),
        ));

        info!("session started");

        loop {
            let trigger = tokio::select! {
                () = token.cancelled() => break,
                trigger = requests.recv() => match trigger {
                    Some(trigger) => trigger,
                    None => break,
                },
                () = sleep(IDLE_TIMEOUT) => Trigger::FullSync,
            };

            if let Err(error) = self.reconcile(&trigger).await {
                warn!("reconcile error: {error}");
            }
        }

        drop(requests);
        coordinator.await.ok();
        info!("session stopped");
    }

    /// One reconcile pass. A destination failure is isolated to that
    /// destination; only a source-side failure aborts the pass.
    pub async fn reconcile(&mut self, trigger: &Trigger) -> Result<()> {
        let namespaces = match trigger {
            Trigger::Namespace(namespace) => vec![namespace.clone()],
            Trigger::FullSync => self.destination_namespaces().await?,
        };

        let (source, version) = self.fetch_source().await?;

        for namespace in namespaces {
            if self.versions.get(&namespace) == Some(&version) {
                continue;
            }

            match self.replicate(&source, &namespace).await {
                Ok(()) => {
                    self.versions.insert(namespace, version.clone());
                }
                Err(error) => {
                    warn!(
                        "failed to replicate into {namespace}/{name}: {error}",
                        name = self.task.target_name,
                    );
                }
            }
        }

        Ok(())
    }

    async fn destination_namespaces(&self) -> Result<Vec<String>> {
        Ok(self
            .cluster
            .list_namespaces()
            .await?
            .into_iter()
            .filter(|name| name != &self.task.source_namespace)
            .filter(|name| self.task.target_namespace.is_match(name))
            .collect())
    }

    async fn fetch_source(&self) -> Result<(DynamicObject, String)> {
        let object = self
            .cluster
            .get_object(
                &self.task.resource,
                &self.task.source_namespace,
                &self.task.source_name,
            )
            .await?;
        let version = object.metadata.resource_version.clone().unwrap_or_default();
        Ok((sanitize(object), version))
    }

    async fn replicate(&self, source: &DynamicObject, namespace: &str) -> Result<()> {
        let mut object = source.clone();
        object.metadata.namespace = Some(namespace.into());
        object.metadata.name = Some(self.task.target_name.clone());

        let object = if self.task.modification.is_empty() {
            object
        } else {
            let document = ::serde_json::to_value(&object)?;
            let document = self.task.modification.apply(document).await?;
            ::serde_json::from_value(document)
                .map_err(|error| anyhow!("modification produced an invalid object: {error}"))?
        };

        info!(
            "replicating into {namespace}/{name}",
            name = self.task.target_name,
        );
        self.cluster
            .apply_object(
                &self.task.resource,
                namespace,
                &self.task.target_name,
                &object,
            )
            .await?;
        Ok(())
    }
}

/// Strips the status subresource and every server-managed metadata field, so
/// copies only carry name/namespace/labels/annotations.
fn sanitize(object: DynamicObject) -> DynamicObject {
    let DynamicObject {
        types,
        metadata,
        mut data,
    } = object;

    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }

    DynamicObject {
        types,
        metadata: ObjectMeta {
            name: metadata.name,
            namespace: metadata.namespace,
            labels: metadata.labels,
            annotations: metadata.annotations,
            ..Default::default()
        },
        data,
    }
}

/// Watch coordinator: keeps the reconcile loop fed with triggers until the
/// token is cancelled, reconnecting with a bounded pause on stream failure.
#[instrument(level = Level::INFO, skip_all, fields(session = %id))]
async fn watch(
    id: Uuid,
    task: Arc<Task>,
    cluster: Arc<dyn Cluster>,
    triggers: Sender<Trigger>,
    token: CancellationToken,
) {
    loop {
        match watch_once(&task, &cluster, &triggers, &token).await {
            Ok(()) => return,
            Err(error) => {
                if token.is_cancelled() {
                    return;
                }
                warn!("watch error: {error}");
            }
        }

        tokio::select! {
            () = token.cancelled() => return,
            () = sleep(RETRY_INTERVAL) => {}
        }
    }
}

/// One watch attempt over the source object stream and the namespace stream.
/// Returns `Ok` only on cancellation; any stream failure or closure is an
/// error that ends the attempt (dropping both streams).
async fn watch_once(
    task: &Task,
    cluster: &Arc<dyn Cluster>,
    triggers: &Sender<Trigger>,
    token: &CancellationToken,
) -> Result<()> {
    // initial synchronization
    if !send_trigger(triggers, token, Trigger::FullSync).await {
        return Ok(());
    }

    let mut resources = cluster
        .watch_objects(&task.resource, &task.source_namespace)
        .await?;
    let mut namespaces = cluster.watch_namespaces().await?;

    loop {
        tokio::select! {
            () = token.cancelled() => return Ok(()),
            event = resources.next() => match event {
                Some(Ok(ClusterEvent::Modified(name))) if name == task.source_name => {
                    if !send_trigger(triggers, token, Trigger::FullSync).await {
                        return Ok(());
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(error.context("resource stream failed")),
                None => bail!("resource stream closed"),
            },
            event = namespaces.next() => match event {
                Some(Ok(ClusterEvent::Added(name))) if task.target_namespace.is_match(&name) => {
                    if !send_trigger(triggers, token, Trigger::Namespace(name)).await {
                        return Ok(());
                    }
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(error.context("namespace stream failed")),
                None => bail!("namespace stream closed"),
            },
        }
    }
}

/// Blocking send, so the capacity-1 channel keeps its backpressure, raced
/// against cancellation. Returns whether the coordinator should keep going.
async fn send_trigger(
    triggers: &Sender<Trigger>,
    token: &CancellationToken,
    trigger: Trigger,
) -> bool {
    tokio::select! {
        () = token.cancelled() => false,
        result = triggers.send(trigger) => result.is_ok(),
    }
}

/// Runs every session concurrently under one cancellation scope and joins
/// them all before returning. Sessions are fully independent.
pub struct SessionGroup {
    sessions: Vec<Session>,
}

impl SessionGroup {
    pub fn new(sessions: Vec<Session>) -> Self {
        Self { sessions }
    }

    pub async fn run(self, token: CancellationToken) {
        let workers: Vec<_> = self
            .sessions
            .into_iter()
            .map(|session| tokio::spawn(session.run(token.child_token())))
            .collect();

        future::join_all(workers).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use ditto_api::task::{ModificationSpec, SourceSpec, TargetSpec, TaskDefinition};
    use ditto_client::ClusterEventStream;
    use futures::stream;
    use kube::core::TypeMeta;
    use serde_json::json;
    use tokio::time::timeout;

    use super::*;

    struct FakeCluster {
        namespaces: Vec<String>,
        source: Mutex<DynamicObject>,
        failing: Vec<String>,
        namespace_events: Mutex<Vec<Result<ClusterEvent>>>,
        resource_events: Mutex<Vec<Result<ClusterEvent>>>,
        attempts: Mutex<Vec<String>>,
        applied: Mutex<Vec<(String, DynamicObject)>>,
    }

    impl FakeCluster {
        fn new(namespaces: &[&str], source: DynamicObject) -> Self {
            Self {
                namespaces: namespaces.iter().map(ToString::to_string).collect(),
                source: Mutex::new(source),
                failing: Vec::new(),
                namespace_events: Mutex::new(Vec::new()),
                resource_events: Mutex::new(Vec::new()),
                attempts: Mutex::new(Vec::new()),
                applied: Mutex::new(Vec::new()),
            }
        }

        fn applied_namespaces(&self) -> Vec<String> {
            self.applied
                .lock()
                .unwrap()
                .iter()
                .map(|(namespace, _)| namespace.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Cluster for FakeCluster {
        async fn list_namespaces(&self) -> Result<Vec<String>> {
            Ok(self.namespaces.clone())
        }

        async fn watch_namespaces(&self) -> Result<ClusterEventStream> {
            let events: Vec<_> = self.namespace_events.lock().unwrap().drain(..).collect();
            Ok(stream::iter(events).chain(stream::pending()).boxed())
        }

        async fn get_object(
            &self,
            _resource: &ditto_api::resource::GroupVersionResource,
            _namespace: &str,
            _name: &str,
        ) -> Result<DynamicObject> {
            Ok(self.source.lock().unwrap().clone())
        }

        async fn watch_objects(
            &self,
            _resource: &ditto_api::resource::GroupVersionResource,
            _namespace: &str,
        ) -> Result<ClusterEventStream> {
            let events: Vec<_> = self.resource_events.lock().unwrap().drain(..).collect();
            Ok(stream::iter(events).chain(stream::pending()).boxed())
        }

        async fn apply_object(
            &self,
            _resource: &ditto_api::resource::GroupVersionResource,
            namespace: &str,
            _name: &str,
            object: &DynamicObject,
        ) -> Result<DynamicObject> {
            self.attempts.lock().unwrap().push(namespace.into());
            if self.failing.iter().any(|failing| failing == namespace) {
                bail!("admission denied in {namespace}");
            }
            self.applied
                .lock()
                .unwrap()
                .push((namespace.into(), object.clone()));
            Ok(object.clone())
        }
    }

    fn configmap_definition() -> TaskDefinition {
        TaskDefinition {
            resource: "v1/configmaps".into(),
            source: SourceSpec {
                namespace: Some("ns-a".into()),
                name: "cm1".into(),
            },
            target: TargetSpec {
                namespace: "ns-.*".into(),
                name: None,
            },
            modification: ModificationSpec::default(),
        }
    }

    fn configmap_task() -> Task {
        configmap_definition().build(None).unwrap()
    }

    fn source_object(version: &str) -> DynamicObject {
        DynamicObject {
            types: Some(TypeMeta {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
            }),
            metadata: ObjectMeta {
                name: Some("cm1".into()),
                namespace: Some("ns-a".into()),
                resource_version: Some(version.into()),
                uid: Some("2b7e1c6f".into()),
                ..Default::default()
            },
            data: json!({
                "data": {"hello": "world"},
                "status": {"phase": "Bogus"},
            }),
        }
    }

    fn session(cluster: &Arc<FakeCluster>) -> Session {
        Session::new(configmap_task(), cluster.clone() as Arc<dyn Cluster>)
    }

    #[tokio::test]
    async fn full_sync_replicates_into_matching_namespaces_only() {
        let cluster = Arc::new(FakeCluster::new(
            &["ns-a", "ns-b", "ns-c", "kube-system"],
            source_object("41"),
        ));
        let mut session = session(&cluster);

        session.reconcile(&Trigger::FullSync).await.unwrap();

        // source namespace and non-matching namespaces are excluded
        assert_eq!(cluster.applied_namespaces(), vec!["ns-b", "ns-c"]);

        let applied = cluster.applied.lock().unwrap();
        for (namespace, object) in applied.iter() {
            assert_eq!(object.metadata.namespace.as_deref(), Some(&**namespace));
            assert_eq!(object.metadata.name.as_deref(), Some("cm1"));
            // sanitized: server-managed fields and status never leak
            assert_eq!(object.metadata.resource_version, None);
            assert_eq!(object.metadata.uid, None);
            assert_eq!(object.data.get("status"), None);
            assert_eq!(object.data["data"]["hello"], json!("world"));
        }
    }

    #[tokio::test]
    async fn unchanged_source_is_never_reapplied() {
        let cluster = Arc::new(FakeCluster::new(&["ns-a", "ns-b"], source_object("41")));
        let mut session = session(&cluster);

        session.reconcile(&Trigger::FullSync).await.unwrap();
        session.reconcile(&Trigger::FullSync).await.unwrap();
        assert_eq!(cluster.attempts.lock().unwrap().len(), 1);

        // a new resourceVersion invalidates the cache
        *cluster.source.lock().unwrap() = source_object("42");
        session.reconcile(&Trigger::FullSync).await.unwrap();
        assert_eq!(cluster.attempts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn destination_failure_does_not_block_others() {
        let mut cluster = FakeCluster::new(&["ns-a", "ns-b", "ns-c"], source_object("41"));
        cluster.failing = vec!["ns-b".into()];
        let cluster = Arc::new(cluster);
        let mut session = session(&cluster);

        session.reconcile(&Trigger::FullSync).await.unwrap();
        assert_eq!(*cluster.attempts.lock().unwrap(), vec!["ns-b", "ns-c"]);
        assert_eq!(cluster.applied_namespaces(), vec!["ns-c"]);

        // the failed destination is retried on the next pass, the applied one is not
        session.reconcile(&Trigger::FullSync).await.unwrap();
        assert_eq!(
            *cluster.attempts.lock().unwrap(),
            vec!["ns-b", "ns-c", "ns-b"]
        );
    }

    #[tokio::test]
    async fn single_namespace_trigger_is_scoped() {
        let cluster = Arc::new(FakeCluster::new(
            &["ns-a", "ns-b", "ns-c"],
            source_object("41"),
        ));
        let mut session = session(&cluster);

        session
            .reconcile(&Trigger::Namespace("ns-z".into()))
            .await
            .unwrap();
        assert_eq!(cluster.applied_namespaces(), vec!["ns-z"]);
    }

    #[tokio::test]
    async fn modification_runs_per_destination() {
        let mut def = configmap_definition();
        def.modification.script =
            Some("resource.data.hello = resource.data.hello.to_upper();".into());
        let task = def.build(None).unwrap();

        let cluster = Arc::new(FakeCluster::new(&["ns-a", "ns-b"], source_object("41")));
        let mut session = Session::new(task, cluster.clone() as Arc<dyn Cluster>);

        session.reconcile(&Trigger::FullSync).await.unwrap();

        let applied = cluster.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].1.data["data"]["hello"], json!("WORLD"));
    }

    #[tokio::test]
    async fn coordinator_emits_initial_sync_then_scoped_triggers() {
        let cluster = FakeCluster::new(&["ns-a", "ns-b"], source_object("41"));
        *cluster.namespace_events.lock().unwrap() = vec![
            Ok(ClusterEvent::Added("ns-new".into())),
            Ok(ClusterEvent::Added("other".into())),
        ];
        *cluster.resource_events.lock().unwrap() = vec![
            Ok(ClusterEvent::Modified("unrelated".into())),
            Ok(ClusterEvent::Modified("cm1".into())),
        ];
        let cluster = Arc::new(cluster) as Arc<dyn Cluster>;
        let task = Arc::new(configmap_task());

        let (triggers, mut requests) = mpsc::channel(1);
        let token = CancellationToken::new();
        let coordinator = tokio::spawn({
            let token = token.clone();
            async move { watch_once(&task, &cluster, &triggers, &token).await }
        });

        let wait = Duration::from_secs(1);
        assert_eq!(
            timeout(wait, requests.recv()).await.unwrap(),
            Some(Trigger::FullSync)
        );

        let mut scoped = vec![
            timeout(wait, requests.recv()).await.unwrap().unwrap(),
            timeout(wait, requests.recv()).await.unwrap().unwrap(),
        ];
        scoped.sort_by_key(|trigger| matches!(trigger, Trigger::Namespace(_)));
        assert_eq!(
            scoped,
            vec![Trigger::FullSync, Trigger::Namespace("ns-new".into())]
        );

        token.cancel();
        assert!(timeout(Duration::from_secs(1), coordinator)
            .await
            .unwrap()
            .unwrap()
            .is_ok());
    }
}
