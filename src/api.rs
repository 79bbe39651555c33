//! Resource control API
//!
//! The probe only needs four verbs per kind: create, list, delete and watch.
//! [`ResourceApi`] exposes exactly those so stages and the environment can be
//! driven by mocks in tests and by kube-rs in production.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Endpoints, Namespace, Pod, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Config, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

#[cfg(test)]
use mockall::automock;

use crate::route::{route_api_resource, Route};
use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for the server-side watch timeout.
///
/// Kept below [`DEFAULT_READ_TIMEOUT`] so the API server closes the watch
/// before the client gives up on the body.
const WATCH_SERVER_TIMEOUT_CAP_SECS: u64 = 25;

/// Which objects a list or watch applies to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Selector {
    /// Field selector, e.g. `metadata.name=app`
    pub fields: Option<String>,
    /// Label selector, e.g. `app=diagnostic-appcreate`
    pub labels: Option<String>,
}

impl Selector {
    /// Select a single object by name
    pub fn named(name: &str) -> Self {
        Self {
            fields: Some(format!("metadata.name={}", name)),
            labels: None,
        }
    }

    /// Select objects matching a label selector expression
    pub fn labelled(expr: impl Into<String>) -> Self {
        Self {
            fields: None,
            labels: Some(expr.into()),
        }
    }

    fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(fields) = &self.fields {
            params = params.fields(fields);
        }
        if let Some(labels) = &self.labels {
            params = params.labels(labels);
        }
        params
    }

    fn watcher_config(&self, server_timeout: u32) -> watcher::Config {
        let mut config = watcher::Config::default().timeout(server_timeout);
        if let Some(fields) = &self.fields {
            config = config.fields(fields);
        }
        if let Some(labels) = &self.labels {
            config = config.labels(labels);
        }
        config
    }
}

/// A change to a watched object
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<K> {
    /// The object was observed for the first time
    Added(K),
    /// The object changed
    Modified(K),
    /// The object was deleted
    Deleted(K),
}

impl<K> WatchEvent<K> {
    /// The object carried by the event
    pub fn object(&self) -> &K {
        match self {
            Self::Added(obj) | Self::Modified(obj) | Self::Deleted(obj) => obj,
        }
    }
}

/// Stream of change events produced by [`ResourceApi::watch`]
pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>>>;

/// Narrow control API for one resource kind in the probe namespace
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceApi<K>: Send + Sync
where
    K: Send + Sync + 'static,
{
    /// Create an object. A name conflict yields [`Error::AlreadyExists`].
    async fn create(&self, obj: &K) -> Result<K>;

    /// List objects matching the selector
    async fn list(&self, selector: &Selector) -> Result<Vec<K>>;

    /// Delete an object if it exists. A missing object is not an error.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Subscribe to changes of the selected objects.
    ///
    /// `deadline` bounds the server-side watch; callers still enforce it on
    /// their side. Dropping the stream releases the subscription.
    fn watch(&self, selector: &Selector, deadline: Duration) -> WatchStream<K>;
}

/// kube-rs backed [`ResourceApi`]
pub struct KubeResourceApi<K> {
    api: Api<K>,
    kind: String,
}

impl<K> KubeResourceApi<K> {
    /// Wrap an `Api` scoped to the probe namespace (or cluster-wide for namespaces)
    pub fn new(api: Api<K>, kind: impl Into<String>) -> Self {
        Self {
            api,
            kind: kind.into(),
        }
    }
}

#[async_trait]
impl<K> ResourceApi<K> for KubeResourceApi<K>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    async fn create(&self, obj: &K) -> Result<K> {
        match self.api.create(&PostParams::default(), obj).await {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ref err)) if err.code == 409 => Err(Error::AlreadyExists {
                kind: self.kind.clone(),
                name: obj.meta().name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, selector: &Selector) -> Result<Vec<K>> {
        let list = self.api.list(&selector.list_params()).await?;
        Ok(list.items)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(kind = %self.kind, %name, "delete requested");
                Ok(())
            }
            Err(kube::Error::Api(ref err)) if err.code == 404 => {
                trace!(kind = %self.kind, %name, "already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn watch(&self, selector: &Selector, deadline: Duration) -> WatchStream<K> {
        let server_timeout = deadline.as_secs().clamp(1, WATCH_SERVER_TIMEOUT_CAP_SECS) as u32;
        let kind = self.kind.clone();

        watcher::watcher(self.api.clone(), selector.watcher_config(server_timeout))
            .default_backoff()
            .filter_map(move |event| {
                let kind = kind.clone();
                async move {
                    match event {
                        Ok(Event::InitApply(obj)) => Some(Ok(WatchEvent::Added(obj))),
                        Ok(Event::Apply(obj)) => Some(Ok(WatchEvent::Modified(obj))),
                        Ok(Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                        Ok(Event::Init) | Ok(Event::InitDone) => None,
                        Err(e) => Some(Err(Error::watch(kind, e.to_string()))),
                    }
                }
            })
            .boxed()
    }
}

/// One [`ResourceApi`] per kind the probe touches
#[derive(Clone)]
pub struct ClusterApis {
    /// Cluster-scoped namespace API
    pub namespaces: Arc<dyn ResourceApi<Namespace>>,
    /// Pods in the probe namespace
    pub pods: Arc<dyn ResourceApi<Pod>>,
    /// Services in the probe namespace
    pub services: Arc<dyn ResourceApi<Service>>,
    /// Endpoints in the probe namespace
    pub endpoints: Arc<dyn ResourceApi<Endpoints>>,
    /// Routes in the probe namespace
    pub routes: Arc<dyn ResourceApi<Route>>,
}

impl ClusterApis {
    /// Build kube-rs backed APIs scoped to `namespace`
    pub fn from_client(client: Client, namespace: &str) -> Self {
        Self {
            namespaces: Arc::new(KubeResourceApi::new(
                Api::<Namespace>::all(client.clone()),
                "Namespace",
            )),
            pods: Arc::new(KubeResourceApi::new(
                Api::<Pod>::namespaced(client.clone(), namespace),
                "Pod",
            )),
            services: Arc::new(KubeResourceApi::new(
                Api::<Service>::namespaced(client.clone(), namespace),
                "Service",
            )),
            endpoints: Arc::new(KubeResourceApi::new(
                Api::<Endpoints>::namespaced(client.clone(), namespace),
                "Endpoints",
            )),
            routes: Arc::new(KubeResourceApi::new(
                Api::<Route>::namespaced_with(client, namespace, &route_api_resource()),
                "Route",
            )),
        }
    }
}

/// Create a kube client from an optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from an optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
