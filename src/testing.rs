//! Shared test fixtures

use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    EndpointAddress, EndpointSubset, Endpoints, Namespace, Pod, PodStatus, Service, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use tokio_util::sync::CancellationToken;

use crate::api::{ClusterApis, MockResourceApi};
use crate::config::ProbeConfig;
use crate::prober::MockConnectivityProbe;
use crate::reporter::Reporter;
use crate::route::{build_route, Route, RouteIngress, RouteIngressCondition, RouteStatus};
use crate::stage::StageContext;

/// Configuration pinned to the namespace the fixtures use
pub(crate) fn probe_config() -> ProbeConfig {
    ProbeConfig {
        namespace: "probe-ns".to_string(),
        app_name: "app".to_string(),
        ..Default::default()
    }
}

/// Stage context over mocks; a missing prober panics if anything probes
pub(crate) fn context(
    apis: MockApis,
    prober: Option<MockConnectivityProbe>,
    reporter: Arc<dyn Reporter>,
    config: ProbeConfig,
) -> StageContext {
    StageContext {
        config: Arc::new(config),
        apis: apis.into_apis(),
        prober: Arc::new(prober.unwrap_or_default()),
        reporter,
        stop: CancellationToken::new(),
    }
}

pub(crate) fn pod_with_phase(name: &str, phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Echo a created service back with a cluster IP assigned
pub(crate) fn with_cluster_ip(service: &Service, ip: &str) -> Service {
    let mut created = service.clone();
    let spec = created.spec.get_or_insert_with(ServiceSpec::default);
    spec.cluster_ip = Some(ip.to_string());
    created
}

pub(crate) fn endpoints_with_addresses(name: &str, ips: &[&str]) -> Endpoints {
    Endpoints {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        subsets: Some(vec![EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: ip.to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }]),
    }
}

pub(crate) fn route_with_admission(name: &str, host: &str, admitted: &str) -> Route {
    let mut route = build_route(name, "probe-ns", None, name, 8080);
    route.status = Some(RouteStatus {
        ingress: vec![RouteIngress {
            host: Some(host.to_string()),
            router_name: Some("default".to_string()),
            conditions: vec![RouteIngressCondition {
                type_: "Admitted".to_string(),
                status: admitted.to_string(),
                reason: (admitted == "False").then(|| "HostAlreadyClaimed".to_string()),
                message: None,
            }],
        }],
    });
    route
}

/// Individual mocks, assembled into [`ClusterApis`] once expectations are set
pub(crate) struct MockApis {
    pub(crate) namespaces: MockResourceApi<Namespace>,
    pub(crate) pods: MockResourceApi<Pod>,
    pub(crate) services: MockResourceApi<Service>,
    pub(crate) endpoints: MockResourceApi<Endpoints>,
    pub(crate) routes: MockResourceApi<Route>,
}

impl MockApis {
    pub(crate) fn new() -> Self {
        Self {
            namespaces: MockResourceApi::new(),
            pods: MockResourceApi::new(),
            services: MockResourceApi::new(),
            endpoints: MockResourceApi::new(),
            routes: MockResourceApi::new(),
        }
    }

    /// Namespace creation succeeds, stale sweeps and cleanup deletes succeed,
    /// and no stale pods are found.
    pub(crate) fn with_clean_environment(mut self) -> Self {
        self.namespaces
            .expect_create()
            .returning(|ns| Ok(ns.clone()));
        self.namespaces.expect_delete().returning(|_| Ok(()));
        self.pods.expect_delete().returning(|_| Ok(()));
        self.pods.expect_list().returning(|_| Ok(vec![]));
        self.services.expect_delete().returning(|_| Ok(()));
        self.routes.expect_delete().returning(|_| Ok(()));
        self
    }

    pub(crate) fn into_apis(self) -> ClusterApis {
        ClusterApis {
            namespaces: Arc::new(self.namespaces),
            pods: Arc::new(self.pods),
            services: Arc::new(self.services),
            endpoints: Arc::new(self.endpoints),
            routes: Arc::new(self.routes),
        }
    }
}
