//! Endpoint stage: a service in front of the probe pod

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Endpoints, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{debug, instrument};

use super::{http_url, Diagnosis, Phase, ProbeStage, StageContext};
use crate::api::{Selector, WatchEvent};
use crate::config::ProbeConfig;
use crate::reporter::ids;
use crate::result::Stage;
use crate::waiter::wait_for;
use crate::{Error, Result, APP_LABEL};

/// Creates the service and waits for it to pick up the pod
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointStage;

/// Build the service selecting the probe pod
pub fn build_service(config: &ProbeConfig) -> Service {
    let labels = BTreeMap::from([(APP_LABEL.to_string(), config.app_name.clone())]);

    Service {
        metadata: ObjectMeta {
            name: Some(config.app_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: i32::from(config.port),
                target_port: Some(IntOrString::Int(i32::from(config.port))),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ready_addresses(endpoints: &Endpoints) -> usize {
    endpoints
        .subsets
        .iter()
        .flatten()
        .map(|s| s.addresses.as_ref().map_or(0, Vec::len))
        .sum()
}

fn not_ready_addresses(endpoints: &Endpoints) -> usize {
    endpoints
        .subsets
        .iter()
        .flatten()
        .map(|s| s.not_ready_addresses.as_ref().map_or(0, Vec::len))
        .sum()
}

fn describe_endpoints(endpoints: &Endpoints) -> String {
    match (ready_addresses(endpoints), not_ready_addresses(endpoints)) {
        (0, 0) => "no addresses".to_string(),
        (0, pending) => format!("{} not-ready address(es)", pending),
        (ready, _) => format!("{} ready address(es)", ready),
    }
}

fn no_cluster_ip(service: &str) -> Error {
    Error::readiness(format!("service/{}", service), "no cluster IP was assigned")
}

/// The created service's cluster IP
#[derive(Debug)]
pub struct CreatedService {
    name: String,
    cluster_ip: Option<String>,
}

#[async_trait]
impl ProbeStage for EndpointStage {
    type Created = CreatedService;
    /// Service URL; absent when no cluster IP was assigned and no test runs
    type Ready = Option<String>;

    fn kind(&self) -> Stage {
        Stage::Endpoint
    }

    fn success_id(&self) -> &'static str {
        ids::ENDPOINT_READY
    }

    async fn create(&self, ctx: &StageContext) -> Result<CreatedService> {
        let created = ctx.apis.services.create(&build_service(&ctx.config)).await?;
        let cluster_ip = created
            .spec
            .and_then(|s| s.cluster_ip)
            .filter(|ip| !ip.is_empty() && ip != "None");
        debug!(service = %ctx.config.app_name, ?cluster_ip, "created probe service");
        Ok(CreatedService {
            name: ctx.config.app_name.clone(),
            cluster_ip,
        })
    }

    #[instrument(skip(self, ctx))]
    async fn wait_ready(
        &self,
        ctx: &StageContext,
        created: CreatedService,
    ) -> Result<Option<String>> {
        let resource = format!("endpoints/{}", created.name);
        // only the connection test needs an address to dial
        if created.cluster_ip.is_none() && self.runs_test(&ctx.config) {
            return Err(no_cluster_ip(&created.name));
        }

        let deadline = ctx.config.app_timeout;
        let mut last_observed = String::from("no endpoints object");

        let ready = wait_for(
            ctx.apis.endpoints.as_ref(),
            &Selector::named(&created.name),
            deadline,
            |event| {
                let endpoints = event.object();
                last_observed = describe_endpoints(endpoints);
                if let WatchEvent::Deleted(_) = event {
                    return Err(Error::readiness(
                        &resource,
                        "endpoints were deleted while waiting for an address",
                    ));
                }
                Ok(ready_addresses(endpoints) > 0)
            },
        )
        .await?;

        if !ready {
            return Err(Error::ReadinessTimeout {
                resource,
                condition: "backed by a ready address".to_string(),
                waited: deadline,
                last_observed,
            });
        }
        Ok(created
            .cluster_ip
            .map(|ip| http_url(&ip, ctx.config.port)))
    }

    fn runs_test(&self, config: &ProbeConfig) -> bool {
        !config.skip_service_connection
    }

    async fn test(&self, ctx: &StageContext, url: &Option<String>) -> Result<u32> {
        let url = url
            .as_deref()
            .ok_or_else(|| no_cluster_ip(&ctx.config.app_name))?;
        ctx.prober.probe(url, &ctx.stop).await
    }

    fn diagnose(&self, phase: Phase, error: &Error) -> Diagnosis {
        match phase {
            Phase::Create => Diagnosis {
                id: ids::ENDPOINT_CREATE,
                causes: &[
                    "the probe lacks permission to create services",
                    "the service IP range is exhausted",
                    "a service from an earlier run was not removed",
                ],
            },
            Phase::WaitReady if error.is_timeout() => Diagnosis {
                id: ids::ENDPOINT_TIMEOUT,
                causes: &[
                    "the endpoints controller in the controller manager is not running",
                    "the pod is not passing readiness or its labels don't match the selector",
                ],
            },
            Phase::WaitReady => Diagnosis {
                id: ids::ENDPOINT_FAILED,
                causes: &[
                    "the service has no cluster IP; check the service network configuration",
                    "the service or namespace was removed during the run",
                ],
            },
            Phase::Test => Diagnosis {
                id: ids::ENDPOINT_CONNECT,
                causes: &[
                    "the pod network is broken or the node's service proxy rules are stale",
                    "this host cannot reach the service network; rerun with --skip-service-connection",
                    "a network policy blocks traffic into the probe namespace",
                ],
            },
        }
    }
}
