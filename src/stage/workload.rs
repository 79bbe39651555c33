//! Workload stage: a single pod running the probe image

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, ContainerPort, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::{debug, instrument};

use super::{Diagnosis, Phase, ProbeStage, StageContext};
use crate::api::{Selector, WatchEvent};
use crate::config::ProbeConfig;
use crate::reporter::ids;
use crate::result::Stage;
use crate::waiter::wait_for;
use crate::{Error, Result, APP_LABEL};

const CONTAINER_NAME: &str = "probe";
const POD_TERMINATION_GRACE_SECONDS: i64 = 1;

/// Creates the probe pod and waits for it to run
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkloadStage;

/// Build the probe pod from the configuration
pub fn build_pod(config: &ProbeConfig) -> Pod {
    let labels = BTreeMap::from([(APP_LABEL.to_string(), config.app_name.clone())]);

    Pod {
        metadata: ObjectMeta {
            name: Some(config.app_name.clone()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: CONTAINER_NAME.to_string(),
                image: Some(config.image.clone()),
                args: Some(config.container_args()),
                ports: Some(vec![ContainerPort {
                    container_port: i32::from(config.port),
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            node_selector: (!config.node_selector.is_empty())
                .then(|| config.node_selector.clone()),
            termination_grace_period_seconds: Some(POD_TERMINATION_GRACE_SECONDS),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Phase plus the most telling waiting reason, e.g. `Pending (ImagePullBackOff)`
pub(crate) fn describe_pod(pod: &Pod) -> String {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");

    let waiting = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| {
            statuses.iter().find_map(|c| {
                c.state
                    .as_ref()?
                    .waiting
                    .as_ref()?
                    .reason
                    .clone()
            })
        });
    let unschedulable = || {
        status
            .and_then(|s| s.conditions.as_ref())
            .and_then(|conditions| {
                conditions
                    .iter()
                    .find(|c| c.type_ == "PodScheduled" && c.status == "False")
                    .and_then(|c| c.reason.clone())
            })
    };

    match waiting.or_else(unschedulable) {
        Some(reason) => format!("{} ({})", phase, reason),
        None => phase.to_string(),
    }
}

#[async_trait]
impl ProbeStage for WorkloadStage {
    type Created = String;
    type Ready = ();

    fn kind(&self) -> Stage {
        Stage::Workload
    }

    fn success_id(&self) -> &'static str {
        ids::WORKLOAD_READY
    }

    async fn create(&self, ctx: &StageContext) -> Result<String> {
        let pod = build_pod(&ctx.config);
        ctx.apis.pods.create(&pod).await?;
        debug!(pod = %ctx.config.app_name, image = %ctx.config.image, "created probe pod");
        Ok(ctx.config.app_name.clone())
    }

    #[instrument(skip(self, ctx))]
    async fn wait_ready(&self, ctx: &StageContext, name: String) -> Result<()> {
        let resource = format!("pod/{}", name);
        let deadline = ctx.config.app_timeout;
        let mut last_observed = String::from("no events");

        let running = wait_for(
            ctx.apis.pods.as_ref(),
            &Selector::named(&name),
            deadline,
            |event| {
                let pod = event.object();
                last_observed = describe_pod(pod);
                if let WatchEvent::Deleted(_) = event {
                    return Err(Error::readiness(
                        &resource,
                        "pod was deleted while waiting for it to run",
                    ));
                }
                match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
                    Some("Running") => Ok(true),
                    Some(phase @ ("Failed" | "Succeeded")) => Err(Error::readiness(
                        &resource,
                        format!("pod terminated with phase {}", phase),
                    )),
                    _ => Ok(false),
                }
            },
        )
        .await?;

        if running {
            Ok(())
        } else {
            Err(Error::ReadinessTimeout {
                resource,
                condition: "Running".to_string(),
                waited: deadline,
                last_observed,
            })
        }
    }

    fn diagnose(&self, phase: Phase, error: &Error) -> Diagnosis {
        match (phase, error) {
            (Phase::Create, Error::AlreadyExists { .. }) => Diagnosis {
                id: ids::WORKLOAD_CREATE,
                causes: &["a probe pod from an earlier run is still terminating"],
            },
            (Phase::Create, _) => Diagnosis {
                id: ids::WORKLOAD_CREATE,
                causes: &[
                    "the namespace is terminating or was removed",
                    "admission control or a resource quota rejected the pod",
                    "the probe lacks permission to create pods",
                ],
            },
            (_, e) if e.is_timeout() => Diagnosis {
                id: ids::WORKLOAD_TIMEOUT,
                causes: &[
                    "the image cannot be pulled; check registry access and pull secrets",
                    "no schedulable node matches the node selector or has capacity",
                    "the scheduler is not running",
                    "the kubelet or container runtime on the chosen node is unhealthy",
                ],
            },
            _ => Diagnosis {
                id: ids::WORKLOAD_FAILED,
                causes: &[
                    "the container exited; check the pod's logs and events",
                    "the pod was evicted or deleted during the run",
                ],
            },
        }
    }
}
