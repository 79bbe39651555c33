//! Route stage: an external route to the probe service

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::{http_url, Diagnosis, Phase, ProbeStage, StageContext};
use crate::api::{Selector, WatchEvent};
use crate::config::ProbeConfig;
use crate::reporter::ids;
use crate::result::Stage;
use crate::route::{build_route, Route, CONDITION_ADMITTED};
use crate::waiter::wait_for;
use crate::{Error, Result};

/// Creates the route and waits for a router to admit it
#[derive(Clone, Copy, Debug, Default)]
pub struct RouteStage;

/// What the routers currently say about a route
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// Admitted; carries the host the route is served on, if known
    Admitted(Option<String>),
    /// A router refused the route
    Rejected(String),
    /// Nothing decisive yet
    Pending(String),
}

pub(crate) fn admission(route: &Route) -> Admission {
    let ingresses = route
        .status
        .as_ref()
        .map(|s| s.ingress.as_slice())
        .unwrap_or_default();
    if ingresses.is_empty() {
        return Admission::Pending("no router has reported status".to_string());
    }

    let mut rejection = None;
    for ingress in ingresses {
        let router = ingress.router_name.as_deref().unwrap_or("unknown");
        let Some(condition) = ingress
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_ADMITTED)
        else {
            continue;
        };
        match condition.status.as_str() {
            "True" => {
                let host = ingress.host.clone().or_else(|| route.spec.host.clone());
                return Admission::Admitted(host);
            }
            "False" if rejection.is_none() => {
                rejection = Some(format!(
                    "router {} rejected the route: {} {}",
                    router,
                    condition.reason.as_deref().unwrap_or("NoReason"),
                    condition.message.as_deref().unwrap_or("")
                ));
            }
            _ => {}
        }
    }

    match rejection {
        Some(reason) => Admission::Rejected(reason.trim_end().to_string()),
        None => Admission::Pending(format!(
            "{} router(s) reported, none admitted yet",
            ingresses.len()
        )),
    }
}

#[async_trait]
impl ProbeStage for RouteStage {
    type Created = String;
    type Ready = String;

    fn kind(&self) -> Stage {
        Stage::Route
    }

    fn success_id(&self) -> &'static str {
        ids::ROUTE_READY
    }

    async fn create(&self, ctx: &StageContext) -> Result<String> {
        let config = &ctx.config;
        let route = build_route(
            &config.app_name,
            &config.namespace,
            config.route_host.as_deref(),
            &config.app_name,
            config.port,
        );
        ctx.apis.routes.create(&route).await?;
        debug!(route = %config.app_name, host = ?config.route_host, "created probe route");
        Ok(config.app_name.clone())
    }

    #[instrument(skip(self, ctx))]
    async fn wait_ready(&self, ctx: &StageContext, name: String) -> Result<String> {
        let resource = format!("route/{}", name);
        let deadline = ctx.config.route_admission_timeout;
        let mut last_observed = String::from("no events");
        let mut admitted_host = None;

        let admitted = wait_for(
            ctx.apis.routes.as_ref(),
            &Selector::named(&name),
            deadline,
            |event| {
                if let WatchEvent::Deleted(_) = event {
                    return Err(Error::readiness(
                        &resource,
                        "route was deleted while waiting for admission",
                    ));
                }
                match admission(event.object()) {
                    Admission::Admitted(host) => {
                        admitted_host = host;
                        Ok(true)
                    }
                    Admission::Rejected(reason) => Err(Error::readiness(&resource, reason)),
                    Admission::Pending(state) => {
                        last_observed = state;
                        Ok(false)
                    }
                }
            },
        )
        .await?;

        if !admitted {
            return Err(Error::ReadinessTimeout {
                resource,
                condition: CONDITION_ADMITTED.to_string(),
                waited: deadline,
                last_observed,
            });
        }
        let host = admitted_host
            .ok_or_else(|| Error::readiness(&resource, "admitted without a host"))?;
        Ok(http_url(&host, ctx.config.route_port))
    }

    fn runs_test(&self, config: &ProbeConfig) -> bool {
        !config.skip_route_connection
    }

    async fn test(&self, ctx: &StageContext, url: &String) -> Result<u32> {
        ctx.prober.probe(url, &ctx.stop).await
    }

    fn diagnose(&self, phase: Phase, error: &Error) -> Diagnosis {
        match phase {
            Phase::Create => Diagnosis {
                id: ids::ROUTE_CREATE,
                causes: &[
                    "the cluster does not serve route.openshift.io; rerun with --skip-route-test",
                    "the probe lacks permission to create routes",
                    "a route from an earlier run was not removed",
                ],
            },
            Phase::WaitReady if error.is_timeout() => Diagnosis {
                id: ids::ROUTE_TIMEOUT,
                causes: &[
                    "no router is deployed or the router pods are not running",
                    "the router's namespace or route selectors exclude the probe namespace",
                ],
            },
            Phase::WaitReady => Diagnosis {
                id: ids::ROUTE_FAILED,
                causes: &[
                    "another route already claims the requested host",
                    "the route or namespace was removed during the run",
                ],
            },
            Phase::Test => Diagnosis {
                id: ids::ROUTE_CONNECT,
                causes: &[
                    "the route host does not resolve from this host; check wildcard DNS for the router domain",
                    "a load balancer or firewall in front of the router drops the traffic",
                    "the router cannot reach the pod network",
                ],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prober::MockConnectivityProbe;
    use crate::reporter::recording::RecordingReporter;
    use crate::result::ProbeRun;
    use crate::route::RouteStatus;
    use crate::stage::run_stage;
    use crate::testing::{context, probe_config, route_with_admission, MockApis};
    use futures::stream::{self, StreamExt};
    use std::sync::Arc;
    use tokio::sync::watch;

    fn apis_with_route_events(events: Vec<WatchEvent<Route>>) -> MockApis {
        let mut apis = MockApis::new();
        apis.routes
            .expect_create()
            .times(1)
            .returning(|route| Ok(route.clone()));
        let mut events = Some(events);
        apis.routes.expect_watch().returning(move |_, _| {
            stream::iter(events.take().unwrap_or_default().into_iter().map(Ok)).boxed()
        });
        apis
    }

    #[test]
    fn admission_reads_router_conditions() {
        let unadmitted = build_route("app", "probe-ns", None, "app", 8080);
        assert!(matches!(admission(&unadmitted), Admission::Pending(_)));

        let mut empty = unadmitted.clone();
        empty.status = Some(RouteStatus::default());
        assert!(matches!(admission(&empty), Admission::Pending(_)));

        assert_eq!(
            admission(&route_with_admission("app", "app.apps.example.com", "True")),
            Admission::Admitted(Some("app.apps.example.com".to_string()))
        );

        match admission(&route_with_admission("app", "app.apps.example.com", "False")) {
            Admission::Rejected(reason) => {
                assert_eq!(reason, "router default rejected the route: HostAlreadyClaimed")
            }
            other => panic!("Expected rejection, got {other:?}"),
        }
    }

    /// Story: The route is admitted and answers on the router port
    #[tokio::test]
    async fn story_admitted_route_is_probed_on_route_port() {
        let apis = apis_with_route_events(vec![
            WatchEvent::Added(build_route("app", "probe-ns", None, "app", 8080)),
            WatchEvent::Modified(route_with_admission("app", "app.apps.example.com", "True")),
        ]);
        let mut prober = MockConnectivityProbe::new();
        prober
            .expect_probe()
            .withf(|url, _| url == "http://app.apps.example.com:80/")
            .times(1)
            .returning(|_, _| Ok(1));

        let reporter = Arc::new(RecordingReporter::default());
        let ctx = context(apis, Some(prober), reporter.clone(), probe_config());
        let (tx, _rx) = watch::channel(ProbeRun::new("probe-ns"));

        assert!(run_stage(&RouteStage, &ctx, &tx).await);
        assert!(tx.borrow().stage(Stage::Route).test_time.is_some());
        assert!(reporter.find(ids::ROUTE_READY).is_some());
    }

    /// Story: A rejected route fails immediately with the router's reason
    #[tokio::test]
    async fn story_rejected_route_is_hard_error() {
        let apis = apis_with_route_events(vec![WatchEvent::Modified(route_with_admission(
            "app",
            "app.apps.example.com",
            "False",
        ))]);
        let reporter = Arc::new(RecordingReporter::default());
        let ctx = context(apis, None, reporter.clone(), probe_config());
        let (tx, _rx) = watch::channel(ProbeRun::new("probe-ns"));

        assert!(!run_stage(&RouteStage, &ctx, &tx).await);
        let error = tx.borrow().stage(Stage::Route).error.clone().unwrap();
        assert!(error.contains("HostAlreadyClaimed"), "{error}");
        assert!(reporter.find(ids::ROUTE_FAILED).is_some());
    }

    /// Story: Skipping the route connection still requires admission
    #[tokio::test]
    async fn story_skip_route_connection_stops_after_admission() {
        let apis = apis_with_route_events(vec![WatchEvent::Added(route_with_admission(
            "app",
            "app.apps.example.com",
            "True",
        ))]);
        let mut prober = MockConnectivityProbe::new();
        prober.expect_probe().never();

        let mut config = probe_config();
        config.skip_route_connection = true;
        let ctx = context(
            apis,
            Some(prober),
            Arc::new(RecordingReporter::default()),
            config,
        );
        let (tx, _rx) = watch::channel(ProbeRun::new("probe-ns"));

        assert!(run_stage(&RouteStage, &ctx, &tx).await);
        let run = tx.borrow();
        let r = run.stage(Stage::Route);
        assert!(r.ready_time.is_some());
        assert!(r.test_time.is_none());
    }

    /// Story: No router admits the route before the admission deadline
    #[tokio::test(start_paused = true)]
    async fn story_unadmitted_route_times_out() {
        let mut apis = MockApis::new();
        apis.routes.expect_create().returning(|route| Ok(route.clone()));
        apis.routes
            .expect_watch()
            .returning(|_, _| stream::pending().boxed());
        let reporter = Arc::new(RecordingReporter::default());
        let ctx = context(apis, None, reporter.clone(), probe_config());
        let (tx, _rx) = watch::channel(ProbeRun::new("probe-ns"));

        assert!(!run_stage(&RouteStage, &ctx, &tx).await);
        let error = tx.borrow().stage(Stage::Route).error.clone().unwrap();
        assert!(error.contains("timed out after 10s"), "{error}");
        assert!(error.contains("Admitted"), "{error}");

        let (_, message) = reporter.find(ids::ROUTE_TIMEOUT).unwrap();
        assert!(message.contains("no router is deployed"));
    }
}
