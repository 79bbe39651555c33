//! OpenShift Route types
//!
//! Routes are not part of k8s-openapi and the probe must not require a
//! compiled CRD schema, so the kind is addressed through the dynamic API with
//! only the fields the route stage reads and writes.

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{ApiResource, GroupVersionKind};
use kube::core::object::Object;
use serde::{Deserialize, Serialize};

/// API group of the Route kind
pub const ROUTE_GROUP: &str = "route.openshift.io";
/// API version of the Route kind
pub const ROUTE_VERSION: &str = "v1";
/// Kind name
pub const ROUTE_KIND: &str = "Route";
/// Condition type set by a router once it serves the route
pub const CONDITION_ADMITTED: &str = "Admitted";

/// A Route object
pub type Route = Object<RouteSpec, RouteStatus>;

/// Desired state of a Route
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Requested external host; the router generates one when empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Backend the route sends traffic to
    pub to: RouteTargetReference,
    /// Target port on the backend service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<RoutePort>,
}

/// Backend reference of a Route
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTargetReference {
    /// Backend kind, always "Service" for the probe
    pub kind: String,
    /// Backend name
    pub name: String,
}

/// Port selection of a Route
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutePort {
    /// Service port (number or name) to route to
    pub target_port: IntOrString,
}

/// Observed state of a Route
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatus {
    /// One entry per router that has seen the route
    #[serde(default)]
    pub ingress: Vec<RouteIngress>,
}

/// Per-router state of a Route
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteIngress {
    /// Host the router serves the route on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Name of the router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_name: Option<String>,
    /// Conditions reported by the router
    #[serde(default)]
    pub conditions: Vec<RouteIngressCondition>,
}

/// A router-reported condition
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteIngressCondition {
    /// Condition type, e.g. "Admitted"
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// API resource descriptor for dynamic Route access
pub fn route_api_resource() -> ApiResource {
    let gvk = GroupVersionKind::gvk(ROUTE_GROUP, ROUTE_VERSION, ROUTE_KIND);
    ApiResource::from_gvk_with_plural(&gvk, "routes")
}

/// Build a Route sending traffic to the named service port
pub fn build_route(
    name: &str,
    namespace: &str,
    host: Option<&str>,
    service: &str,
    port: u16,
) -> Route {
    let spec = RouteSpec {
        host: host.map(str::to_string),
        to: RouteTargetReference {
            kind: "Service".to_string(),
            name: service.to_string(),
        },
        port: Some(RoutePort {
            target_port: IntOrString::Int(i32::from(port)),
        }),
    };
    Object::new(name, &route_api_resource(), spec).within(namespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::ResourceExt;

    #[test]
    fn build_route_targets_service_port() {
        let route = build_route("app", "probe-ns", Some("app.example.com"), "app", 8080);

        assert_eq!(route.name_any(), "app");
        assert_eq!(route.namespace().as_deref(), Some("probe-ns"));
        assert_eq!(route.spec.to.kind, "Service");
        assert_eq!(route.spec.host.as_deref(), Some("app.example.com"));

        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["apiVersion"], "route.openshift.io/v1");
        assert_eq!(json["kind"], "Route");
        assert_eq!(json["spec"]["port"]["targetPort"], 8080);
        assert!(json["spec"]["to"]["name"] == "app");
    }

    #[test]
    fn status_parses_router_conditions() {
        let status: RouteStatus = serde_json::from_value(serde_json::json!({
            "ingress": [{
                "host": "app-probe.apps.example.com",
                "routerName": "default",
                "conditions": [{"type": "Admitted", "status": "True"}]
            }]
        }))
        .unwrap();

        let ingress = &status.ingress[0];
        assert_eq!(ingress.router_name.as_deref(), Some("default"));
        assert_eq!(ingress.conditions[0].type_, CONDITION_ADMITTED);
        assert_eq!(ingress.conditions[0].status, "True");
    }

    #[test]
    fn api_resource_uses_routes_plural() {
        let ar = route_api_resource();
        assert_eq!(ar.plural, "routes");
        assert_eq!(ar.api_version, "route.openshift.io/v1");
    }
}
