//! Probe configuration
//!
//! A [`ProbeConfig`] is built once by the caller (the CLI maps its flags onto
//! it) and passed explicitly to everything that needs it. Nothing caches it
//! globally.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use rand::Rng;

use crate::{
    Error, Result, DEFAULT_APP_NAME, DEFAULT_APP_TIMEOUT_SECS, DEFAULT_HTTP_RETRIES,
    DEFAULT_HTTP_TIMEOUT_MS, DEFAULT_IMAGE, DEFAULT_NAMESPACE_PREFIX, DEFAULT_PORT,
    DEFAULT_PREPARE_TIMEOUT_SECS, DEFAULT_ROUTE_ADMISSION_TIMEOUT_SECS, DEFAULT_ROUTE_PORT,
};

const NAMESPACE_SUFFIX_LEN: usize = 5;
const NAMESPACE_SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const MAX_HTTP_RETRIES: u32 = 100;
const MAX_DNS_LABEL_LEN: usize = 63;

/// Read-only input for one probe run
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    /// Namespace the probe resources are created in
    pub namespace: String,
    /// Name shared by the pod, service and route
    pub app_name: String,
    /// Container image for the workload
    pub image: String,
    /// Container arguments; `{port}` is replaced with [`ProbeConfig::port`]
    pub args: Vec<String>,
    /// Port the workload listens on and the service exposes
    pub port: u16,
    /// Node selector for the workload pod
    pub node_selector: BTreeMap<String, String>,
    /// Requested route host; the router assigns one when unset
    pub route_host: Option<String>,
    /// Port used when probing the admitted route host
    pub route_port: u16,
    /// Hard timeout for each HTTP attempt
    pub http_timeout: Duration,
    /// Retries after the first HTTP attempt
    pub http_retries: u32,
    /// Readiness deadline for the workload and endpoint stages
    pub app_timeout: Duration,
    /// Deadline for the route to be admitted
    pub route_admission_timeout: Duration,
    /// Bound on waiting for stale workloads to disappear during setup
    pub prepare_timeout: Duration,
    /// Skip the HTTP test against the service
    pub skip_service_connection: bool,
    /// Skip the route stage entirely
    pub skip_route_test: bool,
    /// Create and admit the route but skip the HTTP test against it
    pub skip_route_connection: bool,
    /// Leave the pod, service and route in place after the run
    pub keep_app: bool,
    /// Leave the namespace in place after the run
    pub keep_namespace: bool,
    /// Directory the finished run is written to, if any
    pub result_dir: Option<PathBuf>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            namespace: generate_namespace(),
            app_name: DEFAULT_APP_NAME.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            args: default_args(),
            port: DEFAULT_PORT,
            node_selector: BTreeMap::new(),
            route_host: None,
            route_port: DEFAULT_ROUTE_PORT,
            http_timeout: Duration::from_millis(DEFAULT_HTTP_TIMEOUT_MS),
            http_retries: DEFAULT_HTTP_RETRIES,
            app_timeout: Duration::from_secs(DEFAULT_APP_TIMEOUT_SECS),
            route_admission_timeout: Duration::from_secs(DEFAULT_ROUTE_ADMISSION_TIMEOUT_SECS),
            prepare_timeout: Duration::from_secs(DEFAULT_PREPARE_TIMEOUT_SECS),
            skip_service_connection: false,
            skip_route_test: false,
            skip_route_connection: false,
            keep_app: false,
            keep_namespace: false,
            result_dir: None,
        }
    }
}

impl ProbeConfig {
    /// Check the configuration before anything touches the cluster
    pub fn validate(&self) -> Result<()> {
        validate_dns_label("namespace", &self.namespace)?;
        validate_dns_label("app_name", &self.app_name)?;

        if self.image.trim().is_empty() {
            return Err(Error::config("image", "must not be empty"));
        }
        if self.port == 0 {
            return Err(Error::config("port", "must be non-zero"));
        }
        if self.route_port == 0 {
            return Err(Error::config("route_port", "must be non-zero"));
        }
        if self.http_retries > MAX_HTTP_RETRIES {
            return Err(Error::config(
                "http_retries",
                format!("must be at most {}", MAX_HTTP_RETRIES),
            ));
        }

        for (field, value) in [
            ("http_timeout", self.http_timeout),
            ("app_timeout", self.app_timeout),
            ("route_admission_timeout", self.route_admission_timeout),
            ("prepare_timeout", self.prepare_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::config(field, "must be greater than zero"));
            }
        }

        if let Some(host) = &self.route_host {
            if host.trim().is_empty() || host.contains('/') {
                return Err(Error::config(
                    "route_host",
                    format!("'{}' is not a valid host name", host),
                ));
            }
        }

        Ok(())
    }

    /// Label selector matching the probe workload
    pub fn app_selector(&self) -> String {
        format!("{}={}", crate::APP_LABEL, self.app_name)
    }

    /// Container arguments with the port substituted
    pub fn container_args(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }
}

/// Arguments that make agnhost serve HTTP on the configured port
pub fn default_args() -> Vec<String> {
    vec!["netexec".to_string(), "--http-port={port}".to_string()]
}

/// Generate a fresh namespace name with a random suffix
pub fn generate_namespace() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..NAMESPACE_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..NAMESPACE_SUFFIX_CHARSET.len());
            NAMESPACE_SUFFIX_CHARSET[idx] as char
        })
        .collect();
    format!("{}{}", DEFAULT_NAMESPACE_PREFIX, suffix)
}

/// Parse `key=value[,key=value]` into a node selector map
pub fn parse_node_selector(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut selector = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            Error::config(
                "node_selector",
                format!("'{}' is not in key=value form", pair),
            )
        })?;
        if key.trim().is_empty() {
            return Err(Error::config(
                "node_selector",
                format!("'{}' has an empty key", pair),
            ));
        }
        selector.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(selector)
}

fn validate_dns_label(field: &str, value: &str) -> Result<()> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = value
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && value
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_alphanumeric());

    if value.is_empty() || value.len() > MAX_DNS_LABEL_LEN || !valid_chars || !valid_edges {
        return Err(Error::config(
            field,
            format!("'{}' is not a valid DNS-1123 label", value),
        ));
    }
    Ok(())
}
