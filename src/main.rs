//! AppCreate - synthetic end-to-end application probe

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use appcreate::api::{create_client, ClusterApis};
use appcreate::config::{default_args, generate_namespace, parse_node_selector, ProbeConfig};
use appcreate::orchestrator::ProbeOrchestrator;
use appcreate::prober::RetryingProber;
use appcreate::reporter::TracingReporter;
use appcreate::{
    DEFAULT_APP_NAME, DEFAULT_APP_TIMEOUT_SECS, DEFAULT_HTTP_RETRIES, DEFAULT_HTTP_TIMEOUT_MS,
    DEFAULT_IMAGE, DEFAULT_PORT, DEFAULT_PREPARE_TIMEOUT_SECS,
    DEFAULT_ROUTE_ADMISSION_TIMEOUT_SECS, DEFAULT_ROUTE_PORT,
};

const EXIT_RUN_FAILED: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// Create a pod, service and route in a scratch namespace, check that each
/// becomes ready and reachable, then clean up
#[derive(Parser, Debug)]
#[command(name = "appcreate", version, about, long_about = None)]
struct Cli {
    /// Namespace to run in; generated when omitted
    #[arg(long, env = "APPCREATE_NAMESPACE")]
    namespace: Option<String>,

    /// Name shared by the pod, service and route
    #[arg(long, env = "APPCREATE_APP_NAME", default_value = DEFAULT_APP_NAME)]
    app_name: String,

    /// Container image for the probe workload
    #[arg(long, env = "APPCREATE_IMAGE", default_value = DEFAULT_IMAGE)]
    image: String,

    /// Port the workload listens on
    #[arg(long, env = "APPCREATE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Node selector for the workload, as key=value[,key=value]
    #[arg(long, env = "APPCREATE_NODE_SELECTOR")]
    node_selector: Option<String>,

    /// Requested route host; the router picks one when omitted
    #[arg(long, env = "APPCREATE_ROUTE_HOST")]
    route_host: Option<String>,

    /// Port used when probing the admitted route host
    #[arg(long, env = "APPCREATE_ROUTE_PORT", default_value_t = DEFAULT_ROUTE_PORT)]
    route_port: u16,

    /// Timeout for each HTTP attempt in milliseconds
    #[arg(long, env = "APPCREATE_HTTP_TIMEOUT_MS", default_value_t = DEFAULT_HTTP_TIMEOUT_MS)]
    http_timeout_ms: u64,

    /// HTTP retries after the first attempt
    #[arg(long, env = "APPCREATE_HTTP_RETRIES", default_value_t = DEFAULT_HTTP_RETRIES)]
    http_retries: u32,

    /// Readiness deadline for the pod and service in seconds
    #[arg(long, env = "APPCREATE_APP_TIMEOUT_SECS", default_value_t = DEFAULT_APP_TIMEOUT_SECS)]
    app_timeout_secs: u64,

    /// Deadline for a router to admit the route in seconds
    #[arg(
        long,
        env = "APPCREATE_ROUTE_ADMISSION_TIMEOUT_SECS",
        default_value_t = DEFAULT_ROUTE_ADMISSION_TIMEOUT_SECS
    )]
    route_admission_timeout_secs: u64,

    /// Bound on waiting for stale probe pods during setup in seconds
    #[arg(
        long,
        env = "APPCREATE_PREPARE_TIMEOUT_SECS",
        default_value_t = DEFAULT_PREPARE_TIMEOUT_SECS
    )]
    prepare_timeout_secs: u64,

    /// Don't test connectivity to the service
    #[arg(long, env = "APPCREATE_SKIP_SERVICE_CONNECTION")]
    skip_service_connection: bool,

    /// Skip the route stage entirely (clusters without routes)
    #[arg(long, env = "APPCREATE_SKIP_ROUTE_TEST")]
    skip_route_test: bool,

    /// Wait for route admission but don't test connectivity through it
    #[arg(long, env = "APPCREATE_SKIP_ROUTE_CONNECTION")]
    skip_route_connection: bool,

    /// Leave the pod, service and route in place
    #[arg(long, env = "APPCREATE_KEEP_APP")]
    keep_app: bool,

    /// Leave the namespace in place
    #[arg(long, env = "APPCREATE_KEEP_NAMESPACE")]
    keep_namespace: bool,

    /// Directory to write appcreate-results.json to
    #[arg(long, env = "APPCREATE_RESULT_DIR")]
    result_dir: Option<PathBuf>,

    /// Path to kubeconfig; inferred from the environment when omitted
    #[arg(long, env = "APPCREATE_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "APPCREATE_LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn into_config(self) -> appcreate::Result<ProbeConfig> {
        let node_selector = match self.node_selector.as_deref() {
            Some(raw) => parse_node_selector(raw)?,
            None => Default::default(),
        };
        Ok(ProbeConfig {
            namespace: self.namespace.unwrap_or_else(generate_namespace),
            app_name: self.app_name,
            image: self.image,
            args: default_args(),
            port: self.port,
            node_selector,
            route_host: self.route_host.filter(|h| !h.is_empty()),
            route_port: self.route_port,
            http_timeout: Duration::from_millis(self.http_timeout_ms),
            http_retries: self.http_retries,
            app_timeout: Duration::from_secs(self.app_timeout_secs),
            route_admission_timeout: Duration::from_secs(self.route_admission_timeout_secs),
            prepare_timeout: Duration::from_secs(self.prepare_timeout_secs),
            skip_service_connection: self.skip_service_connection,
            skip_route_test: self.skip_route_test,
            skip_route_connection: self.skip_route_connection,
            keep_app: self.keep_app,
            keep_namespace: self.keep_namespace,
            result_dir: self.result_dir,
        })
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

/// Resolves on Ctrl-C; never resolves if the handler can't be installed
async fn interrupt_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C, interrupts disabled");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("a TLS crypto provider was already installed, continuing with it");
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);
    let kubeconfig = cli.kubeconfig.clone();

    let config = match cli.into_config().and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    let client = create_client(kubeconfig.as_deref()).await?;
    let apis = ClusterApis::from_client(client, &config.namespace);
    let prober = RetryingProber::new(config.http_timeout, config.http_retries)?;
    let result_dir = config.result_dir.clone();

    let orchestrator =
        ProbeOrchestrator::new(config, apis, Arc::new(prober), Arc::new(TracingReporter));
    let run = orchestrator.run(interrupt_signal()).await;

    if let Some(dir) = result_dir {
        match run.persist(&dir) {
            Ok(path) => info!(path = %path.display(), "wrote probe results"),
            Err(e) => error!(error = %e, dir = %dir.display(), "failed to write probe results"),
        }
    }

    if run.success {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(EXIT_RUN_FAILED))
    }
}
