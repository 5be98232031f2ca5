mod health;

use clap::{Parser, Subcommand, ValueEnum};
use health::HealthServer;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};
use loraplex_core::{ModelAdapter, MODEL_LABEL};
use loraplex_runtime::{
    AdapterController, ClusterApi, ControlPlane, ControlPlaneConfig, ControllerConfig,
    DiscoveryConfig, EventRouter, HttpControlPlane, KubeClusterApi, StatusRetryConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Pending triggers beyond this are coalesced by the controller anyway
const TRIGGER_BUFFER: usize = 64;

#[derive(Parser)]
#[command(name = "loraplex", about = "LoRA adapter controller for Kubernetes")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value = "text", global = true, env = "LORAPLEX_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the adapter controller against the current kubeconfig context
    Run {
        /// Seconds between full reconcile passes
        #[arg(long, default_value_t = 300, env = "LORAPLEX_RESYNC_INTERVAL_SECS")]
        resync_interval_secs: u64,
        /// Timeout for each call to a serving pod
        #[arg(long, default_value_t = 30, env = "LORAPLEX_HTTP_TIMEOUT_SECS")]
        http_timeout_secs: u64,
        /// Container port name exposing the adapter endpoints
        #[arg(long, default_value = "http", env = "LORAPLEX_ENDPOINT_PORT_NAME")]
        endpoint_port_name: String,
        /// Port used when no container port is named
        #[arg(long, default_value_t = 8000, env = "LORAPLEX_DEFAULT_PORT")]
        default_port: u16,
        /// Attempts per status write before giving up
        #[arg(long, default_value_t = 3)]
        status_retry_attempts: u32,
        /// Backoff step between status write attempts, in milliseconds
        #[arg(long, default_value_t = 1000)]
        status_retry_backoff_ms: u64,
        /// Address for /healthz and /readyz
        #[arg(long, default_value = "0.0.0.0:8081", env = "LORAPLEX_HEALTH_BIND")]
        health_bind: String,
    },
    /// Print the ModelAdapter CustomResourceDefinition as YAML
    Crd,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.log_format);

    match cli.command {
        Commands::Run {
            resync_interval_secs,
            http_timeout_secs,
            endpoint_port_name,
            default_port,
            status_retry_attempts,
            status_retry_backoff_ms,
            health_bind,
        } => {
            let config = ControllerConfig {
                resync_interval: Duration::from_secs(resync_interval_secs),
                discovery: DiscoveryConfig {
                    port_name: endpoint_port_name,
                    default_port,
                },
                status_retry: StatusRetryConfig {
                    max_attempts: status_retry_attempts,
                    backoff_step: Duration::from_millis(status_retry_backoff_ms),
                },
                ..Default::default()
            };
            let control_plane_config = ControlPlaneConfig {
                request_timeout: Duration::from_secs(http_timeout_secs),
            };
            run_controller(config, control_plane_config, &health_bind).await
        }
        Commands::Crd => {
            print!("{}", loraplex_core::crd_yaml()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Run the controller, both watch routers and the health endpoints
async fn run_controller(
    config: ControllerConfig,
    control_plane_config: ControlPlaneConfig,
    health_bind: &str,
) -> miette::Result<()> {
    info!("Starting loraplex adapter controller");

    let health_addr: std::net::SocketAddr = health_bind
        .parse()
        .map_err(|e| miette::miette!("Invalid health bind address '{}': {}", health_bind, e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| miette::miette!("Failed to create Kubernetes client: {}", e))?;

    let cluster: Arc<dyn ClusterApi> = Arc::new(KubeClusterApi::new(client.clone()));
    let control_plane: Arc<dyn ControlPlane> =
        Arc::new(HttpControlPlane::new(&control_plane_config)?);
    let controller = Arc::new(AdapterController::new(
        cluster.clone(),
        control_plane,
        config,
    ));

    let token = CancellationToken::new();
    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_BUFFER);
    let router = Arc::new(EventRouter::new(cluster, trigger_tx));

    // 1. Health endpoints
    let health = HealthServer::new(health_addr, controller.readiness());
    let health_token = token.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = health.run(health_token).await {
            error!("Health server error: {}", e);
        }
    });

    // 2. Pod watch
    let pods: Api<Pod> = Api::all(client.clone());
    let pod_events =
        watcher(pods, watcher::Config::default().labels(MODEL_LABEL)).default_backoff();
    let pod_router = router.clone();
    let pod_token = token.clone();
    let pod_handle = tokio::spawn(async move {
        if let Err(e) = pod_router.route_pod_events(pod_events, pod_token).await {
            error!("Pod event router error: {}", e);
        }
    });

    // 3. ModelAdapter watch
    let adapters: Api<ModelAdapter> = Api::all(client);
    let adapter_events = watcher(adapters, watcher::Config::default()).default_backoff();
    let adapter_router = router.clone();
    let adapter_token = token.clone();
    let adapter_handle = tokio::spawn(async move {
        if let Err(e) = adapter_router
            .route_adapter_events(adapter_events, adapter_token)
            .await
        {
            error!("Adapter event router error: {}", e);
        }
    });

    // 4. Controller
    let controller_token = token.clone();
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = controller.run(trigger_rx, controller_token).await {
            error!("Adapter controller error: {}", e);
        }
    });

    info!("All components started. Health endpoints on {}", health_addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    // Wait for all tasks to finish with a timeout
    let shutdown_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(
            health_handle,
            pod_handle,
            adapter_handle,
            controller_handle,
        );
    })
    .await;

    info!("Shutdown complete");

    Ok(())
}
