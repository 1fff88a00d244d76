use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use trainjob_operator::{
    client::TrainingClient,
    config::{ClusterBackend, Config},
    controllers::{ControllerSettings, TrainingJobController, WorkQueue},
    kubernetes::{ClusterApi, InMemoryCluster, KubeCluster},
    server::Server,
    store::ResourceStore,
};

#[derive(Debug, Parser)]
#[command(name = "trainjob-operator", about = "Runs TrainingJobs as master/worker pods")]
struct Args {
    /// Address for the HTTP API; overrides SERVER_ADDR
    #[arg(long)]
    addr: Option<String>,

    /// Concurrent reconcile workers; overrides CONTROLLER_WORKERS
    #[arg(long)]
    workers: Option<usize>,

    /// Run against a cluster held in process memory
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(workers) = args.workers {
        config.controller.workers = workers;
    }
    if args.in_memory {
        config.kube.backend = ClusterBackend::InMemory;
    }
    config.validate()?;
    info!("Loaded configuration: {:?}", config);

    let cluster: Arc<dyn ClusterApi> = match config.kube.backend {
        ClusterBackend::Kubernetes => Arc::new(KubeCluster::new(config.kube.namespace.clone()).await?),
        ClusterBackend::InMemory => Arc::new(InMemoryCluster::with_event_buffer(config.controller.event_buffer)),
    };

    let store = Arc::new(ResourceStore::new(config.controller.event_buffer));
    tokio::spawn(store.clone().run(cluster.watch()));

    let queue = WorkQueue::new();
    let controller = Arc::new(TrainingJobController::new(
        cluster.clone(),
        store.clone(),
        ControllerSettings::from_config(&config),
    ));
    let controller_task = tokio::spawn(controller.run(queue.clone()));

    let namespace = config.kube.namespace.clone().unwrap_or_else(|| "default".to_string());
    let server = Server::new(TrainingClient::new(cluster, namespace)).with_store(store);
    let addr: SocketAddr = config
        .server
        .addr
        .parse()
        .with_context(|| format!("invalid server address {}", config.server.addr))?;

    let shutdown_queue = queue.clone();
    server
        .start(addr, async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
            shutdown_queue.shutdown();
        })
        .await?;

    queue.shutdown();
    controller_task.await??;
    Ok(())
}
