mod routes;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::get,
    Router,
};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{client::TrainingClient, store::ResourceStore, Result};

/// HTTP front door over the query client.
pub struct Server {
    client: TrainingClient,
    store: Option<Arc<ResourceStore>>,
}

impl Server {
    pub fn new(client: TrainingClient) -> Self {
        Self { client, store: None }
    }

    /// Serve job listings from the watch cache instead of the cluster.
    pub fn with_store(mut self, store: Arc<ResourceStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build_router(self) -> Router {
        let state = Arc::new(self);

        Router::new()
            .route("/health", get(routes::health))
            .route("/metrics", get(routes::metrics))
            .route(
                "/namespaces/{namespace}/jobs",
                get(routes::list_jobs).post(routes::create_job),
            )
            .route(
                "/namespaces/{namespace}/jobs/{name}",
                get(routes::get_job).delete(routes::delete_job),
            )
            .route(
                "/namespaces/{namespace}/jobs/{name}/conditions",
                get(routes::get_conditions),
            )
            .route("/namespaces/{namespace}/jobs/{name}/pods", get(routes::list_pods))
            .route("/namespaces/{namespace}/jobs/{name}/wait", get(routes::wait_for_job))
            .route("/namespaces/{namespace}/jobs/{name}/logs", get(routes::stream_logs))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn start(
        self,
        addr: SocketAddr,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on {}", addr);
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
