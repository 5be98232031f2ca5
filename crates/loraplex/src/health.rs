use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Liveness and readiness endpoints for the controller pod
pub struct HealthServer {
    listen_addr: SocketAddr,
    ready: Arc<AtomicBool>,
}

impl HealthServer {
    pub fn new(listen_addr: SocketAddr, ready: Arc<AtomicBool>) -> Self {
        Self { listen_addr, ready }
    }

    fn build_router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .with_state(self.ready.clone())
    }

    /// Bind and serve until `token` is cancelled
    pub async fn run(self, token: CancellationToken) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        self.serve(listener, token).await
    }

    /// Serve on an already bound listener
    pub async fn serve(
        self,
        listener: TcpListener,
        token: CancellationToken,
    ) -> Result<(), std::io::Error> {
        info!("Health endpoints listening on {}", listener.local_addr()?);
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await
    }
}

/// Process is up
async fn healthz() -> &'static str {
    "ok"
}

/// First reconcile pass has completed
async fn readyz(State(ready): State<Arc<AtomicBool>>) -> (StatusCode, &'static str) {
    if ready.load(Ordering::SeqCst) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_readyz_follows_flag() {
        let ready = Arc::new(AtomicBool::new(false));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();

        let server = HealthServer::new(addr, ready.clone());
        let handle = tokio::spawn(server.serve(listener, token.clone()));

        let base = format!("http://{}", addr);
        let health = reqwest::get(format!("{}/healthz", base)).await.unwrap();
        assert_eq!(health.status().as_u16(), 200);

        let before = reqwest::get(format!("{}/readyz", base)).await.unwrap();
        assert_eq!(before.status().as_u16(), 503);

        ready.store(true, Ordering::SeqCst);
        let after = reqwest::get(format!("{}/readyz", base)).await.unwrap();
        assert_eq!(after.status().as_u16(), 200);

        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
