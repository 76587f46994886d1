//! HTTP server with deferred startup.
//!
//! `new()` holds the configuration, `start()` binds the listener, and
//! `serve()` accepts requests until shutdown. Binding early lets the caller
//! learn the OS-assigned port before traffic starts.

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{
    cancel_workflow_handler, confirm_step_handler, deregister_instance_handler, health_handler,
    ledger_handler, list_instances_handler, liveness_handler, readiness_handler,
    register_instance_handler, submit_operation_handler, submit_template_handler,
    submit_workflow_handler, workflow_status_handler, AppState,
};
use super::middleware::build_http_layers;
use crate::service::Orchestrator;

/// Assembles every route with the HTTP middleware stack.
pub fn build_router(orchestrator: Arc<Orchestrator>, config: &NetworkConfig) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route(
            "/instances",
            get(list_instances_handler).post(register_instance_handler),
        )
        .route(
            "/instances/{instance_id}",
            delete(deregister_instance_handler),
        )
        .route(
            "/sessions/{session_id}/operations",
            post(submit_operation_handler),
        )
        .route("/sessions/{session_id}/ledger", get(ledger_handler))
        .route("/workflows", post(submit_workflow_handler))
        .route("/workflows/{workflow_id}", get(workflow_status_handler))
        .route(
            "/workflows/{workflow_id}/cancel",
            post(cancel_workflow_handler),
        )
        .route(
            "/workflows/{workflow_id}/steps/{step_id}/confirm",
            post(confirm_step_handler),
        )
        .route("/templates/{template}", post(submit_template_handler))
        .layer(build_http_layers(config))
        .with_state(AppState::new(orchestrator))
}

pub struct NetworkModule {
    config: NetworkConfig,
    orchestrator: Arc<Orchestrator>,
    listener: Option<TcpListener>,
}

impl NetworkModule {
    #[must_use]
    pub fn new(config: NetworkConfig, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
            listener: None,
        }
    }

    /// Binds the listener. Returns the bound port, which differs from the
    /// configured one when that is 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        let port = listener.local_addr()?.port();
        info!(host = %self.config.host, port, "listener bound");
        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves until `shutdown` resolves or the orchestrator starts draining,
    /// whichever comes first. Requests already in progress are allowed to
    /// finish.
    ///
    /// # Errors
    ///
    /// Fails when `start()` was not called, or on a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .context("start() must be called before serve()")?;
        let mut draining = self.orchestrator.lifecycle().drain_receiver();
        let router = build_router(self.orchestrator, &self.config);

        let drained = async move {
            let _ = draining.wait_for(|draining| *draining).await;
        };
        let signal = async move {
            tokio::select! {
                () = shutdown => {}
                () = drained => {}
            }
            info!("http server shutting down");
        };

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use portalfed_core::InstanceSpec;

    use super::*;
    use crate::service::OrchestratorConfig;

    fn orchestrator() -> Arc<Orchestrator> {
        let config = OrchestratorConfig {
            instances: vec![InstanceSpec::new(
                "core",
                "http://127.0.0.1:9",
                ["performance"],
            )],
            ..OrchestratorConfig::default()
        };
        Arc::new(Orchestrator::builder(config).build().unwrap())
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        };
        let mut module = NetworkModule::new(config, orchestrator());
        let port = module.start().await.unwrap();
        assert!(port > 0);
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_without_start_is_an_error() {
        let module = NetworkModule::new(NetworkConfig::default(), orchestrator());
        let err = module
            .serve(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn drain_stops_the_server() {
        let orch = orchestrator();
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            ..NetworkConfig::default()
        };
        let mut module = NetworkModule::new(config, Arc::clone(&orch));
        module.start().await.unwrap();
        let server = tokio::spawn(module.serve(std::future::pending::<()>()));

        orch.lifecycle().begin_drain();
        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), server).await;
        assert!(matches!(outcome, Ok(Ok(Ok(())))));
    }
}
