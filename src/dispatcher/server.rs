//! Binds the HTTP listener and runs the actix-web server as a background
//! task, bridging its lifecycle back to the caller through a `ServerHandle`
//! the way the teacher's status-server runner does.

use std::rc::Rc;
use std::sync::Arc;

use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};

use crate::config::ConfigSnapshot;
use crate::dispatcher::handlers::{self, AppState};
use crate::dispatcher::middleware::{ApiKeyAuth, CorsAllowList};
use crate::registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}: {source}")]
    Bind { addr: String, source: std::io::Error },
    #[error("server task panicked: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct RunningServer {
    pub handle: ServerHandle,
    pub join_handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl RunningServer {
    /// Bounded shutdown (P7): ask the server to stop gracefully, which
    /// drains in-flight connections, then join the task.
    pub async fn shutdown(self) -> Result<(), ServerError> {
        self.handle.stop(true).await;
        self.join_handle.await??;
        Ok(())
    }
}

pub fn run_server(addr: String, registry: Arc<Registry>, config: ConfigSnapshot) -> Result<RunningServer, ServerError> {
    let required_keys = Rc::new(config.required_api_keys.clone());
    let allowed_origins = Rc::new(config.allowed_origins.clone());
    let state = web::Data::new(AppState { registry, config });

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(CorsAllowList { allowed_origins: allowed_origins.clone() })
            .wrap(ApiKeyAuth { required_keys: required_keys.clone() })
            .route("/v1/chat/completions", web::post().to(handlers::chat_completions))
            .route("/v1/completions", web::post().to(handlers::completions))
            .route("/v1/embeddings", web::post().to(handlers::embeddings))
            .route("/v1/images/generations", web::post().to(handlers::images))
            .route("/v1/images/edits", web::post().to(handlers::images))
            .route("/v1/images/variations", web::post().to(handlers::images))
            .route("/v1/audio/speech", web::post().to(handlers::audio))
            .route("/v1/audio/transcriptions", web::post().to(handlers::audio))
            .route("/v1/audio/translations", web::post().to(handlers::audio))
            .route("/v1/models", web::get().to(handlers::list_models))
            .route("/upstream/{modelId}/{tail:.*}", web::route().to(handlers::upstream_passthrough))
    })
    .bind(&addr)
    .map_err(|source| ServerError::Bind { addr: addr.clone(), source })?
    .run();

    let handle = server.handle();
    let join_handle = tokio::spawn(server);

    Ok(RunningServer { handle, join_handle })
}
