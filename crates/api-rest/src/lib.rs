//! # API REST
//!
//! REST API implementation for Libris.
//!
//! Handles:
//! - HTTP endpoints with axum
//! - OpenAPI/Swagger documentation
//! - REST-specific concerns (status codes, JSON bodies, streaming uploads and downloads)
//!
//! Uses `libris-core` for everything else; this crate holds no business rules.

#![warn(rust_2018_idioms)]

pub mod dto;
pub mod error;
pub mod handlers;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use libris_core::Library;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use error::ApiError;

/// Application state for the REST API server
///
/// Cloned into every handler; the library's services share one catalog store.
#[derive(Clone)]
pub struct AppState {
    pub library: Arc<Library>,
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_files,
        handlers::file_info,
        handlers::download,
        handlers::upload,
        handlers::update,
        handlers::delete_file,
    ),
    components(schemas(
        dto::HealthRes,
        dto::ErrorRes,
        dto::FileEntry,
        dto::FileInfoRes,
        dto::UploadRes,
        dto::UpdateReq,
        dto::UpdateRes,
        dto::DeleteRes,
    ))
)]
pub struct ApiDoc;

/// Builds the router with every route, Swagger UI and request tracing.
///
/// The upload route has no body limit of its own: the validation policy enforces the global
/// and per-extension ceilings.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/files", get(handlers::list_files))
        .route("/file-info/:name", get(handlers::file_info))
        .route(
            "/uploads/:name",
            get(handlers::download).delete(handlers::delete_file),
        )
        .route(
            "/upload",
            post(handlers::upload).layer(DefaultBodyLimit::disable()),
        )
        .route("/update", put(handlers::update))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
