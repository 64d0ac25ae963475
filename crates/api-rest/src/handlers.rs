//! Route handlers.
//!
//! Handlers never touch the filesystem on the async executor: core calls run on the blocking
//! pool, and upload bytes are handed to a blocking worker through a bounded channel.

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Json, Response},
};
use futures::StreamExt;
use libris_core::constants::DOWNLOAD_CHUNK_SIZE;
use libris_core::{IngestReport, LibraryError, LibraryResult};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

use crate::dto::{
    DeleteRes, ErrorRes, FileEntry, FileInfoRes, HealthRes, UpdateReq, UpdateRes, UploadRes,
};
use crate::error::ApiError;
use crate::AppState;

/// Body chunks buffered between the request stream and the staging worker.
const UPLOAD_CHANNEL_DEPTH: usize = 16;

async fn run_blocking<T, F>(task: F) -> Result<T, ApiError>
where
    F: FnOnce() -> LibraryResult<T> + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(task).await??)
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Health check response", body = HealthRes)
    )
)]
/// Health check endpoint for the REST API
///
/// Used by monitoring and load balancer health checks.
pub async fn health() -> Json<HealthRes> {
    Json(HealthRes {
        ok: true,
        message: "Libris REST API is alive".into(),
    })
}

#[utoipa::path(
    get,
    path = "/files",
    responses(
        (status = 200, description = "Every catalog entry", body = [FileEntry]),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// List all cataloged files
///
/// # Returns
/// * `Json<Vec<FileEntry>>` - The catalog, in catalog order, with derived MB/GB sizes
pub async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<FileEntry>>, ApiError> {
    let library = state.library.clone();
    let entries = run_blocking(move || Ok(library.entries().list())).await?;
    Ok(Json(entries.into_iter().map(FileEntry::from).collect()))
}

#[utoipa::path(
    get,
    path = "/file-info/{name}",
    params(("name" = String, Path, description = "Stored file name")),
    responses(
        (status = 200, description = "Detailed file metadata", body = FileInfoRes),
        (status = 400, description = "Invalid path", body = ErrorRes),
        (status = 404, description = "File not found", body = ErrorRes),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// Detailed, freshly computed metadata for one stored file
///
/// Size, timestamps, content hash and type metadata are recomputed from the file on every
/// call; label, scroll position, tags and description come from the catalog when cataloged.
///
/// # Errors
/// Returns `400 Bad Request` for names containing `/`, `\` or `..`, and `404 Not Found` if
/// no stored file carries the name.
pub async fn file_info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<FileInfoRes>, ApiError> {
    let library = state.library.clone();
    let info = run_blocking(move || library.retrieval().file_info(&name)).await?;
    Ok(Json(info.into()))
}

#[utoipa::path(
    get,
    path = "/uploads/{name}",
    params(("name" = String, Path, description = "Stored file name")),
    responses(
        (status = 200, description = "The file's bytes"),
        (status = 400, description = "Invalid path", body = ErrorRes),
        (status = 404, description = "File not found", body = ErrorRes)
    )
)]
/// Download a stored file
///
/// Streams the file in fixed-size chunks as an attachment. Files above 100 MiB carry a
/// private cache-control hint.
pub async fn download(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let library = state.library.clone();
    let target = run_blocking(move || library.retrieval().download(&name)).await?;

    let file = tokio::fs::File::open(&target.path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LibraryError::NotFound(target.name.to_string())
        } else {
            LibraryError::Io(e)
        }
    })?;
    let stream = ReaderStream::with_capacity(file, DOWNLOAD_CHUNK_SIZE);

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(target.mime_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(target.size_bytes));
    headers.insert(
        header::CONTENT_DISPOSITION,
        attachment_header(target.name.as_str(), &target.content_disposition()),
    );
    if let Some(cache_control) = target.cache_control {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache_control));
    }

    Ok((headers, Body::from_stream(stream)).into_response())
}

/// Encodes a `Content-Disposition` value, degrading to a bare `attachment` if it is not a
/// valid header value.
fn attachment_header(name: &str, disposition: &str) -> HeaderValue {
    HeaderValue::from_str(disposition).unwrap_or_else(|e| {
        tracing::warn!(
            "content disposition for {} is not a valid header ({}); sending a bare attachment",
            name,
            e
        );
        HeaderValue::from_static("attachment")
    })
}

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = String, content_type = "multipart/form-data", description = "One file part"),
    responses(
        (status = 200, description = "File stored and cataloged", body = UploadRes),
        (status = 400, description = "Malformed request, rejected type or payload too large", body = ErrorRes),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// Upload one file
///
/// The body is decoded as it arrives. The extension is checked as soon as the filename is
/// known, before any payload byte is written; the payload then streams into a staging file
/// under the per-extension ceiling. A name already in use is deduplicated as `base_1.ext`,
/// `base_2.ext`, ...
///
/// # Errors
/// Returns `400 Bad Request` if:
/// - the request is not `multipart/form-data` or carries no file part,
/// - the body ends before the file part is complete, or the file is empty,
/// - the extension is not on the allow-list,
/// - the declared length or the payload exceeds its ceiling.
pub async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<UploadRes>, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let mut session = state.library.ingest().begin_upload(content_type, declared_len)?;

    let (tx, mut rx) = mpsc::channel::<Result<Bytes, String>>(UPLOAD_CHANNEL_DEPTH);
    let worker = tokio::task::spawn_blocking(move || -> LibraryResult<IngestReport> {
        while let Some(chunk) = rx.blocking_recv() {
            let chunk = chunk.map_err(|e| {
                LibraryError::MalformedMultipart(format!("request body interrupted: {e}"))
            })?;
            session.feed(&chunk)?;
        }
        session.finish()
    });

    let mut stream = body.into_data_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string());
        let interrupted = chunk.is_err();
        // A closed channel means the worker already failed; its error is reported below.
        if tx.send(chunk).await.is_err() || interrupted {
            break;
        }
    }
    drop(tx);

    let report = worker.await??;
    Ok(Json(report.into()))
}

#[utoipa::path(
    put,
    path = "/update",
    request_body = UpdateReq,
    responses(
        (status = 200, description = "Entry updated", body = UpdateRes),
        (status = 400, description = "Missing name or invalid JSON", body = ErrorRes),
        (status = 404, description = "Entry not found", body = ErrorRes),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// Update the user-editable fields of a catalog entry
///
/// Accepts `scroll`/`scroll_position`, `categoria`/`label`, `descripcion`/`description` and
/// `tags` (array or comma-separated string). Absent fields are left unchanged.
pub async fn update(State(state): State<AppState>, body: Bytes) -> Result<Json<UpdateRes>, ApiError> {
    let library = state.library.clone();
    let entry = run_blocking(move || library.entries().update_from_json(&body)).await?;
    Ok(Json(UpdateRes {
        success: true,
        message: format!("{} updated", entry.name),
        entry: entry.into(),
    }))
}

#[utoipa::path(
    delete,
    path = "/uploads/{name}",
    params(("name" = String, Path, description = "Stored file name")),
    responses(
        (status = 200, description = "File and entry deleted", body = DeleteRes),
        (status = 400, description = "Invalid path", body = ErrorRes),
        (status = 404, description = "Entry not found", body = ErrorRes),
        (status = 500, description = "Internal server error", body = ErrorRes)
    )
)]
/// Delete a stored file and its catalog entry
///
/// # Errors
/// Returns `404 Not Found` if the catalog has no entry for the name, even when a file with
/// that name exists in storage.
pub async fn delete_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<DeleteRes>, ApiError> {
    let library = state.library.clone();
    let message = format!("{name} deleted");
    run_blocking(move || library.entries().delete(&name)).await?;
    Ok(Json(DeleteRes {
        success: true,
        message,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attachment_header_keeps_encodable_value() {
        let value = attachment_header(
            "café.pdf",
            "attachment; filename=\"caf_.pdf\"; filename*=UTF-8''caf%C3%A9.pdf",
        );

        assert_eq!(
            value,
            "attachment; filename=\"caf_.pdf\"; filename*=UTF-8''caf%C3%A9.pdf"
        );
    }

    #[test]
    fn test_attachment_header_falls_back_to_bare_attachment() {
        let value = attachment_header("bad.txt", "attachment; filename=\"bad\r\n.txt\"");

        assert_eq!(value, "attachment");
    }
}
