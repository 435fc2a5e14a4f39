//! `/stream/:file_id` handler.
//!
//! Validates the auth hash, loads the (cached) file descriptor, negotiates
//! the byte range, borrows a worker and drives a linear or decrypting reader
//! into the response body. Headers are written only once range validation
//! and worker acquisition have succeeded; an error after the first body byte
//! can only close the connection.

use crate::cache::file_key;
use crate::error::Result;
use crate::metadata::{FileMeta, UserSession};
use crate::reader::{ranged_parts, ChunkSource, DecryptedReader, LinearReader};
use crate::server::http_range::{self, RangeError};
use crate::server::AppState;
use crate::telegram::fetcher::PartFetcher;
use crate::telegram::pool::{Connector, WorkerLease};
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use md5::{Digest, Md5};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Deserialize)]
pub(crate) struct StreamQuery {
    hash: Option<String>,
    d: Option<String>,
}

pub(crate) async fn stream_file<N>(
    State(state): State<Arc<AppState<N>>>,
    Path(file_id): Path<String>,
    Query(query): Query<StreamQuery>,
    method: Method,
    headers: HeaderMap,
) -> Response
where
    N: Connector,
    N::Conn: ChunkSource + PartFetcher,
{
    let hash = match query.hash.as_deref().filter(|hash| !hash.is_empty()) {
        Some(hash) => hash,
        None => return plain_error(StatusCode::BAD_REQUEST, "missing hash param"),
    };

    let session = match lookup_session(&state, hash).await {
        Ok(Some(session)) => session,
        Ok(None) => return plain_error(StatusCode::BAD_REQUEST, "invalid hash"),
        Err(err) => {
            error!("session lookup failed: {}", err);
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "session lookup failed");
        }
    };

    let file = match lookup_file(&state, &file_id).await {
        Ok(Some(file)) => file,
        Ok(None) => return plain_error(StatusCode::NOT_FOUND, "file not found"),
        Err(err) => {
            error!("metadata lookup failed: {}", err);
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "metadata lookup failed");
        }
    };

    // The service accepts ranges whatever happens next, so every response
    // from here on carries Accept-Ranges
    let (status, start, end, content_range) = match headers.get(header::RANGE) {
        None => (StatusCode::OK, 0, file.size - 1, None),
        Some(value) => {
            let value = match value.to_str() {
                Ok(value) => value,
                Err(_) => return bad_range(),
            };
            match http_range::parse(value, file.size) {
                Err(RangeError::NoOverlap) => return range_not_satisfiable(file.size),
                Err(RangeError::Malformed) => return bad_range(),
                Ok(ranges) if ranges.len() > 1 => {
                    return finish(
                        Response::builder()
                            .status(StatusCode::RANGE_NOT_SATISFIABLE)
                            .header(header::ACCEPT_RANGES, "bytes"),
                        Body::from("multiple ranges are not supported"),
                    )
                }
                Ok(ranges) => match ranges.first().copied() {
                    Some(range) => (
                        StatusCode::PARTIAL_CONTENT,
                        range.start,
                        range.end,
                        Some(format!("bytes {}-{}/{}", range.start, range.end, file.size)),
                    ),
                    None => return bad_range(),
                },
            }
        }
    };

    let content_length = end - start + 1;

    let lease = match acquire_worker(&state, &session, &file, start, end).await {
        Ok(lease) => lease,
        Err(err) => {
            error!("file stream: {}", err);
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "worker unavailable");
        }
    };

    let mime_type = if file.mime_type.is_empty() {
        "application/octet-stream"
    } else {
        file.mime_type.as_str()
    };
    let disposition = if query.d.as_deref() == Some("1") {
        "attachment"
    } else {
        "inline"
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, mime_type)
        .header(header::CONTENT_LENGTH, content_length.to_string())
        .header(header::ETAG, format!("\"{}\"", etag_of(&file)))
        .header(
            header::LAST_MODIFIED,
            file.updated_at.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        )
        .header(
            header::CONTENT_DISPOSITION,
            format!("{}; filename=\"{}\"", disposition, sanitize_filename(&file.name)),
        );
    if let Some(content_range) = content_range {
        builder = builder.header(header::CONTENT_RANGE, content_range);
    }

    if method == Method::HEAD {
        return finish(builder, Body::empty());
    }

    let parts = match lease.conn().file_parts(&file).await {
        Ok(parts) => parts,
        Err(err) => {
            error!("file stream: {}", err);
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to resolve parts");
        }
    };
    let parts = ranged_parts(&parts, start, end);

    let body = if file.encrypted {
        let encryption_key = state.config.telegram.uploads.encryption_key.clone();
        if encryption_key.is_empty() {
            error!("encrypted file requested but no encryption key is configured");
            return plain_error(StatusCode::INTERNAL_SERVER_ERROR, "encryption not configured");
        }
        stream_body(DecryptedReader::new(lease, parts, content_length, encryption_key))
    } else {
        stream_body(LinearReader::new(lease, parts, content_length))
    };

    finish(builder, body)
}

/// Resolve the auth hash through the session cache.
async fn lookup_session<N: Connector>(
    state: &AppState<N>,
    hash: &str,
) -> Result<Option<UserSession>> {
    if let Some(session) = state.session_cache.get(hash) {
        return Ok(Some(session));
    }
    let session = state.store.session_by_hash(hash).await?;
    if let Some(session) = &session {
        state.session_cache.set(hash, session.clone());
    }
    Ok(session)
}

/// Resolve the file descriptor through the metadata cache.
async fn lookup_file<N: Connector>(state: &AppState<N>, file_id: &str) -> Result<Option<FileMeta>> {
    let key = file_key(file_id);
    if let Some(file) = state.file_cache.get(&key) {
        return Ok(Some(file));
    }
    let file = state.store.file_by_id(file_id).await?;
    if let Some(file) = &file {
        state.file_cache.set(&key, file.clone());
    }
    Ok(file)
}

/// Pick the worker serving this request: a channel bot when the pool is
/// enabled and tokens exist, the user-session worker otherwise.
async fn acquire_worker<N: Connector>(
    state: &AppState<N>,
    session: &UserSession,
    file: &FileMeta,
    start: i64,
    end: i64,
) -> Result<WorkerLease<N::Conn>> {
    let tokens = state
        .store
        .bot_tokens(session.user_id, file.channel_id)
        .await?;

    if state.config.telegram.disable_stream_bots || tokens.is_empty() {
        let lease = state
            .worker
            .user_worker(&session.session, session.user_id)
            .await?;
        debug!(
            "requesting file {} via user {} range {}-{} of {}",
            file.name,
            lease.tag(),
            start,
            end,
            file.size
        );
        return Ok(lease);
    }

    let limit = tokens.len().min(state.config.telegram.bg_bots_limit);
    state.worker.set(&tokens[..limit], file.channel_id).await?;
    let (lease, index) = state.worker.next(file.channel_id).await?;
    debug!(
        "requesting file {} via bot {} (worker {}) range {}-{} of {}",
        file.name,
        lease.tag(),
        index,
        start,
        end,
        file.size
    );
    Ok(lease)
}

/// Pull-to-push adapter between a reader and the response body.
#[async_trait::async_trait]
trait DriveReader: Send {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>>;
}

#[async_trait::async_trait]
impl<S: ChunkSource + Send + Sync> DriveReader for LinearReader<S> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        LinearReader::next_chunk(self).await
    }
}

#[async_trait::async_trait]
impl<S: ChunkSource + Send + Sync> DriveReader for DecryptedReader<S> {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        DecryptedReader::next_chunk(self).await
    }
}

/// Stream a reader to completion; an error mid-body aborts the connection
/// without any further framing.
fn stream_body<R: DriveReader + 'static>(mut reader: R) -> Body {
    Body::from_stream(async_stream::stream! {
        loop {
            match reader.next_chunk().await {
                Ok(Some(chunk)) => yield Ok::<Bytes, std::io::Error>(chunk),
                Ok(None) => break,
                Err(err) => {
                    error!("stream aborted: {}", err);
                    yield Err(std::io::Error::other(err));
                    break;
                }
            }
        }
    })
}

/// Weak validator over the descriptor's identity and size.
fn etag_of(file: &FileMeta) -> String {
    let mut hasher = Md5::new();
    hasher.update(file.id.as_bytes());
    hasher.update(file.size.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Keep header-hostile characters out of the disposition filename.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_control() || c == '"' || c == '\\' {
                '_'
            } else {
                c
            }
        })
        .collect()
}

fn plain_error(status: StatusCode, message: &str) -> Response {
    (status, message.to_string()).into_response()
}

fn bad_range() -> Response {
    let builder = Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .header(header::ACCEPT_RANGES, "bytes");
    finish(builder, Body::from(RangeError::Malformed.to_string()))
}

fn range_not_satisfiable(size: i64) -> Response {
    let builder = Response::builder()
        .status(StatusCode::RANGE_NOT_SATISFIABLE)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_RANGE, format!("bytes */{}", size));
    finish(builder, Body::from(RangeError::NoOverlap.to_string()))
}

fn finish(builder: axum::http::response::Builder, body: Body) -> Response {
    match builder.body(body) {
        Ok(response) => response,
        Err(err) => {
            error!("failed to build response: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
