//! HTTP front-end.
//!
//! One route: `GET|HEAD /stream/:file_id?hash=<hex>[&d=1]`. The handler
//! lives in [`stream`]; this module owns the shared state, the router and
//! the serve loop with graceful shutdown.

pub mod http_range;
mod stream;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metadata::{FileMeta, MetaStore, UserSession};
use crate::reader::ChunkSource;
use crate::telegram::fetcher::PartFetcher;
use crate::telegram::pool::{Connector, StreamWorker};
use axum::routing::get;
use axum::Router;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};

/// Shared state behind every request.
pub struct AppState<N: Connector> {
    pub config: Config,
    pub store: Arc<dyn MetaStore>,
    pub file_cache: TtlCache<FileMeta>,
    pub session_cache: TtlCache<UserSession>,
    pub worker: StreamWorker<N>,
}

impl<N: Connector> AppState<N> {
    /// Assemble the state from configuration, a metadata store and a worker
    /// connector.
    pub fn new(config: Config, store: Arc<dyn MetaStore>, connector: N) -> Self {
        let ttl = Duration::from_secs(config.cache.ttl_secs);
        let capacity = config.cache.capacity;
        let worker = StreamWorker::new(
            connector,
            config.telegram.uploads.threads,
            config.pool_idle_ttl(),
        );

        AppState {
            config,
            store,
            file_cache: TtlCache::new(ttl, capacity),
            session_cache: TtlCache::new(ttl, capacity),
            worker,
        }
    }
}

/// Build the service router.
pub fn router<N>(state: Arc<AppState<N>>) -> Router
where
    N: Connector,
    N::Conn: ChunkSource + PartFetcher,
{
    Router::new()
        .route("/stream/:file_id", get(stream::stream_file::<N>))
        .with_state(state)
}

/// Serve until interrupted, then drain connections within the configured
/// graceful-shutdown window.
pub async fn serve<N>(state: Arc<AppState<N>>) -> Result<()>
where
    N: Connector,
    N::Conn: ChunkSource + PartFetcher,
{
    let port = state.config.server.port;
    let grace = Duration::from_secs(state.config.server.graceful_shutdown_secs);
    let app = router(state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).await.map_err(Error::Io)?;
    info!("listening on {}", addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    let mut drain_rx = shutdown_rx.clone();
    let server = async move {
        let mut rx = shutdown_rx;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.changed().await;
            })
            .await
    };
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => result.map_err(Error::Io),
        _ = async {
            let _ = drain_rx.changed().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!("graceful shutdown window elapsed, closing remaining connections");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::encrypt_part;
    use crate::metadata::{MemoryStore, PartMeta, SessionRow};
    use crate::testing::{FakeBackend, FakeConnector};
    use axum::body::Body;
    use axum::http::{HeaderMap, Request, StatusCode};
    use bytes::Bytes;
    use chrono::TimeZone;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const KEY: &str = "test-encryption-key";

    async fn send(
        router: &Router,
        method: &str,
        uri: &str,
        range: Option<&str>,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(range) = range {
            builder = builder.header("Range", range);
        }
        let response = router
            .clone()
            .oneshot(builder.body(Body::empty()).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, body)
    }

    fn header<'h>(headers: &'h HeaderMap, name: &str) -> &'h str {
        headers
            .get(name)
            .unwrap_or_else(|| panic!("missing header {}", name))
            .to_str()
            .unwrap()
    }

    /// A served file of the given part sizes; returns the router and the
    /// expected plaintext.
    fn fixture(encrypted: bool, sizes: &[usize], tokens: &[&str]) -> (Router, Vec<u8>) {
        let backend = Arc::new(FakeBackend::new());
        let store = MemoryStore::new();

        let mut file_bytes = Vec::new();
        let mut parts = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let id = (i + 1) as i32;
            let data: Vec<u8> = (0..size).map(|b| ((b * 11 + i * 3) % 251) as u8).collect();
            file_bytes.extend_from_slice(&data);
            if encrypted {
                let salt = hex::encode([i as u8 + 1; 16]);
                let doc = encrypt_part(KEY, &hex::decode(&salt).unwrap(), &data).unwrap();
                backend.insert_doc(id, doc);
                parts.push(PartMeta { id, salt: Some(salt) });
            } else {
                backend.insert_doc(id, data);
                parts.push(PartMeta { id, salt: None });
            }
        }

        store.insert_file(FileMeta {
            id: "f1".to_string(),
            name: "video.mkv".to_string(),
            mime_type: "video/x-matroska".to_string(),
            size: file_bytes.len() as i64,
            encrypted,
            channel_id: 100,
            updated_at: chrono::Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            parts,
        });
        store.insert_session(SessionRow {
            hash: "h1".to_string(),
            user_id: 7,
            session: "1sess".to_string(),
        });
        store.set_bot_tokens(7, 100, tokens.iter().map(|t| t.to_string()).collect());

        let mut config = Config::default();
        config.telegram.uploads.encryption_key = KEY.to_string();
        let state = Arc::new(AppState::new(
            config,
            Arc::new(store),
            FakeConnector::new(backend),
        ));
        (router(state), file_bytes)
    }

    fn plain_fixture() -> (Router, Vec<u8>) {
        fixture(false, &[40, 30, 30], &["111:aa", "222:bb", "333:cc"])
    }

    #[tokio::test]
    async fn test_get_without_range() {
        let (router, file) = plain_fixture();
        let (status, headers, body) = send(&router, "GET", "/stream/f1?hash=h1", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(header(&headers, "accept-ranges"), "bytes");
        assert_eq!(header(&headers, "content-length"), "100");
        assert_eq!(header(&headers, "content-type"), "video/x-matroska");
        assert_eq!(
            header(&headers, "last-modified"),
            "Wed, 01 May 2024 12:00:00 GMT"
        );
        assert_eq!(
            header(&headers, "content-disposition"),
            "inline; filename=\"video.mkv\""
        );

        let etag = header(&headers, "etag");
        assert!(etag.starts_with('"') && etag.ends_with('"') && etag.len() == 34);

        assert_eq!(body.as_ref(), file.as_slice());
    }

    #[tokio::test]
    async fn test_range_within_one_part() {
        let (router, file) = plain_fixture();
        let (status, headers, body) =
            send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=50-59")).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&headers, "content-range"), "bytes 50-59/100");
        assert_eq!(header(&headers, "content-length"), "10");
        assert_eq!(body.as_ref(), &file[50..60]);
    }

    #[tokio::test]
    async fn test_range_spanning_all_parts() {
        let (router, file) = plain_fixture();
        let (status, headers, body) =
            send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=0-99")).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&headers, "content-length"), "100");
        assert_eq!(body.as_ref(), file.as_slice());
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        let (router, _) = plain_fixture();
        let (status, headers, _) =
            send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=200-300")).await;

        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(header(&headers, "accept-ranges"), "bytes");
        assert_eq!(header(&headers, "content-range"), "bytes */100");
    }

    #[tokio::test]
    async fn test_multiple_ranges_rejected() {
        let (router, _) = plain_fixture();
        let (status, _, body) =
            send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=0-10,20-30")).await;

        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(body.as_ref(), b"multiple ranges are not supported");
    }

    #[tokio::test]
    async fn test_malformed_range() {
        let (router, _) = plain_fixture();
        let (status, headers, body) =
            send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=zz-5")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(header(&headers, "accept-ranges"), "bytes");
        assert_eq!(body.as_ref(), b"invalid range");
    }

    #[tokio::test]
    async fn test_head_matches_get_headers() {
        let (router, _) = plain_fixture();
        let (get_status, get_headers, get_body) =
            send(&router, "GET", "/stream/f1?hash=h1", None).await;
        let (head_status, head_headers, head_body) =
            send(&router, "HEAD", "/stream/f1?hash=h1", None).await;

        assert_eq!(get_status, StatusCode::OK);
        assert_eq!(head_status, StatusCode::OK);
        assert!(head_body.is_empty());
        assert_eq!(get_body.len(), 100);

        for name in [
            "accept-ranges",
            "content-length",
            "content-type",
            "etag",
            "last-modified",
            "content-disposition",
        ] {
            assert_eq!(
                header(&get_headers, name),
                header(&head_headers, name),
                "header {} differs",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_missing_hash() {
        let (router, _) = plain_fixture();
        let (status, _, body) = send(&router, "GET", "/stream/f1", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.as_ref(), b"missing hash param");
    }

    #[tokio::test]
    async fn test_unknown_hash() {
        let (router, _) = plain_fixture();
        let (status, _, body) = send(&router, "GET", "/stream/f1?hash=nope", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.as_ref(), b"invalid hash");
    }

    #[tokio::test]
    async fn test_unknown_file() {
        let (router, _) = plain_fixture();
        let (status, _, _) = send(&router, "GET", "/stream/nope?hash=h1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_attachment_disposition() {
        let (router, _) = plain_fixture();
        let (_, headers, _) = send(&router, "GET", "/stream/f1?hash=h1&d=1", None).await;
        assert_eq!(
            header(&headers, "content-disposition"),
            "attachment; filename=\"video.mkv\""
        );
    }

    #[tokio::test]
    async fn test_repeat_requests_are_identical() {
        let (router, _) = plain_fixture();
        let (_, _, first) = send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=13-77")).await;
        let (_, _, second) = send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=13-77")).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_user_worker_fallback_without_tokens() {
        let (router, file) = fixture(false, &[40, 30, 30], &[]);
        let (status, _, body) = send(&router, "GET", "/stream/f1?hash=h1", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), file.as_slice());
    }

    #[tokio::test]
    async fn test_encrypted_range_across_block_boundary() {
        let (router, file) = fixture(true, &[1024 * 1024], &["111:aa"]);
        let (status, headers, body) =
            send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=65530-65540")).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(header(&headers, "content-length"), "11");
        assert_eq!(body.as_ref(), &file[65_530..65_541]);
    }

    #[tokio::test]
    async fn test_encrypted_full_file() {
        let (router, file) = fixture(true, &[100_000, 60_000], &["111:aa", "222:bb"]);
        let (status, _, body) = send(&router, "GET", "/stream/f1?hash=h1", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), file.as_slice());
    }

    #[tokio::test]
    async fn test_encrypted_range_crossing_parts() {
        let (router, file) = fixture(true, &[100_000, 60_000], &["111:aa"]);
        let (status, _, body) =
            send(&router, "GET", "/stream/f1?hash=h1", Some("bytes=99990-100009")).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(body.as_ref(), &file[99_990..100_010]);
    }
}
