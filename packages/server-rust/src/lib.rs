//! Warren Server -- multi-tenant persistent cache with a primary/replica
//! topology, axum HTTP surface, and write-behind persistence.

pub mod archive;
pub mod cache;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod network;
pub mod registry;
pub mod replica;
pub mod store;
pub mod writer;

pub use config::{DeploymentMode, ServiceConfig};
pub use error::{ApiError, CacheError, RegistryError, StoreError};
pub use network::{build_router, NetworkConfig, NetworkModule, ShutdownController};
pub use registry::{InstanceFilter, InstanceRegistry, RegistryConfig};
pub use writer::{AsyncWriter, AsyncWriterConfig, WriterStats};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }
}

/// Integration tests for the HTTP surface.
///
/// Drives the assembled router end to end with in-memory backends:
/// write/read round-trips, cross-instance isolation, LWW conflict handling,
/// queue saturation, and replica fallthrough.
#[cfg(test)]
mod integration_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use tower::ServiceExt;

    use crate::cache::MemoryCache;
    use crate::config::{DeploymentMode, ServiceConfig};
    use crate::network::handlers::AppState;
    use crate::network::{build_router, NetworkConfig};
    use crate::registry::{InstanceRegistry, RegistryConfig};
    use crate::replica::PrimaryClient;
    use crate::store::{InstanceStore, MemoryStore};
    use crate::writer::{AsyncWriter, AsyncWriterConfig};

    struct Primary {
        cache: Arc<MemoryCache>,
        store: Arc<MemoryStore>,
        writer: Arc<AsyncWriter>,
        state: AppState,
    }

    fn primary_state(queue_size: usize, workers: usize) -> Primary {
        let config = Arc::new(ServiceConfig::default());
        let cache = Arc::new(MemoryCache::new());
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(InstanceRegistry::new(
            cache.clone(),
            RegistryConfig::default(),
        ));
        let writer = Arc::new(AsyncWriter::new(
            store.clone(),
            AsyncWriterConfig {
                queue_size,
                workers,
                backoff_unit: Duration::from_millis(10),
                ..AsyncWriterConfig::default()
            },
        ));
        let state = AppState::new(config, cache.clone(), registry)
            .with_store(store.clone())
            .with_writer(writer.clone());
        Primary {
            cache,
            store,
            writer,
            state,
        }
    }

    fn replica_state(primary_url: &str) -> (Arc<MemoryCache>, AppState) {
        let config = Arc::new(ServiceConfig {
            mode: DeploymentMode::Replica,
            primary_url: Some(primary_url.to_string()),
            ..ServiceConfig::default()
        });
        let cache = Arc::new(MemoryCache::new());
        let registry = Arc::new(InstanceRegistry::new(
            cache.clone(),
            RegistryConfig::default(),
        ));
        let primary = Arc::new(PrimaryClient::new(primary_url, Duration::from_secs(10)).unwrap());
        let state = AppState::new(config, cache.clone(), registry).with_primary(primary);
        (cache, state)
    }

    fn router(state: &AppState) -> axum::Router {
        build_router(state.clone(), &NetworkConfig::default())
    }

    async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, body)
    }

    fn put(key: &str, body: &str, instance: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(format!("/v1/cache/{key}"))
            .header("x-instance-id", instance)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn put_with_timestamp(key: &str, body: &str, instance: &str, ts: &str) -> Request<Body> {
        Request::builder()
            .method("PUT")
            .uri(format!("/v1/cache/{key}"))
            .header("x-instance-id", instance)
            .header("x-write-timestamp", ts)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(key: &str, instance: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(format!("/v1/cache/{key}"))
            .header("x-instance-id", instance)
            .body(Body::empty())
            .unwrap()
    }

    async fn drain(writer: &AsyncWriter) {
        for _ in 0..500 {
            let stats = writer.stats();
            if stats.persisted + stats.dropped + stats.rejected >= stats.enqueued
                && stats.queue_depth == 0
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("async writer did not drain");
    }

    #[tokio::test]
    async fn primary_write_read_round_trip_survives_a_cache_flush() {
        let primary = primary_state(1024, 2);
        let app = router(&primary.state);

        let (status, _) = send(&app, put("k1", "\"v1\"", "A")).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, get("k1", "A")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"\"v1\""));

        // Lose the cache; the durable store answers after the writer drains.
        drain(&primary.writer).await;
        primary.cache.clear();

        let (status, body) = send(&app, get("k1", "A")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"\"v1\""));
    }

    #[tokio::test]
    async fn writes_are_isolated_per_instance() {
        let primary = primary_state(1024, 2);
        let app = router(&primary.state);

        send(&app, put("shared", "\"fromA\"", "A")).await;
        send(&app, put("shared", "\"fromB\"", "B")).await;

        let (_, body_a) = send(&app, get("shared", "A")).await;
        let (_, body_b) = send(&app, get("shared", "B")).await;
        assert_eq!(body_a, Bytes::from_static(b"\"fromA\""));
        assert_eq!(body_b, Bytes::from_static(b"\"fromB\""));
    }

    #[tokio::test]
    async fn forwarded_writes_resolve_by_timestamp_not_arrival() {
        for swapped in [false, true] {
            let primary = primary_state(1024, 2);
            let app = router(&primary.state);

            let first = ("\"R1\"", "2024-01-01T00:00:00.000000001Z");
            let second = ("\"R2\"", "2024-01-01T00:00:00.000000002Z");
            let (early, late) = if swapped { (second, first) } else { (first, second) };

            send(&app, put_with_timestamp("k", early.0, "A", early.1)).await;
            send(&app, put_with_timestamp("k", late.0, "A", late.1)).await;
            drain(&primary.writer).await;

            let durable = primary.store.get("A", "k").await.unwrap();
            assert_eq!(
                durable.value,
                serde_json::json!("R2"),
                "larger timestamp must win (swapped = {swapped})",
            );
        }
    }

    #[tokio::test]
    async fn queue_saturation_drops_durability_but_not_the_response() {
        let primary = primary_state(1, 0);
        let app = router(&primary.state);

        let (status, _) = send(&app, put("k1", "\"a\"", "A")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&app, put("k2", "\"b\"", "A")).await;
        assert_eq!(status, StatusCode::OK, "client must not see the full queue");

        let stats = primary.writer.stats();
        assert_eq!(stats.enqueued, 1);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.persisted, 0);
        assert!(primary.store.is_empty());

        // Both values still serve from the cache.
        let (status, body) = send(&app, get("k2", "A")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"\"b\""));
    }

    #[tokio::test]
    async fn missing_key_is_404_with_the_error_body() {
        let primary = primary_state(16, 1);
        let app = router(&primary.state);

        let (status, body) = send(&app, get("ghost", "A")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "KEY_NOT_FOUND");
    }

    #[tokio::test]
    async fn delete_answers_204_regardless_of_presence() {
        let primary = primary_state(16, 1);
        let app = router(&primary.state);

        send(&app, put("k1", "\"v\"", "A")).await;
        let delete = |key: &str| {
            Request::builder()
                .method("DELETE")
                .uri(format!("/v1/cache/{key}"))
                .header("x-instance-id", "A")
                .body(Body::empty())
                .unwrap()
        };

        let (status, _) = send(&app, delete("k1")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&app, delete("never-existed")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = send(&app, get("k1", "A")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn batch_get_returns_entries_and_missing() {
        let primary = primary_state(16, 1);
        let app = router(&primary.state);

        send(&app, put("k1", "\"v1\"", "A")).await;
        send(&app, put("k2", "{\"n\": 2}", "A")).await;

        let request = Request::builder()
            .method("POST")
            .uri("/v1/cache/batch/get")
            .header("x-instance-id", "A")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"keys": ["k1", "k2", "k3"]}"#))
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["entries"]["k1"], "v1");
        assert_eq!(json["entries"]["k2"]["n"], 2);
        assert_eq!(json["missing"], serde_json::json!(["k3"]));
    }

    #[tokio::test]
    async fn paused_and_deleting_instances_are_gated() {
        let primary = primary_state(16, 1);
        let app = router(&primary.state);

        // First contact auto-creates, then we flip the status directly.
        // The short sleep lets the detached activity touch finish so it
        // cannot overwrite the status change below.
        send(&app, put("k", "\"v\"", "paused-tenant")).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut record = primary.state.registry.get("paused-tenant").await.unwrap();
        record.status = warren_core::InstanceStatus::Paused;
        primary.state.registry.update(&record).await.unwrap();

        let (status, body) = send(&app, get("k", "paused-tenant")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "INSTANCE_PAUSED");
        assert_eq!(json["status"], "paused");

        record.status = warren_core::InstanceStatus::Deleting;
        primary.state.registry.update(&record).await.unwrap();
        let (status, body) = send(&app, get("k", "paused-tenant")).await;
        assert_eq!(status, StatusCode::GONE);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "INSTANCE_DELETING");
    }

    #[tokio::test]
    async fn default_instance_becomes_permanent_on_first_contact() {
        let primary = primary_state(16, 1);
        let app = router(&primary.state);

        // No instance header anywhere: the default resolves.
        let request = Request::builder()
            .method("PUT")
            .uri("/v1/cache/k")
            .body(Body::from("\"v\""))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);

        let record = primary.state.registry.get("global").await.unwrap();
        assert!(record.is_permanent);
        assert_eq!(record.metadata["type"], "default");
        assert_eq!(record.metadata["created_by"], "system");
    }

    #[tokio::test]
    async fn health_and_root_endpoints_answer() {
        let primary = primary_state(16, 1);
        let app = router(&primary.state);

        let (status, body) = send(
            &app,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["mode"], "primary");
        assert!(json["queue_capacity"].is_number());

        let (status, body) = send(
            &app,
            Request::builder().uri("/").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["service"], "warren");
    }

    /// Serves a primary router on an ephemeral port; returns its base URL
    /// and the task handle (abort it to simulate a dead primary).
    async fn spawn_primary(state: AppState) -> (String, tokio::task::JoinHandle<()>) {
        let app = router(&state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), handle)
    }

    #[tokio::test]
    async fn replica_miss_falls_through_to_the_primary_and_caches() {
        let primary = primary_state(16, 1);
        // The primary's durable store has the value; its cache does not.
        primary
            .store
            .set("A", "k2", b"\"P\"", chrono::Utc::now())
            .await
            .unwrap();
        let (primary_url, primary_task) = spawn_primary(primary.state.clone()).await;

        let (_replica_cache, replica) = replica_state(&primary_url);
        let app = router(&replica);

        let (status, body) = send(&app, get("k2", "A")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"\"P\""));

        // Give the fire-and-forget backfill a moment to land.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Primary gone: the replica still answers from its local cache.
        primary_task.abort();
        let (status, body) = send(&app, get("k2", "A")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Bytes::from_static(b"\"P\""));
    }

    #[tokio::test]
    async fn replica_write_is_forwarded_to_the_primary() {
        let primary = primary_state(16, 1);
        let (primary_url, _primary_task) = spawn_primary(primary.state.clone()).await;

        let (_, replica) = replica_state(&primary_url);
        let app = router(&replica);

        let (status, _) = send(
            &app,
            put_with_timestamp("k", "\"R1\"", "A", "2024-01-01T00:00:00.000000001Z"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Forwarding is detached; wait for the primary's durable copy.
        for _ in 0..500 {
            if primary.store.exists("A", "k").await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drain(&primary.writer).await;

        let durable = primary.store.get("A", "k").await.unwrap();
        assert_eq!(durable.value, serde_json::json!("R1"));
        // The replica's tenant tag and timestamp rode the forward headers.
        assert_eq!(durable.instance_id, "A");
        assert_eq!(
            warren_core::format_write_timestamp(durable.updated_at),
            "2024-01-01T00:00:00.000000001Z",
        );
    }

    #[tokio::test]
    async fn replica_get_with_dead_primary_is_503() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_, replica) = replica_state(&format!("http://{addr}"));
        let app = router(&replica);

        let (status, body) = send(&app, get("k", "A")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["code"], "UPSTREAM_UNAVAILABLE");
    }
}
