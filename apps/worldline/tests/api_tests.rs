//! Integration tests for the Worldline HTTP API.
//!
//! Uses axum-test to drive the router without binding a port. Every server
//! runs real shard worker threads over in-memory stores.

// Allow unwrap and panic in tests - these are standard for test code
// Allow holding MutexGuard across await - tests that touch env vars are
// serialized on purpose
#![allow(clippy::unwrap_used, clippy::panic, clippy::await_holding_lock)]

use axum::http::{HeaderValue, StatusCode, header};
use axum_test::TestServer;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use worldline::api::{
    API_KEY_ENV, AppState, BatchRequest, BatchResponse, CursorResponse, ErrorResponse,
    ExportResponse, HashResponse, HealthResponse, IngestResponse, OutcomeKind, RATE_LIMIT_ENV,
    SourceResponse, StatusResponse, create_router,
};
use worldline::{Config, Pipeline};
use worldline_core::{
    Anomaly, BlobRef, BlobResolver, CanonicalSnapshot, ClassPolicy, CurrentState, Digest,
    Entanglement, EventPayload, FieldMask, GapPolicy, IngestedEvent, MemoryBlobStore, OrderingKey,
    Page, PolicyTable, Registry, Rejection, ShardConfig, StateVersion, VerificationStatus,
    WorldlineId,
};

/// Serializes tests since the router reads env vars.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const CONFIG: &str = r#"
[storage]
backend = "memory"

[ingest]
shards = 4
gap_policy = "hold"
tick_interval_ms = 5

[[classes]]
id = "GOLD_VAULT"
phases = ["ORIGINATED", "ONCHAIN_ACTIVE", "REDEEMED"]
transitions = [["ORIGINATED", "ONCHAIN_ACTIVE"], ["ONCHAIN_ACTIVE", "REDEEMED"]]
rel_types = ["COLLATERAL_FOR"]
"#;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

/// Guard that holds the env mutex and clears auth on drop.
struct TestGuard {
    _guard: std::sync::MutexGuard<'static, ()>,
}

impl Drop for TestGuard {
    fn drop(&mut self) {
        // SAFETY: Tests touching the environment run under ENV_MUTEX.
        unsafe { std::env::remove_var(API_KEY_ENV) };
    }
}

fn lock_env(api_key: Option<&str>) -> TestGuard {
    let guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
    // SAFETY: Tests touching the environment run under ENV_MUTEX.
    unsafe {
        std::env::set_var(RATE_LIMIT_ENV, "0");
        match api_key {
            Some(key) => std::env::set_var(API_KEY_ENV, key),
            None => std::env::remove_var(API_KEY_ENV),
        }
    }
    TestGuard { _guard: guard }
}

fn server_for(pipeline: Pipeline) -> TestServer {
    let state = AppState::new(Arc::new(pipeline), "memory");
    TestServer::new(create_router(state)).unwrap()
}

/// Server built from the TOML config above. Callers hold the env lock.
fn config_server() -> TestServer {
    let config = Config::from_toml(CONFIG).unwrap();
    let registry = Registry::open(config.registry_options().unwrap()).unwrap();
    server_for(Pipeline::start(registry, config.ingest.tick_interval_ms).unwrap())
}

fn create_test_server() -> (TestServer, TestGuard) {
    let guard = lock_env(None);
    (config_server(), guard)
}

/// Server whose resolver reads from `blobs`, with a short gap timeout.
fn create_blob_server(blobs: Arc<MemoryBlobStore>) -> (TestServer, TestGuard) {
    let guard = lock_env(None);
    let policy = ClassPolicy::new("GOLD_VAULT", ["ORIGINATED", "ONCHAIN_ACTIVE", "REDEEMED"])
        .with_transition("ORIGINATED", "ONCHAIN_ACTIVE")
        .with_transition("ONCHAIN_ACTIVE", "ONCHAIN_ACTIVE")
        .with_transition("ONCHAIN_ACTIVE", "REDEEMED")
        .with_rel_type("COLLATERAL_FOR");
    let registry = Registry::in_memory(
        2,
        PolicyTable::from_policies([policy]).unwrap(),
        BlobResolver::in_memory(blobs),
        ShardConfig {
            gap_timeout_ms: 20,
            ..ShardConfig::new(GapPolicy::Hold)
        },
    )
    .unwrap();
    (server_for(Pipeline::start(registry, 5).unwrap()), guard)
}

fn create(n: u32) -> IngestedEvent {
    IngestedEvent::create(
        format!("create-{n}"),
        "ledger",
        1_000,
        "GOLD_VAULT",
        format!("SKR-{n:03}"),
        "47.37,8.54",
    )
}

fn event(id: &WorldlineId, event_id: &str, seq: u64, payload: EventPayload) -> IngestedEvent {
    IngestedEvent {
        event_id: event_id.into(),
        worldline: id.clone(),
        ordering: OrderingKey::new("ledger", seq),
        timestamp: 1_000 + seq,
        payload,
    }
}

fn to_phase(phase: &str) -> EventPayload {
    EventPayload::UpdateState {
        mask: FieldMask::phase_only(),
        blob: None,
        phase: Some(phase.into()),
    }
}

fn entangle(target: &WorldlineId) -> EventPayload {
    EventPayload::Entangle {
        rel_type: "COLLATERAL_FOR".into(),
        target: target.clone(),
    }
}

async fn post_event(server: &TestServer, event: &IngestedEvent) -> (StatusCode, IngestResponse) {
    let response = server.post("/events").json(event).await;
    (response.status_code(), response.json())
}

// =============================================================================
// HEALTH / STATUS
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (server, _guard) = create_test_server();

    let response = server.get("/health").await;

    response.assert_status_ok();
    let health: HealthResponse = response.json();
    assert_eq!(health.status, "ok");
    assert_eq!(health.version, env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_status_empty_registry() {
    let (server, _guard) = create_test_server();

    let response = server.get("/status").await;

    response.assert_status_ok();
    let status: StatusResponse = response.json();
    assert_eq!(status.backend, "memory");
    assert_eq!(status.stats.shards, 4);
    assert_eq!(status.stats.counts.worldlines, 0);
    assert!(status.paused_sources.is_empty());
}

#[tokio::test]
async fn test_status_counts_after_ingest() {
    let (server, _guard) = create_test_server();
    let create = create(1);
    post_event(&server, &create).await;
    post_event(&server, &create).await;

    let status: StatusResponse = server.get("/status").await.json();
    assert_eq!(status.stats.counts.worldlines, 1);
    assert_eq!(status.stats.counts.versions, 1);
    assert_eq!(status.stats.counters.applied, 1);
    assert_eq!(status.stats.counters.deduplicated, 1);
}

// =============================================================================
// INGESTION
// =============================================================================

#[tokio::test]
async fn test_create_then_get_current() {
    let (server, _guard) = create_test_server();
    let create = create(1);

    let (status, body) = post_event(&server, &create).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.outcome, OutcomeKind::Applied);
    assert_eq!(body.reports.len(), 1);

    let response = server.get(&format!("/worldlines/{}", create.worldline)).await;
    response.assert_status_ok();
    let current: CurrentState = response.json();
    assert_eq!(current.version.phase.as_str(), "ORIGINATED");
    assert_eq!(current.version.sequence, 0);
    assert_eq!(current.worldline.anchor.as_str(), "SKR-001");
    assert!(!current.degraded);
}

#[tokio::test]
async fn test_duplicate_event_is_deduplicated() {
    let (server, _guard) = create_test_server();
    let create = create(1);
    post_event(&server, &create).await;

    let (status, body) = post_event(&server, &create).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.outcome, OutcomeKind::Deduplicated);
    assert!(body.success);
}

#[tokio::test]
async fn test_illegal_transition_rejected() {
    let (server, _guard) = create_test_server();
    let create = create(1);
    let id = create.worldline.clone();
    post_event(&server, &create).await;

    let (status, body) = post_event(&server, &event(&id, "redeem", 1, to_phase("REDEEMED"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body.outcome, OutcomeKind::Rejected);
    assert_eq!(body.kind.as_deref(), Some("structural"));
    assert!(body.error.unwrap().contains("illegal transition"));

    let current: CurrentState = server.get(&format!("/worldlines/{id}")).await.json();
    assert_eq!(current.version.phase.as_str(), "ORIGINATED");
    assert_eq!(current.version.sequence, 0);

    let rejections: Vec<Rejection> = server.get("/rejections").await.json();
    assert_eq!(rejections.len(), 1);
    assert_eq!(rejections[0].event_id.as_str(), "redeem");
}

#[tokio::test]
async fn test_wrong_worldline_id_rejected() {
    let (server, _guard) = create_test_server();
    let mut create = create(1);
    create.worldline = WorldlineId::from("wl-made-up");

    let (status, body) = post_event(&server, &create).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body.outcome, OutcomeKind::Rejected);
}

#[tokio::test]
async fn test_malformed_event_refused() {
    let (server, _guard) = create_test_server();
    let mut create = create(1);
    create.event_id = "".into();

    let (status, body) = post_event(&server, &create).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(!body.success);
}

#[tokio::test]
async fn test_invalid_json_rejected() {
    let (server, _guard) = create_test_server();

    let response = server
        .post("/events")
        .json(&serde_json::json!({ "event_id": "x" }))
        .await;
    assert!(response.status_code().is_client_error());
}

#[tokio::test]
async fn test_out_of_order_delivery_is_applied_in_order() {
    let (server, _guard) = create_test_server();
    let create = create(3);
    let id = create.worldline.clone();
    post_event(&server, &create).await;

    let activate = event(&id, "e1", 1, to_phase("ONCHAIN_ACTIVE"));
    let e3 = event(&id, "e3", 3, to_phase("REDEEMED"));
    let e2 = event(&id, "e2", 2, to_phase("ONCHAIN_ACTIVE"));

    post_event(&server, &activate).await;
    let (status, body) = post_event(&server, &e3).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body.outcome, OutcomeKind::Buffered);
    assert_eq!(body.awaiting, Some(2));

    let (status, body) = post_event(&server, &e2).await;
    assert_eq!(status, StatusCode::OK);
    // Filling the gap releases e3 in the same answer.
    let released: Vec<&str> = body.reports.iter().map(|r| r.event_id.as_str()).collect();
    assert_eq!(released, ["e2", "e3"]);

    let history: Vec<StateVersion> = server
        .get(&format!("/worldlines/{id}/history"))
        .await
        .json();
    let phases: Vec<&str> = history.iter().map(|v| v.phase.as_str()).collect();
    assert_eq!(
        phases,
        ["ORIGINATED", "ONCHAIN_ACTIVE", "ONCHAIN_ACTIVE", "REDEEMED"]
    );
    let sequences: Vec<u64> = history.iter().map(|v| v.sequence).collect();
    assert_eq!(sequences, [0, 1, 2, 3]);
}

#[tokio::test]
async fn test_rejected_event_does_not_block_successors() {
    let (server, _guard) = create_test_server();
    let create = create(3);
    let id = create.worldline.clone();
    post_event(&server, &create).await;
    post_event(&server, &event(&id, "e1", 1, to_phase("ONCHAIN_ACTIVE"))).await;
    post_event(&server, &event(&id, "e3", 3, to_phase("REDEEMED"))).await;

    // Back to ORIGINATED is not declared.
    let (status, body) = post_event(&server, &event(&id, "e2", 2, to_phase("ORIGINATED"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body.outcome, OutcomeKind::Rejected);
    assert_eq!(body.reports.len(), 2);

    let current: CurrentState = server.get(&format!("/worldlines/{id}")).await.json();
    assert_eq!(current.version.phase.as_str(), "REDEEMED");
    assert_eq!(current.version.applied_event.sequence, 3);
}

#[tokio::test]
async fn test_batch_ingest() {
    let (server, _guard) = create_test_server();
    let create = create(1);
    let id = create.worldline.clone();
    let request = BatchRequest {
        events: vec![
            create.clone(),
            event(&id, "e1", 1, to_phase("ONCHAIN_ACTIVE")),
            create,
        ],
    };

    let response = server.post("/events/batch").json(&request).await;
    response.assert_status_ok();
    let body: BatchResponse = response.json();
    let outcomes: Vec<OutcomeKind> = body.results.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        [
            OutcomeKind::Applied,
            OutcomeKind::Applied,
            OutcomeKind::Deduplicated
        ]
    );
    assert!(body.success);
}

// =============================================================================
// ENTANGLEMENT
// =============================================================================

#[tokio::test]
async fn test_entangle_is_idempotent() {
    let (server, _guard) = create_test_server();
    let w1 = create(1);
    let w2 = create(2);
    post_event(&server, &w1).await;
    post_event(&server, &w2).await;

    let link = event(&w1.worldline, "link", 1, entangle(&w2.worldline));
    post_event(&server, &link).await;
    let (_, again) = post_event(&server, &link).await;
    assert_eq!(again.outcome, OutcomeKind::Deduplicated);

    // Same edge under a new event id: applied, still one edge.
    let (status, _) = post_event(&server, &event(&w1.worldline, "link-2", 2, entangle(&w2.worldline))).await;
    assert_eq!(status, StatusCode::OK);

    let edges: Vec<Entanglement> = server
        .get(&format!("/worldlines/{}/neighbors", w1.worldline))
        .await
        .json();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target, w2.worldline);
    assert_eq!(edges[0].rel_type.as_str(), "COLLATERAL_FOR");
}

#[tokio::test]
async fn test_neighbors_filter_and_revoke() {
    let (server, _guard) = create_test_server();
    let w1 = create(1);
    let w2 = create(2);
    post_event(&server, &w1).await;
    post_event(&server, &event(&w1.worldline, "link", 1, entangle(&w2.worldline))).await;

    let filtered: Vec<Entanglement> = server
        .get(&format!("/worldlines/{}/neighbors", w1.worldline))
        .add_query_param("rel_type", "SECURED_BY")
        .await
        .json();
    assert!(filtered.is_empty());

    let revoke = EventPayload::Revoke {
        rel_type: "COLLATERAL_FOR".into(),
        target: w2.worldline.clone(),
    };
    post_event(&server, &event(&w1.worldline, "unlink", 2, revoke)).await;

    let edges: Vec<Entanglement> = server
        .get(&format!("/worldlines/{}/neighbors", w1.worldline))
        .add_query_param("rel_type", "COLLATERAL_FOR")
        .await
        .json();
    assert!(edges.is_empty());
}

#[tokio::test]
async fn test_disallowed_rel_type_rejected() {
    let (server, _guard) = create_test_server();
    let w1 = create(1);
    post_event(&server, &w1).await;

    let payload = EventPayload::Entangle {
        rel_type: "OWNS".into(),
        target: WorldlineId::from("wl-other"),
    };
    let (status, body) = post_event(&server, &event(&w1.worldline, "own", 1, payload)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body.error.unwrap().contains("OWNS"));
}

// =============================================================================
// BLOB INTEGRITY
// =============================================================================

#[tokio::test]
async fn test_integrity_mismatch_keeps_prior_version_current() {
    let blobs = Arc::new(MemoryBlobStore::new());
    blobs.put(
        "vault-b1",
        br#"{"frequency":{"grams":1000},"polarization":["LBMA"]}"#.to_vec(),
    );
    let (server, _guard) = create_blob_server(Arc::clone(&blobs));

    let create = create(1);
    let id = create.worldline.clone();
    post_event(&server, &create).await;

    let update = EventPayload::UpdateState {
        mask: FieldMask::payload(),
        blob: Some(BlobRef::new("vault-b1", Digest::of(b"something else"))),
        phase: None,
    };
    let (status, body) = post_event(&server, &event(&id, "b1", 1, update)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.outcome, OutcomeKind::Applied);

    let current: CurrentState = server.get(&format!("/worldlines/{id}")).await.json();
    assert_eq!(current.version.sequence, 0);
    assert!(current.degraded);

    let history: Vec<StateVersion> = server
        .get(&format!("/worldlines/{id}/history"))
        .await
        .json();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].status, VerificationStatus::IntegrityMismatch);
}

#[tokio::test]
async fn test_verified_blob_feeds_attribute_search() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let (server, _guard) = create_blob_server(Arc::clone(&blobs));

    for (n, grams) in [(1u32, 500i64), (2, 1_000), (3, 5_000)] {
        let create = create(n);
        let blob = blobs.put_content(
            format!(r#"{{"frequency":{{"grams":{grams}}},"polarization":[]}}"#).into_bytes(),
        );
        post_event(&server, &create).await;
        let update = EventPayload::UpdateState {
            mask: FieldMask::payload(),
            blob: Some(blob),
            phase: None,
        };
        post_event(&server, &event(&create.worldline, &format!("b-{n}"), 1, update)).await;
    }

    let response = server
        .get("/find/attribute")
        .add_query_param("class", "GOLD_VAULT")
        .add_query_param("attribute", "grams")
        .add_query_param("min", 600)
        .add_query_param("max", 5_000)
        .await;
    response.assert_status_ok();
    let matches: Vec<Value> = response.json();
    let values: Vec<i64> = {
        let mut v: Vec<i64> = matches.iter().map(|m| m["value"].as_i64().unwrap()).collect();
        v.sort_unstable();
        v
    };
    assert_eq!(values, [1_000, 5_000]);
}

#[tokio::test]
async fn test_attribute_range_inverted_is_bad_request() {
    let (server, _guard) = create_test_server();

    let response = server
        .get("/find/attribute")
        .add_query_param("class", "GOLD_VAULT")
        .add_query_param("attribute", "grams")
        .add_query_param("min", 10)
        .add_query_param("max", 1)
        .await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

// =============================================================================
// INDEX / CLASS QUERIES
// =============================================================================

#[tokio::test]
async fn test_find_by_class_and_phase_pages() {
    let (server, _guard) = create_test_server();
    let mut ids = Vec::new();
    for n in 1..=3 {
        let create = create(n);
        ids.push(create.worldline.clone());
        post_event(&server, &create).await;
    }
    ids.sort();

    let first: Page = server
        .get("/find")
        .add_query_param("class", "GOLD_VAULT")
        .add_query_param("phase", "ORIGINATED")
        .add_query_param("limit", 2)
        .await
        .json();
    assert_eq!(first.items, ids[..2]);
    let next = first.next.unwrap();

    let second: Page = server
        .get("/find")
        .add_query_param("class", "GOLD_VAULT")
        .add_query_param("phase", "ORIGINATED")
        .add_query_param("after", next.as_str())
        .add_query_param("limit", 2)
        .await
        .json();
    assert_eq!(second.items, ids[2..]);
    assert!(second.next.is_none());

    let active: Page = server
        .get("/find")
        .add_query_param("class", "GOLD_VAULT")
        .add_query_param("phase", "ONCHAIN_ACTIVE")
        .await
        .json();
    assert!(active.items.is_empty());
}

#[tokio::test]
async fn test_get_class() {
    let (server, _guard) = create_test_server();

    let response = server.get("/classes/GOLD_VAULT").await;
    response.assert_status_ok();
    let policy: ClassPolicy = response.json();
    assert_eq!(policy.phases.len(), 3);

    let response = server.get("/classes/NOPE").await;
    response.assert_status(StatusCode::NOT_FOUND);
    let error: ErrorResponse = response.json();
    assert_eq!(error.kind, "not_found");
}

#[tokio::test]
async fn test_unknown_worldline_is_not_found() {
    let (server, _guard) = create_test_server();

    for path in [
        "/worldlines/wl-missing",
        "/worldlines/wl-missing/history",
        "/worldlines/wl-missing/neighbors",
    ] {
        let response = server.get(path).await;
        response.assert_status(StatusCode::NOT_FOUND);
        let error: ErrorResponse = response.json();
        assert!(!error.success);
    }
}

// =============================================================================
// SOURCES / ANOMALIES
// =============================================================================

#[tokio::test]
async fn test_pause_resume_and_cursor() {
    let (server, _guard) = create_test_server();
    let create = create(1);
    let id = create.worldline.clone();
    post_event(&server, &create).await;

    let paused: SourceResponse = server.post("/sources/ledger/pause").await.json();
    assert!(paused.paused && paused.changed);

    let activate = event(&id, "e1", 1, to_phase("ONCHAIN_ACTIVE"));
    let (status, body) = post_event(&server, &activate).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body.kind.as_deref(), Some("source_paused"));

    let cursor: CursorResponse = server.get("/sources/ledger/cursor").await.json();
    assert!(cursor.paused);
    assert_eq!(cursor.cursor.get(&id), Some(&0));

    let resumed: SourceResponse = server.post("/sources/ledger/resume").await.json();
    assert!(!resumed.paused && resumed.changed);

    let (status, _) = post_event(&server, &activate).await;
    assert_eq!(status, StatusCode::OK);
    let cursor: CursorResponse = server.get("/sources/ledger/cursor").await.json();
    assert_eq!(cursor.cursor.get(&id), Some(&1));
}

#[tokio::test]
async fn test_gap_timeout_surfaces_as_anomaly() {
    let (server, _guard) = create_blob_server(Arc::new(MemoryBlobStore::new()));
    let create = create(1);
    let id = create.worldline.clone();
    post_event(&server, &create).await;
    post_event(&server, &event(&id, "e2", 2, to_phase("ONCHAIN_ACTIVE"))).await;

    let mut anomalies: Vec<Anomaly> = Vec::new();
    for _ in 0..200 {
        anomalies = server.get("/anomalies").await.json();
        if !anomalies.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!anomalies.is_empty(), "gap timeout should be journaled");

    let status: StatusResponse = server.get("/status").await.json();
    assert!(status.stats.counters.gap_timeouts >= 1);
    assert_eq!(status.stats.counters.buffered, 1);
}

// =============================================================================
// HASH / EXPORT
// =============================================================================

#[tokio::test]
async fn test_hash_independent_of_delivery_order() {
    let (server, _guard) = create_test_server();
    let w1 = create(1);
    let w2 = create(2);
    let events = vec![
        w1.clone(),
        w2.clone(),
        event(&w1.worldline, "e1", 1, to_phase("ONCHAIN_ACTIVE")),
        event(&w1.worldline, "e2", 2, entangle(&w2.worldline)),
    ];
    for e in &events {
        post_event(&server, e).await;
    }
    let forward: HashResponse = server.get("/hash").await.json();

    let reversed = config_server();
    for e in events.iter().rev() {
        post_event(&reversed, e).await;
    }
    let backward: HashResponse = reversed.get("/hash").await.json();

    assert_eq!(forward.checksum, backward.checksum);
    assert_eq!(forward.worldlines, 2);
    assert_eq!(forward.versions, 3);
    assert_eq!(forward.edges, 1);
}

#[tokio::test]
async fn test_export_matches_hash() {
    let (server, _guard) = create_test_server();
    post_event(&server, &create(1)).await;

    let hash: HashResponse = server.get("/hash").await.json();
    let response = server.post("/export").await;
    response.assert_status_ok();
    let export: ExportResponse = response.json();
    assert!(export.success);
    assert_eq!(export.checksum.as_deref(), Some(hash.checksum.as_str()));

    let bytes = base64::Engine::decode(
        &base64::engine::general_purpose::STANDARD,
        export.data.unwrap(),
    )
    .unwrap();
    let snapshot = CanonicalSnapshot::import(&bytes).unwrap();
    assert_eq!(snapshot.entries.len(), 1);
    assert_eq!(snapshot.checksum().unwrap().to_hex(), hash.checksum);
}

// =============================================================================
// AUTHENTICATION MIDDLEWARE TESTS
// =============================================================================

fn create_auth_test_server(api_key: &str) -> (TestServer, TestGuard) {
    let guard = lock_env(Some(api_key));
    (config_server(), guard)
}

#[tokio::test]
async fn test_auth_valid_bearer_token() {
    let api_key = "test-secret-key-12345";
    let (server, _guard) = create_auth_test_server(api_key);

    let response = server
        .get("/status")
        .add_header(
            header::AUTHORIZATION,
            format!("Bearer {api_key}").parse::<HeaderValue>().unwrap(),
        )
        .await;

    response.assert_status_ok();
}

#[tokio::test]
async fn test_auth_invalid_token_rejected() {
    let (server, _guard) = create_auth_test_server("right-key");

    let response = server
        .post("/events")
        .json(&create(1))
        .add_header(
            header::AUTHORIZATION,
            "Bearer wrong-key".parse::<HeaderValue>().unwrap(),
        )
        .await;

    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_missing_header_rejected() {
    let (server, _guard) = create_auth_test_server("right-key");

    let response = server.get("/rejections").await;

    response.assert_status(StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_auth_health_endpoint_bypasses_auth() {
    let (server, _guard) = create_auth_test_server("right-key");

    let response = server.get("/health").await;

    response.assert_status_ok();
}
