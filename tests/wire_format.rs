//! Wire format conformance tests
//!
//! Validates that `PoolEventEnvelope` serialization matches the committed
//! JSON fixtures in tests/fixtures/. Downstream NATS consumers are written
//! against those fixtures.
//!
//! ## Fixture regeneration
//!
//! To regenerate fixtures after an intentional wire format change:
//! ```bash
//! REGENERATE_FIXTURES=1 cargo test --test wire_format
//! ```

use arrakis_socket_pool::events::serialize_event_with;
use arrakis_socket_pool::metrics::{LatencySnapshot, PoolMetricsSnapshot};
use arrakis_socket_pool::nats::route_subject;
use arrakis_socket_pool::{ConnectionId, PoolEvent, Tags};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const POOL_ID: u64 = 3;
const TIMESTAMP: u64 = 1_700_000_000_000;
const CONNECTION_ID: &str = "00000000-0000-4000-8000-0000000000aa";

/// Fixture directory resolved via CARGO_MANIFEST_DIR.
fn fixtures_dir() -> PathBuf {
    let fixtures = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures");
    assert!(
        fixtures.exists(),
        "Fixture directory does not exist at {}",
        fixtures.display()
    );
    fixtures
}

/// Load a committed fixture by name (without .json extension).
fn load_fixture(name: &str) -> Value {
    let path = fixtures_dir().join(format!("{name}.json"));
    let content = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read fixture {}: {e}", path.display()));
    serde_json::from_str(&content)
        .unwrap_or_else(|e| panic!("Failed to parse fixture {}: {e}", path.display()))
}

fn connection_id() -> ConnectionId {
    ConnectionId::from(Uuid::parse_str(CONNECTION_ID).unwrap())
}

fn event_id(n: u8) -> Uuid {
    Uuid::parse_str(&format!("00000000-0000-4000-8000-0000000000{n:02x}")).unwrap()
}

/// The pool event behind each deterministic fixture, with its event id.
fn fixture_event(fixture_name: &str) -> (PoolEvent, Uuid) {
    match fixture_name {
        "connection-open" => (
            PoolEvent::Connection {
                connection_id: connection_id(),
                client_id: "client-42".to_string(),
                shard: 4,
            },
            event_id(1),
        ),
        "connection-close" => (
            PoolEvent::Close {
                connection_id: connection_id(),
                client_id: "client-42".to_string(),
                code: 4000,
                reason: "Connection timeout".to_string(),
                reconnect_attempts: 0,
            },
            event_id(2),
        ),
        "reconnect-attempt" => {
            let mut tags = Tags::new();
            tags.insert("room".to_string(), "lobby".to_string());
            (
                PoolEvent::ReconnectAttempt {
                    connection_id: connection_id(),
                    client_id: "client-42".to_string(),
                    tags,
                    attempt: 2,
                    delay: Duration::from_millis(2000),
                },
                event_id(3),
            )
        }
        "maintenance-cleanup" => (PoolEvent::Cleanup { removed: 1 }, event_id(4)),
        "maintenance-gc" => (
            PoolEvent::Gc {
                heap_before: 600_000_000,
            },
            event_id(5),
        ),
        "pool-metrics" => (
            PoolEvent::Metrics(Arc::new(PoolMetricsSnapshot {
                connection_count: 3,
                active_connections: 2,
                shard_sizes: vec![2, 1],
                pending_messages: 5,
                messages_sent: 40,
                messages_received: 12,
                batches_sent: 4,
                messages_dropped: 1,
                errors: 2,
                reconnect_attempts: 1,
                latency: LatencySnapshot {
                    min_ms: 1.5,
                    max_ms: 20.25,
                    avg_ms: 4.5,
                    p95_ms: 18.75,
                    window: 12,
                    total: 12,
                },
                uptime_ms: 60_000,
                heap_used_bytes: Some(104_857_600),
                timestamp: TIMESTAMP,
            })),
            event_id(6),
        ),
        "pool-shutdown" => (PoolEvent::Shutdown, event_id(7)),
        other => panic!("Unknown fixture: {other}"),
    }
}

/// Serialize the fixture's event with deterministic id and timestamp.
fn build_deterministic_envelope(fixture_name: &str) -> Value {
    let (event, id) = fixture_event(fixture_name);
    let envelope = serialize_event_with(&event, POOL_ID, id, TIMESTAMP)
        .unwrap_or_else(|| panic!("Fixture '{fixture_name}' event is not forwarded"));
    serde_json::to_value(envelope).unwrap()
}

/// Write a fixture to disk (for regeneration mode).
fn write_fixture(name: &str, value: &Value) {
    let path = fixtures_dir().join(format!("{name}.json"));
    let content = serde_json::to_string_pretty(value).unwrap();
    let content = format!("{content}\n");
    std::fs::write(&path, content)
        .unwrap_or_else(|e| panic!("Failed to write fixture {}: {e}", path.display()));
    eprintln!("Regenerated fixture: {}", path.display());
}

/// Every committed fixture has a deterministic Rust-side equivalent.
const FIXTURES: &[&str] = &[
    "connection-open",
    "connection-close",
    "reconnect-attempt",
    "maintenance-cleanup",
    "maintenance-gc",
    "pool-metrics",
    "pool-shutdown",
];

/// Required envelope fields for every forwarded event.
const REQUIRED_ENVELOPE_FIELDS: &[&str] = &[
    "event_id",
    "event_type",
    "pool_id",
    "timestamp",
    "connection_id",
    "client_id",
    "data",
];

#[test]
fn rust_serialization_matches_committed_fixtures() {
    let regenerate = std::env::var("REGENERATE_FIXTURES").is_ok();

    for name in FIXTURES {
        let actual = build_deterministic_envelope(name);

        if regenerate {
            write_fixture(name, &actual);
        } else {
            let expected = load_fixture(name);
            assert_eq!(
                actual, expected,
                "Wire format mismatch for fixture '{name}'. \
                 If intentional, run: REGENERATE_FIXTURES=1 cargo test --test wire_format"
            );
        }
    }
}

#[test]
fn all_fixtures_have_required_envelope_fields() {
    for name in FIXTURES {
        let fixture = load_fixture(name);
        let obj = fixture.as_object().unwrap_or_else(|| {
            panic!("Fixture '{name}' is not a JSON object");
        });

        for field in REQUIRED_ENVELOPE_FIELDS {
            assert!(
                obj.contains_key(*field),
                "Fixture '{name}' missing required envelope field '{field}'"
            );
        }
    }
}

#[test]
fn fixture_event_ids_are_valid_uuids() {
    for name in FIXTURES {
        let fixture = load_fixture(name);
        let event_id = fixture["event_id"].as_str().unwrap_or_else(|| {
            panic!("Fixture '{name}' has non-string event_id");
        });
        Uuid::parse_str(event_id).unwrap_or_else(|e| {
            panic!("Fixture '{name}' has invalid UUID event_id '{event_id}': {e}");
        });
    }
}

#[test]
fn fixtures_route_into_pool_stream() {
    for name in FIXTURES {
        let fixture = load_fixture(name);
        let event_type = fixture["event_type"].as_str().unwrap();
        let subject = route_subject(event_type);
        assert!(
            subject.starts_with("pool."),
            "Fixture '{name}' routes to '{subject}', outside the POOL stream"
        );
    }
}

#[test]
fn connection_fixtures_carry_ids_and_maintenance_fixtures_do_not() {
    for name in ["connection-open", "connection-close", "reconnect-attempt"] {
        let fixture = load_fixture(name);
        assert_eq!(fixture["connection_id"], CONNECTION_ID, "fixture '{name}'");
        assert_eq!(fixture["client_id"], "client-42", "fixture '{name}'");
    }

    for name in ["maintenance-cleanup", "maintenance-gc", "pool-metrics", "pool-shutdown"] {
        let fixture = load_fixture(name);
        assert!(fixture["connection_id"].is_null(), "fixture '{name}'");
        assert!(fixture["client_id"].is_null(), "fixture '{name}'");
    }
}
