//! End-to-end correlator scenarios against the in-memory broker.
//!
//! A responder task plays the remote worker: it taps the request topic and
//! publishes replies on the response topic.

use relay_bus::{InMemoryBroker, InboundStream, MessageBroker};
use relay_correlator::{
    CorrelationId, CorrelationTable, Correlator, CorrelatorError, Outcome, RelayConfig,
    RequestEnvelope, ResponseEnvelope, ResultSink, RetryConfig, SinkError,
};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

const REQUESTS: &str = "routing-requests";
const RESPONSES: &str = "routing-responses";

fn test_config() -> RelayConfig {
    RelayConfig {
        retry: RetryConfig {
            initial_ms: 5,
            max_ms: 20,
        },
        ..RelayConfig::default()
    }
}

async fn start_relay() -> (Arc<InMemoryBroker>, Arc<Correlator>) {
    let broker = Arc::new(InMemoryBroker::new());
    let correlator = Correlator::new(test_config(), broker.clone()).unwrap();
    correlator.start().await.unwrap();
    (broker, Arc::new(correlator))
}

/// Reply to every request for which `reply` returns a payload, after `delay`.
fn spawn_responder<F>(broker: &Arc<InMemoryBroker>, delay: Duration, reply: F) -> JoinHandle<()>
where
    F: Fn(&RequestEnvelope) -> Option<Value> + Send + 'static,
{
    let mut requests = broker.tap(REQUESTS).unwrap();
    let broker = Arc::clone(broker);
    tokio::spawn(async move {
        while let Some(Ok(bytes)) = requests.next().await {
            let Ok(request) = serde_json::from_slice::<RequestEnvelope>(&bytes) else {
                continue;
            };
            if let Some(payload) = reply(&request) {
                sleep(delay).await;
                let response =
                    serde_json::to_vec(&ResponseEnvelope::new(request.id.clone(), payload))
                        .unwrap();
                if broker.publish(RESPONSES, &response).await.is_err() {
                    break;
                }
            }
        }
    })
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_request_without_reply_times_out() {
    let (_broker, correlator) = start_relay().await;

    let started = Instant::now();
    let outcome = correlator
        .send_and_await(
            RequestEnvelope::new("abc-1", json!({"from": "a", "to": "b"})),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(outcome, Outcome::TimedOut);
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(600), "took {elapsed:?}");
    assert_eq!(correlator.pending_count(), 0);
    assert_eq!(correlator.stats().unwrap().timed_out, 1);

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_reply_before_deadline_is_returned() {
    let (broker, correlator) = start_relay().await;
    let _responder = spawn_responder(&broker, Duration::from_millis(10), |_| {
        Some(json!({"ok": true}))
    });

    let outcome = correlator
        .send_and_await(
            RequestEnvelope::new("abc-2", json!({})),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Response(json!({"ok": true})));
    assert_eq!(correlator.pending_count(), 0);

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_releases_pending_with_shutdown() {
    let (_broker, correlator) = start_relay().await;

    let caller = {
        let correlator = Arc::clone(&correlator);
        tokio::spawn(async move {
            correlator
                .send_and_await(
                    RequestEnvelope::new("abc-3", json!(null)),
                    Duration::from_secs(30),
                )
                .await
        })
    };
    wait_until(|| correlator.pending_count() == 1).await;

    let report = correlator.stop().await.unwrap();
    assert_eq!(report.released, 1);
    assert!(report.listener.is_some());

    let outcome = timeout(Duration::from_secs(1), caller)
        .await
        .expect("caller still blocked")
        .unwrap()
        .unwrap();
    assert_eq!(outcome, Outcome::Shutdown);

    // Nothing registers after stop
    assert!(matches!(
        correlator.send(json!(1)).await,
        Err(CorrelatorError::NotRunning)
    ));
}

#[tokio::test]
async fn test_malformed_message_between_valid_replies_is_skipped() {
    let (broker, correlator) = start_relay().await;

    let mut callers = Vec::new();
    for id in ["first", "second"] {
        let correlator = Arc::clone(&correlator);
        callers.push(tokio::spawn(async move {
            correlator
                .send_and_await(RequestEnvelope::new(id, json!(null)), Duration::from_secs(5))
                .await
        }));
    }
    wait_until(|| correlator.pending_count() == 2).await;

    // Arrange: valid, garbage, valid
    broker
        .publish(RESPONSES, br#"{"id":"first","payload":1}"#)
        .await
        .unwrap();
    broker.publish(RESPONSES, b"\x00not json{").await.unwrap();
    broker
        .publish(RESPONSES, br#"{"request_id":"second","payload":2}"#)
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    for caller in callers {
        outcomes.push(caller.await.unwrap().unwrap());
    }
    assert_eq!(
        outcomes,
        vec![Outcome::Response(json!(1)), Outcome::Response(json!(2))]
    );
    assert_eq!(correlator.stats().unwrap().decode_failures, 1);
    assert!(correlator.health().await.consumer_alive);

    correlator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_out_of_order_replies_reach_their_own_callers() {
    let (broker, correlator) = start_relay().await;

    // Responder collects all ten requests, then answers in reverse order
    let mut requests = broker.tap(REQUESTS).unwrap();
    let responder = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 10 {
                let bytes = requests.next().await.unwrap().unwrap();
                let request: RequestEnvelope = serde_json::from_slice(&bytes).unwrap();
                seen.push(request.id);
            }
            for id in seen.into_iter().rev() {
                let reply = ResponseEnvelope::new(id.clone(), json!({"for": id.as_str()}));
                broker
                    .publish(RESPONSES, &serde_json::to_vec(&reply).unwrap())
                    .await
                    .unwrap();
            }
        })
    };

    let callers: Vec<_> = (1..=10)
        .map(|n| {
            let correlator = Arc::clone(&correlator);
            let id = format!("r{n}");
            tokio::spawn(async move {
                let outcome = correlator
                    .send_and_await(RequestEnvelope::new(id.as_str(), json!(n)), Duration::from_secs(5))
                    .await
                    .unwrap();
                (id, outcome)
            })
        })
        .collect();

    for caller in callers {
        let (id, outcome) = caller.await.unwrap();
        assert_eq!(outcome, Outcome::Response(json!({"for": id})));
    }
    responder.await.unwrap();
    assert_eq!(correlator.pending_count(), 0);

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_empty_id_is_rejected_before_publishing() {
    let (broker, correlator) = start_relay().await;
    let mut requests = broker.tap(REQUESTS).unwrap();
    let published = broker.messages_published();

    let result = correlator
        .send_and_await(RequestEnvelope::new("", json!(1)), Duration::from_millis(300))
        .await;
    assert!(matches!(result, Err(CorrelatorError::EmptyId)));
    assert_eq!(broker.messages_published(), published);
    assert_eq!(correlator.pending_count(), 0);
    assert!(requests.drain_buffered().await.is_empty());

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_flat_reply_keeps_result_fields() {
    let (broker, correlator) = start_relay().await;

    let mut requests = broker.tap(REQUESTS).unwrap();
    let responder = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            let bytes = requests.next().await.unwrap().unwrap();
            let request: RequestEnvelope = serde_json::from_slice(&bytes).unwrap();
            let reply = json!({
                "request_id": request.id,
                "route_found": true,
                "cost_km": 3.2,
            });
            broker
                .publish(RESPONSES, &serde_json::to_vec(&reply).unwrap())
                .await
                .unwrap();
        })
    };

    let outcome = correlator
        .send_and_await(RequestEnvelope::new("flat-1", json!({})), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::Response(json!({"route_found": true, "cost_km": 3.2}))
    );
    responder.await.unwrap();

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_publish_failure_removes_waiter() {
    let (broker, correlator) = start_relay().await;
    broker.fail_publishes(true);

    let result = correlator
        .send_and_await(RequestEnvelope::new("p1", json!(null)), Duration::from_secs(1))
        .await;
    assert!(matches!(result, Err(CorrelatorError::Broker(_))));
    assert_eq!(correlator.pending_count(), 0);
    assert_eq!(correlator.stats().unwrap().removed, 1);

    // The id is free again once the broker recovers
    broker.fail_publishes(false);
    let _responder = spawn_responder(&broker, Duration::ZERO, |_| Some(json!("ok")));
    let outcome = correlator
        .send_and_await(RequestEnvelope::new("p1", json!(null)), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::Response(json!("ok")));

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_in_flight_id_is_rejected() {
    let (broker, correlator) = start_relay().await;

    let first = {
        let correlator = Arc::clone(&correlator);
        tokio::spawn(async move {
            correlator
                .send_and_await(RequestEnvelope::new("dup", json!(1)), Duration::from_secs(5))
                .await
        })
    };
    wait_until(|| correlator.pending_count() == 1).await;

    let second = correlator
        .send_and_await(RequestEnvelope::new("dup", json!(2)), Duration::from_secs(5))
        .await;
    assert!(matches!(second, Err(CorrelatorError::DuplicateId(id)) if id.as_str() == "dup"));

    // First caller is untouched and still gets its reply
    broker
        .publish(RESPONSES, br#"{"id":"dup","payload":"first"}"#)
        .await
        .unwrap();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(outcome, Outcome::Response(json!("first")));

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_reply_after_timeout_is_unmatched() {
    let (broker, correlator) = start_relay().await;

    let outcome = correlator
        .send_and_await(RequestEnvelope::new("late", json!(null)), Duration::from_millis(30))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::TimedOut);

    broker
        .publish(RESPONSES, br#"{"id":"late","payload":"too late"}"#)
        .await
        .unwrap();
    wait_until(|| correlator.stats().unwrap().unmatched == 1).await;
    assert_eq!(correlator.pending_count(), 0);

    correlator.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_instant_replies_find_registered_waiters() {
    let (broker, correlator) = start_relay().await;
    let _responder = spawn_responder(&broker, Duration::ZERO, |request| {
        Some(request.payload.clone())
    });

    let callers: Vec<_> = (0..50)
        .map(|n| {
            let correlator = Arc::clone(&correlator);
            tokio::spawn(async move {
                correlator
                    .send_and_await(
                        RequestEnvelope::new(CorrelationId::generate(), json!(n)),
                        Duration::from_secs(5),
                    )
                    .await
                    .unwrap()
            })
        })
        .collect();

    for (n, caller) in callers.into_iter().enumerate() {
        assert_eq!(caller.await.unwrap(), Outcome::Response(json!(n)));
    }

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_external_remove_cancels_caller() {
    let (_broker, correlator) = start_relay().await;

    let caller = {
        let correlator = Arc::clone(&correlator);
        tokio::spawn(async move {
            correlator
                .send_and_await(RequestEnvelope::new("upstream", json!(null)), Duration::from_secs(5))
                .await
        })
    };
    wait_until(|| correlator.pending_count() == 1).await;

    assert!(correlator.remove(&"upstream".into()));
    let result = caller.await.unwrap();
    assert!(matches!(result, Err(CorrelatorError::Cancelled(_))));

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_dropped_call_releases_waiter() {
    let (_broker, correlator) = start_relay().await;

    let abandoned = timeout(
        Duration::from_millis(20),
        correlator.send_and_await(RequestEnvelope::new("gone", json!(null)), Duration::from_secs(5)),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(correlator.pending_count(), 0);

    correlator.stop().await.unwrap();
}

#[tokio::test]
async fn test_listener_recovers_from_receive_failure() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.fail_next_receives(1);
    let correlator = Correlator::new(test_config(), broker.clone()).unwrap();
    correlator.start().await.unwrap();

    wait_until(|| broker.subscriptions_opened() >= 2).await;
    let _responder = spawn_responder(&broker, Duration::ZERO, |_| Some(json!("recovered")));

    let outcome = correlator.send(json!(null)).await.unwrap();
    assert_eq!(outcome, Outcome::Response(json!("recovered")));

    let report = correlator.stop().await.unwrap();
    assert_eq!(report.listener.unwrap().resubscriptions, 1);
}

#[derive(Default)]
struct RecordingSink {
    stored: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait::async_trait]
impl ResultSink for RecordingSink {
    async fn store(&self, id: &CorrelationId, owner: &str, payload: &Value) -> Result<(), SinkError> {
        self.stored
            .lock()
            .unwrap()
            .push((id.to_string(), owner.to_string(), payload.clone()));
        Ok(())
    }
}

#[tokio::test]
async fn test_owned_results_are_handed_to_sink() {
    let broker = Arc::new(InMemoryBroker::new());
    let sink = Arc::new(RecordingSink::default());
    let correlator = Correlator::new(test_config(), broker.clone())
        .unwrap()
        .with_sink(sink.clone());
    correlator.start().await.unwrap();
    let _responder = spawn_responder(&broker, Duration::ZERO, |_| Some(json!({"route": [1, 2]})));

    let owned = RequestEnvelope::new("owned", json!(null)).with_owner("user-7");
    let outcome = correlator
        .send_and_await(owned, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(outcome.is_response());

    let anonymous = RequestEnvelope::new("anon", json!(null));
    correlator
        .send_and_await(anonymous, Duration::from_secs(1))
        .await
        .unwrap();

    wait_until(|| !sink.stored.lock().unwrap().is_empty()).await;
    sleep(Duration::from_millis(20)).await;
    let stored = sink.stored.lock().unwrap().clone();
    assert_eq!(
        stored,
        vec![(
            "owned".to_string(),
            "user-7".to_string(),
            json!({"route": [1, 2]})
        )]
    );

    correlator.stop().await.unwrap();
}

#[test]
fn test_concurrent_table_operations_keep_one_waiter_per_id() {
    use parking_lot::Mutex as HeldLock;
    use rand::Rng;
    use std::collections::HashSet;

    let table = CorrelationTable::new();
    let ids: Vec<CorrelationId> = (0..8).map(|n| CorrelationId::new(format!("id-{n}"))).collect();
    // Ids owned by a live waiter; updated together with the table operation
    let held: HeldLock<HashSet<CorrelationId>> = HeldLock::new(HashSet::new());

    let totals: Vec<(u64, u64, u64)> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                scope.spawn(|| {
                    let mut rng = rand::thread_rng();
                    let mut waiters = Vec::new();
                    let (mut registered, mut resolved, mut removed) = (0u64, 0u64, 0u64);
                    for _ in 0..2_000 {
                        let id = &ids[rng.gen_range(0..ids.len())];
                        let op = rng.gen_range(0..3);
                        let mut guard = held.lock();
                        match op {
                            0 => match table.register(id.clone()) {
                                Ok(waiter) => {
                                    assert!(guard.insert(id.clone()), "{id} registered twice");
                                    registered += 1;
                                    waiters.push(waiter);
                                }
                                Err(_) => assert!(guard.contains(id), "{id} rejected while free"),
                            },
                            1 => {
                                let was_resolved = table.resolve(id, json!(null));
                                assert_eq!(was_resolved, guard.remove(id));
                                if was_resolved {
                                    resolved += 1;
                                }
                            }
                            _ => {
                                let was_removed = table.remove(id);
                                assert_eq!(was_removed, guard.remove(id));
                                if was_removed {
                                    removed += 1;
                                }
                            }
                        }
                        drop(guard);
                        // Let other threads interleave between operations
                        std::thread::yield_now();
                    }
                    (registered, resolved, removed)
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let registered: u64 = totals.iter().map(|t| t.0).sum();
    let resolved: u64 = totals.iter().map(|t| t.1).sum();
    let removed: u64 = totals.iter().map(|t| t.2).sum();

    // Every successful registration left the table exactly once, or is still there
    assert_eq!(
        registered,
        resolved + removed + table.pending_count() as u64
    );
    assert_eq!(table.pending_count(), held.lock().len());
    let stats = table.stats().snapshot();
    assert_eq!(stats.registered, registered);
    assert_eq!(stats.resolved + stats.removed, resolved + removed);
}
