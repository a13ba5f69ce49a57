//! Loopback responder for the in-memory broker.
//!
//! Stands in for the remote routing worker during local development: every
//! request published on the request topic is answered on the response topic
//! with `{"echo": <request payload>}`.

use std::sync::Arc;

use relay_bus::{InMemoryBroker, InboundStream, MessageBroker};
use relay_correlator::{RequestEnvelope, ResponseEnvelope};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Start answering requests. Stops when `shutdown` turns true.
///
/// The request topic is tapped before this returns.
pub fn spawn_loopback(
    broker: Arc<InMemoryBroker>,
    request_topic: &str,
    response_topic: &str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<JoinHandle<u64>> {
    let mut requests = broker.tap(request_topic)?;
    let response_topic = response_topic.to_string();
    info!(request_topic, response_topic = %response_topic, "Loopback responder started");

    Ok(tokio::spawn(async move {
        let mut answered = 0u64;
        loop {
            let bytes = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                message = requests.next() => match message {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(e)) => {
                        warn!(error = %e, "Loopback receive failed");
                        continue;
                    }
                    None => break,
                },
            };

            let request: RequestEnvelope = match serde_json::from_slice(&bytes) {
                Ok(request) => request,
                Err(e) => {
                    warn!(error = %e, "Loopback ignoring malformed request");
                    continue;
                }
            };

            let reply = ResponseEnvelope::new(request.id.clone(), json!({ "echo": request.payload }));
            let Ok(encoded) = serde_json::to_vec(&reply) else {
                continue;
            };
            match broker.publish(&response_topic, &encoded).await {
                Ok(()) => {
                    answered += 1;
                    debug!(correlation_id = %request.id, "Loopback replied");
                }
                Err(e) => {
                    warn!(error = %e, "Loopback publish failed, stopping");
                    break;
                }
            }
        }
        info!(answered, "Loopback responder stopped");
        answered
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_echoes_requests() {
        let broker = Arc::new(InMemoryBroker::connected());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut replies = broker.tap("out").unwrap();
        let handle = spawn_loopback(broker.clone(), "in", "out", shutdown_rx).unwrap();

        let request = serde_json::to_vec(&RequestEnvelope::new("x1", json!({"a": 1}))).unwrap();
        broker.publish("in", &request).await.unwrap();

        let bytes = timeout(Duration::from_secs(1), replies.next())
            .await
            .expect("no reply")
            .unwrap()
            .unwrap();
        let reply: ResponseEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(reply.id.as_str(), "x1");
        assert_eq!(reply.payload, json!({"echo": {"a": 1}}));

        shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 1);
    }
}
