//! Per-message ingest: audit, decode by topic, reconcile every record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument};

use crate::decoders::{self, ProtocolFamily};
use crate::reconcile::{Outcome, Reconciler};
use crate::store::TelemetryStore;

// ---

/// What happened to one inbound message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageReport {
    // ---
    pub family: Option<ProtocolFamily>,
    pub audited: bool,
    pub outcomes: Vec<Outcome>,
}

impl MessageReport {
    pub fn count(&self, pred: impl Fn(&Outcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

pub struct Pipeline {
    store: Arc<dyn TelemetryStore>,
    reconciler: Reconciler,
}

impl Pipeline {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        // ---
        let reconciler = Reconciler::new(Arc::clone(&store));
        Self { store, reconciler }
    }

    /// Handle a message received now.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> MessageReport {
        self.handle_message_at(topic, payload, Utc::now()).await
    }

    /// Handle a message as if received at `now`.
    ///
    /// The message is audited before decoding; an audit failure is logged
    /// and does not stop reconciliation. A failing record never prevents the
    /// next one from being processed.
    #[instrument(name = "ingest", skip_all, fields(topic = %topic, bytes = payload.len()))]
    pub async fn handle_message_at(&self, topic: &str, payload: &[u8], now: DateTime<Utc>) -> MessageReport {
        // ---
        let text = String::from_utf8_lossy(payload);

        let audited = match self.store.record_message(topic, &audit_body(&text)).await {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to persist raw MQTT message");
                false
            }
        };

        let family = ProtocolFamily::from_topic(topic);
        let Some(family) = family else {
            debug!("no decoder for topic");
            return MessageReport {
                family: None,
                audited,
                outcomes: Vec::new(),
            };
        };

        let records = decoders::decode(family, &text);
        if records.is_empty() {
            debug!(%family, "payload decoded to no records");
        }

        let mut outcomes = Vec::with_capacity(records.len());
        for record in &records {
            let outcome = self.reconciler.reconcile(record, topic, now).await;
            if let Outcome::Error(detail) = &outcome {
                error!(ble_mac = %record.ble_mac, error = %detail, "failed to process device record");
            }
            outcomes.push(outcome);
        }

        let report = MessageReport {
            family: Some(family),
            audited,
            outcomes,
        };
        info!(
            %family,
            records = records.len(),
            inserted = report.count(|o| matches!(o, Outcome::Inserted(_))),
            updated = report.count(|o| matches!(o, Outcome::Updated(_))),
            skipped = report.count(|o| matches!(o, Outcome::Skipped(_))),
            ignored = report.count(|o| matches!(o, Outcome::Ignored(_))),
            "message processed"
        );
        report
    }
}

/// Body stored in the audit trail: parsed JSON, or the raw text wrapped.
pub fn audit_body(payload: &str) -> Value {
    // ---
    serde_json::from_str(payload).unwrap_or_else(|_| json!({ "raw": payload }))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_audit_body_parses_or_wraps() {
        // ---
        assert_eq!(audit_body(r#"{"a": 1}"#), json!({"a": 1}));
        assert_eq!(audit_body("[1,2]"), json!([1, 2]));
        assert_eq!(audit_body("AAFE20"), json!({"raw": "AAFE20"}));
        assert_eq!(audit_body(""), json!({"raw": ""}));
    }

    #[tokio::test]
    async fn test_unknown_topic_is_audited_but_not_decoded() {
        // ---
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(Arc::new(store.clone()));

        let report = pipeline.handle_message("devices/unknown", b"{\"mac\":\"aa\"}").await;

        assert_eq!(report.family, None);
        assert!(report.audited);
        assert!(report.outcomes.is_empty());

        let messages = store.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].topic, "devices/unknown");
        assert_eq!(messages[0].payload, json!({"mac": "aa"}));
    }

    #[tokio::test]
    async fn test_malformed_payload_is_audited_raw() {
        // ---
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(Arc::new(store.clone()));

        let report = pipeline.handle_message("devices/MK1", b"{garbage").await;

        assert_eq!(report.family, Some(ProtocolFamily::Mk1));
        assert!(report.outcomes.is_empty());
        assert_eq!(store.messages().await[0].payload, json!({"raw": "{garbage"}));
    }

    #[tokio::test]
    async fn test_gateway_heartbeat_yields_no_outcomes() {
        // ---
        let store = MemoryStore::new();
        let pipeline = Pipeline::new(Arc::new(store.clone()));
        let heartbeat = json!([{"Format": "Gateway", "GatewayMAC": "AA:BB:CC:DD:EE:01"}]);

        let report = pipeline
            .handle_message("devices/MK1", heartbeat.to_string().as_bytes())
            .await;

        assert_eq!(report.family, Some(ProtocolFamily::Mk1));
        assert!(report.audited);
        assert!(report.outcomes.is_empty());
        assert!(store.readings().await.is_empty());
    }
}
