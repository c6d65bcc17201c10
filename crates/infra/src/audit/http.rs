use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};

use agritrace_core::PartyId;

use super::{AuditError, AuditReceipt, AuditRecord, AuditSink};

pub const DEFAULT_ADDRESS_SALT: &str = "agritrace";

/// Deterministic 64-hex-char ledger address for a party.
pub fn party_address(salt: &str, party: PartyId) -> String {
    let digest = Sha256::digest(format!("{salt}-{party}").as_bytes());
    hex::encode(digest)
}

#[derive(Debug, Serialize)]
struct TransactionPayload<'a> {
    sender: String,
    recipient: String,
    batch_id: &'a str,
    event_type: &'a str,
    /// JSON-encoded metadata; the audit log stores it as an opaque string.
    data: String,
}

/// Posts audit records to `<base_url>/transactions`.
///
/// Uses a blocking client, so it must be built and used off the async
/// runtime (the audit worker thread does both).
#[derive(Debug)]
pub struct HttpAuditSink {
    client: reqwest::blocking::Client,
    endpoint: String,
    address_salt: String,
}

impl HttpAuditSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuditError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuditError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/transactions", base_url.trim_end_matches('/')),
            address_salt: DEFAULT_ADDRESS_SALT.to_string(),
        })
    }

    pub fn with_address_salt(mut self, salt: impl Into<String>) -> Self {
        self.address_salt = salt.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl AuditSink for HttpAuditSink {
    fn submit(&mut self, record: &AuditRecord) -> Result<AuditReceipt, AuditError> {
        let payload = TransactionPayload {
            sender: party_address(&self.address_salt, record.actor),
            recipient: party_address(&self.address_salt, record.counterparty),
            batch_id: &record.batch_code,
            event_type: record.operation.as_str(),
            data: serde_json::to_string(&record.metadata)
                .map_err(|e| AuditError::Encode(e.to_string()))?,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .map_err(|e| AuditError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AuditError::Rejected {
                status: status.as_u16(),
            });
        }

        // A missing or unparsable body still counts as accepted.
        let transaction_hash = response
            .json::<serde_json::Value>()
            .ok()
            .and_then(|body| body.get("hash").and_then(|h| h.as_str()).map(str::to_owned));

        Ok(AuditReceipt { transaction_hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::audit::AuditOperation;

    fn test_record() -> AuditRecord {
        AuditRecord {
            operation: AuditOperation::Split,
            batch_code: "BATCH-20260314-090507-AB12".into(),
            actor: PartyId::new(),
            counterparty: PartyId::new(),
            metadata: serde_json::json!({ "children": 2 }),
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn addresses_are_stable_sha256_hex() {
        let party = PartyId::new();
        let a = party_address("agritrace", party);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(a, party_address("agritrace", party));
        assert_ne!(a, party_address("other", party));
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let sink = HttpAuditSink::new("http://audit.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(sink.endpoint(), "http://audit.local/transactions");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn posts_the_transaction_payload() {
        let server = MockServer::start().await;
        let record = test_record();

        Mock::given(method("POST"))
            .and(path("/transactions"))
            .and(body_partial_json(serde_json::json!({
                "batch_id": record.batch_code,
                "event_type": "SPLIT",
                "sender": party_address(DEFAULT_ADDRESS_SALT, record.actor),
                "data": "{\"children\":2}",
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({ "hash": "0xabc" })))
            .expect(1)
            .mount(&server)
            .await;

        let base = server.uri();
        let receipt = tokio::task::spawn_blocking(move || {
            let mut sink = HttpAuditSink::new(&base, Duration::from_secs(2))?;
            sink.submit(&record)
        })
        .await
        .unwrap()
        .unwrap();

        assert_eq!(receipt.transaction_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let base = server.uri();
        let result = tokio::task::spawn_blocking(move || {
            let mut sink = HttpAuditSink::new(&base, Duration::from_secs(2))?;
            sink.submit(&test_record())
        })
        .await
        .unwrap();

        assert!(matches!(result, Err(AuditError::Rejected { status: 503 })));
    }
}
