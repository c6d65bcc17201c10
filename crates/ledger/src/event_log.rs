//! Event log records.
//!
//! Events are immutable facts about one batch. The store only ever appends
//! them; nothing here exposes a setter once an event has been built.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agritrace_core::{BatchId, Entity, EventId, LedgerError, LedgerResult, PartyId};

use crate::batch::Batch;
use crate::catalog::EventKind;
use crate::party::PartyRole;

/// Proof document attached to an event (photo, certificate, lab report).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_url: String,
    pub file_type: Option<String>,
    pub description: Option<String>,
}

/// Raw reading from a field device, stored as received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub device_id: String,
    pub raw_data: serde_json::Value,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: EventId,
    pub batch_id: BatchId,
    pub kind: EventKind,
    pub actor: PartyId,
    /// Role of the batch's custodian when the event was appended.
    pub custodian_role: Option<PartyRole>,
    pub recorded_at: DateTime<Utc>,
    /// `"lat,lng"`
    pub location: Option<String>,
    pub attachments: Vec<Attachment>,
    pub sensor_readings: Vec<SensorReading>,
    pub external_tx_hash: Option<String>,
}

impl TraceEvent {
    /// A new event on `batch`, snapshotting its custodian's role.
    pub fn record(batch: &Batch, kind: EventKind, actor: PartyId, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: EventId::new(),
            batch_id: *batch.id(),
            kind,
            actor,
            custodian_role: batch.custodian().role,
            recorded_at,
            location: None,
            attachments: Vec::new(),
            sensor_readings: Vec::new(),
            external_tx_hash: None,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> LedgerResult<Self> {
        if let Some(location) = &location {
            validate_location(location)?;
        }
        self.location = location;
        Ok(self)
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> LedgerResult<Self> {
        if attachments.iter().any(|a| a.file_url.trim().is_empty()) {
            return Err(LedgerError::validation("attachment file_url cannot be empty"));
        }
        self.attachments = attachments;
        Ok(self)
    }

    pub fn with_sensor_readings(mut self, readings: Vec<SensorReading>) -> LedgerResult<Self> {
        if readings.iter().any(|r| r.device_id.trim().is_empty()) {
            return Err(LedgerError::validation("sensor reading device_id cannot be empty"));
        }
        self.sensor_readings = readings;
        Ok(self)
    }
}

/// Accepts `"lat,lng"` with both parts numeric and in range.
fn validate_location(location: &str) -> LedgerResult<()> {
    let invalid = || LedgerError::validation(format!("location \"{location}\" is not \"lat,lng\""));

    let (lat, lng) = location.split_once(',').ok_or_else(invalid)?;
    let lat: f64 = lat.trim().parse().map_err(|_| invalid())?;
    let lng: f64 = lng.trim().parse().map_err(|_| invalid())?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return Err(invalid());
    }
    Ok(())
}
