use serde::{Deserialize, Serialize};

use agritrace_core::PartyId;

/// Role of a party in the supply chain, as reported by the identity layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PartyRole {
    Farmer,
    Distributor,
    Transporter,
    Retailer,
    Consumer,
    Admin,
}

impl PartyRole {
    pub fn as_str(self) -> &'static str {
        match self {
            PartyRole::Farmer => "FARMER",
            PartyRole::Distributor => "DISTRIBUTOR",
            PartyRole::Transporter => "TRANSPORTER",
            PartyRole::Retailer => "RETAILER",
            PartyRole::Consumer => "CONSUMER",
            PartyRole::Admin => "ADMIN",
        }
    }

    /// Case-insensitive lookup; unknown role names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "FARMER" => Some(PartyRole::Farmer),
            "DISTRIBUTOR" => Some(PartyRole::Distributor),
            "TRANSPORTER" => Some(PartyRole::Transporter),
            "RETAILER" => Some(PartyRole::Retailer),
            "CONSUMER" => Some(PartyRole::Consumer),
            "ADMIN" => Some(PartyRole::Admin),
            _ => None,
        }
    }
}

/// A party as seen by the ledger: identity plus the role, when known.
///
/// The ledger never authorizes on the role; it only records it so provenance
/// can attribute events to supply-chain stages.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartyRef {
    pub id: PartyId,
    pub role: Option<PartyRole>,
}

impl PartyRef {
    pub fn new(id: PartyId, role: PartyRole) -> Self {
        Self {
            id,
            role: Some(role),
        }
    }

    pub fn anonymous(id: PartyId) -> Self {
        Self { id, role: None }
    }
}
