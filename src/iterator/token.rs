//! Resume tokens
//!
//! A token is standard base64 (padded) over a JSON object:
//!
//! ```json
//! {"database": "GeoLite2-Country.mmdb", "network": "1.0.0.0/24",
//!  "filter_mode": "and", "filters": [...], "processed": 4, "matched": 3,
//!  "last_network": "1.0.0.192/26"}
//! ```
//!
//! Clients persist these and replay them after restarts, so field names and
//! CIDR formatting must not change.

use crate::filter::{FilterMode, Predicate};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ipnet::IpNet;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Resume token decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Not valid base64
    #[error("invalid resume token encoding: {0}")]
    Encoding(String),
    /// Base64 decoded but the payload is not the expected JSON
    #[error("invalid resume token payload: {0}")]
    Payload(String),
    /// A CIDR inside the token does not parse
    #[error("invalid network '{0}' in resume token")]
    Network(String),
}

/// Snapshot of an iterator's binding, position and counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeToken {
    /// Database the scan runs against
    pub database: String,
    /// Queried CIDR
    pub network: String,
    /// Predicate combination
    #[serde(default, deserialize_with = "null_as_default")]
    pub filter_mode: FilterMode,
    /// Predicates; older servers write `null` for an unfiltered scan
    #[serde(default, deserialize_with = "null_as_default")]
    pub filters: Vec<Predicate>,
    /// Networks visited so far
    #[serde(default)]
    pub processed: u64,
    /// Networks that passed the filter so far
    #[serde(default)]
    pub matched: u64,
    /// Last network visited, empty before the first
    #[serde(default)]
    pub last_network: String,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl ResumeToken {
    /// Encode to the opaque string handed to clients
    pub fn encode(&self) -> String {
        // Serializing plain strings, numbers and JSON values cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        STANDARD.encode(json)
    }

    /// Decode a client-supplied token and check its networks
    pub fn decode(token: &str) -> Result<Self, TokenError> {
        let bytes = STANDARD
            .decode(token.trim())
            .map_err(|e| TokenError::Encoding(e.to_string()))?;
        let token: ResumeToken =
            serde_json::from_slice(&bytes).map_err(|e| TokenError::Payload(e.to_string()))?;
        token.network()?;
        token.last_network()?;
        Ok(token)
    }

    /// The queried network
    pub fn network(&self) -> Result<IpNet, TokenError> {
        self.network
            .parse()
            .map_err(|_| TokenError::Network(self.network.clone()))
    }

    /// The resume anchor, if the scan had started
    pub fn last_network(&self) -> Result<Option<IpNet>, TokenError> {
        if self.last_network.is_empty() {
            return Ok(None);
        }
        self.last_network
            .parse()
            .map(Some)
            .map_err(|_| TokenError::Network(self.last_network.clone()))
    }
}
