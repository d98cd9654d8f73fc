use anyhow::{Context, Result};
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::proxy::http::codec::HeaderList;

/// Metadata artifact persisted next to the body bytes. The pair addresses one
/// fingerprint; an entry is only a hit when both artifacts are present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub status: u16,
    #[serde(default)]
    pub url: String,
    pub headers: Vec<(String, String)>,
}

impl EntryMetadata {
    pub fn new(status: StatusCode, url: &str, headers: &HeaderList) -> Self {
        Self {
            status: status.as_u16(),
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK)
    }

    pub fn header_list(&self) -> HeaderList {
        self.headers.iter().cloned().collect()
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context("failed to serialize entry metadata")
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).context("malformed entry metadata on disk")
    }
}
