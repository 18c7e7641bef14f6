//! Blocking HTTP client for a Google Sheets style values API.

use serde_json::json;
use sweep_core::{PortError, Surface};

use crate::value;

pub const DEFAULT_BASE_URL: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// One spreadsheet tab, seen through the values API. A surface instance is
/// bound to a single (spreadsheet, dataset) pair.
pub struct SheetsSurface {
    http: reqwest::blocking::Client,
    base_url: String,
    spreadsheet: String,
    dataset: String,
    token: String,
}

impl SheetsSurface {
    pub fn new(
        base_url: impl Into<String>,
        spreadsheet: impl Into<String>,
        dataset: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        SheetsSurface {
            http: reqwest::blocking::Client::new(),
            base_url,
            spreadsheet: spreadsheet.into(),
            dataset: dataset.into(),
            token: token.into(),
        }
    }

    fn value_url(&self, cell: &str) -> String {
        format!(
            "{}/{}/values/{}!{}",
            self.base_url, self.spreadsheet, self.dataset, cell
        )
    }
}

impl Surface for SheetsSurface {
    /// Writes one input cell. The values API commits synchronously, so a 2xx
    /// answer is the flush-to-visible guarantee the driver relies on.
    fn write_cell(&self, cell: &str, value: f64) -> Result<(), PortError> {
        let url = self.value_url(cell);
        let body = json!({ "values": [[value]] });
        let resp = self
            .http
            .put(&url)
            .query(&[("valueInputOption", "USER_ENTERED")])
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .map_err(|e| PortError::transport(&url, e))?;
        if !resp.status().is_success() {
            return Err(PortError::transport(
                &url,
                format!("write rejected with status {}", resp.status()),
            ));
        }
        tracing::debug!("wrote {} = {}", cell, value);
        Ok(())
    }

    fn read_cell(&self, cell: &str) -> Result<f64, PortError> {
        let url = self.value_url(cell);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .map_err(|e| PortError::transport(&url, e))?;
        if !resp.status().is_success() {
            return Err(PortError::transport(
                &url,
                format!("read rejected with status {}", resp.status()),
            ));
        }
        let body: serde_json::Value = resp
            .json()
            .map_err(|e| PortError::malformed(&url, e))?;
        // An absent value range means an empty cell, which reads as "0".
        let text = match body.pointer("/values/0/0") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => "0".to_string(),
        };
        let parsed = value::parse_numeric(&text).map_err(|e| PortError::malformed(&url, e))?;
        tracing::debug!("read {} = {}", cell, parsed);
        Ok(parsed)
    }
}
