use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;

use super::{SheetMetadata, SheetsClient};
use crate::{Error, Result};

const DEFAULT_API_BASE: &str = "https://sheets.googleapis.com";

/// REST client for the source-sheet API, authenticated with a bearer token
/// minted for the service account.
#[derive(Clone)]
pub struct RestSheetsClient {
    http: reqwest::Client,
    api_base: String,
    token: String,
    /// Address shown to users when a sheet has not been shared with us.
    contact: String,
}

impl RestSheetsClient {
    pub fn new(token: impl Into<String>, contact: impl Into<String>) -> Self {
        Self::with_api_base(DEFAULT_API_BASE, token, contact)
    }

    pub fn with_api_base(
        api_base: impl Into<String>,
        token: impl Into<String>,
        contact: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: token.into(),
            contact: contact.into(),
        }
    }

    async fn get_json(&self, url: &str, sheet_id: &str) -> Result<Value> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| Error::backend("sheets request", e))?;
        match response.status() {
            StatusCode::FORBIDDEN => Err(Error::Unauthorized(format!(
                "cannot access sheet {sheet_id}; share it with {}",
                self.contact
            ))),
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("sheet {sheet_id}"))),
            status if !status.is_success() => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::message(format!(
                    "sheets request failed ({status}): {body}"
                )))
            }
            _ => response
                .json()
                .await
                .map_err(|e| Error::backend("sheets response parse", e)),
        }
    }

    fn values_url(&self, sheet_id: &str, range: &str) -> String {
        format!(
            "{}/v4/spreadsheets/{sheet_id}/values/{}",
            self.api_base,
            urlencode(range)
        )
    }

    fn parse_rows(value: &Value) -> Vec<Vec<String>> {
        value
            .get("values")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .map(|row| {
                        row.as_array()
                            .map(|cells| {
                                cells
                                    .iter()
                                    .map(|c| match c {
                                        Value::String(s) => s.clone(),
                                        other => other.to_string(),
                                    })
                                    .collect()
                            })
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SheetsClient for RestSheetsClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_metadata(&self, sheet_id: &str) -> Result<SheetMetadata> {
        let url = format!(
            "{}/v4/spreadsheets/{sheet_id}?fields=properties.title,sheets.properties.title",
            self.api_base
        );
        let body = self.get_json(&url, sheet_id).await?;
        let title = body
            .pointer("/properties/title")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tabs = body
            .get("sheets")
            .and_then(Value::as_array)
            .map(|sheets| {
                sheets
                    .iter()
                    .filter_map(|s| s.pointer("/properties/title").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(SheetMetadata { title, tabs })
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_header_row(
        &self,
        sheet_id: &str,
        tab: &str,
        header_row: u64,
    ) -> Result<Vec<String>> {
        let range = format!("{tab}!A{header_row}:ZZ{header_row}");
        let body = self.get_json(&self.values_url(sheet_id, &range), sheet_id).await?;
        Ok(Self::parse_rows(&body).into_iter().next().unwrap_or_default())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_values(
        &self,
        sheet_id: &str,
        tab: &str,
        start_row: u64,
    ) -> Result<Vec<Vec<String>>> {
        let range = format!("{tab}!A{start_row}:ZZ");
        let body = self.get_json(&self.values_url(sheet_id, &range), sheet_id).await?;
        Ok(Self::parse_rows(&body))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn check_access(&self, sheet_id: &str) -> Result<bool> {
        match self.get_metadata(sheet_id).await {
            Ok(_) => Ok(true),
            Err(Error::Unauthorized(_)) | Err(Error::NotFound(_)) => Ok(false),
            Err(other) => Err(other),
        }
    }
}

/// Percent-encode the characters that matter in an A1 range segment.
fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '!' | ':' => out.push(ch),
            ' ' => out.push_str("%20"),
            other => {
                let mut buf = [0u8; 4];
                for byte in other.encode_utf8(&mut buf).bytes() {
                    out.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    out
}
