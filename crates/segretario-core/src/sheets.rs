//! Spreadsheet access: one worksheet of one Google Sheets document, used as an append-only log.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::credentials::TokenSource;
use crate::error::SheetError;

/// Append-only row store backing the ledger.
#[async_trait]
pub trait SheetStore: Send + Sync {
    /// Append one row after the last non-empty row.
    async fn append_row(&self, row: Vec<String>) -> Result<(), SheetError>;

    /// Every row including the header, padded to the width of the widest row.
    async fn read_all_rows(&self) -> Result<Vec<Vec<String>>, SheetError>;
}

/// Pad ragged rows with empty cells so every row has the same width.
pub fn fill_gaps(mut rows: Vec<Vec<String>>) -> Vec<Vec<String>> {
    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in &mut rows {
        row.resize(width, String::new());
    }
    rows
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn cell_to_string(cell: serde_json::Value) -> String {
    match cell {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Google Sheets v4 client bound to one spreadsheet id and worksheet name.
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    base_url: String,
    spreadsheet_id: String,
    worksheet: String,
}

impl GoogleSheetsClient {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        base_url: impl Into<String>,
        spreadsheet_id: impl Into<String>,
        worksheet: impl Into<String>,
    ) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.into(),
            spreadsheet_id: spreadsheet_id.into(),
            worksheet: worksheet.into(),
        }
    }

    /// `{base}/v4/spreadsheets/{id}/values/{range}` with each segment percent-encoded.
    fn values_url(&self, range_suffix: &str) -> Result<reqwest::Url, SheetError> {
        let mut url = reqwest::Url::parse(&self.base_url)
            .map_err(|e| SheetError::Backend(format!("bad sheets base url: {}", e)))?;
        let range = format!("{}{}", self.worksheet, range_suffix);
        url.path_segments_mut()
            .map_err(|_| SheetError::Backend("sheets base url cannot be a base".to_string()))?
            .pop_if_empty()
            .extend([
                "v4",
                "spreadsheets",
                self.spreadsheet_id.as_str(),
                "values",
                range.as_str(),
            ]);
        Ok(url)
    }
}

async fn check(res: reqwest::Response) -> Result<reqwest::Response, SheetError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(SheetError::Api {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl SheetStore for GoogleSheetsClient {
    async fn append_row(&self, row: Vec<String>) -> Result<(), SheetError> {
        let url = self.values_url(":append")?;
        let token = self.tokens.access_token().await?;
        let res = self
            .http
            .post(url)
            .query(&[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")])
            .bearer_auth(token)
            .json(&serde_json::json!({
                "majorDimension": "ROWS",
                "values": [row],
            }))
            .send()
            .await?;
        check(res).await?;
        Ok(())
    }

    async fn read_all_rows(&self) -> Result<Vec<Vec<String>>, SheetError> {
        let url = self.values_url("")?;
        let token = self.tokens.access_token().await?;
        let res = self.http.get(url).bearer_auth(token).send().await?;
        let range: ValueRange = check(res).await?.json().await?;
        let rows = range
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect();
        Ok(fill_gaps(rows))
    }
}
