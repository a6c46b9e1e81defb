//! Google Sheets destination: one worksheet tab per day.

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dotleads_core::stored_keys;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Destination, DestinationError, PartitionHandle};

pub const SHEETS_API_BASE: &str = "https://sheets.googleapis.com";
pub const SHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const HEADER_COLUMNS: i64 = 9;
const SPARE_ROWS: usize = 100;

/// Fields of a Google service-account JSON key that the token exchange needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl ServiceAccountKey {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DestinationError> {
        let path = path.as_ref();
        let credentials_error = |reason: String| DestinationError::Credentials {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|err| credentials_error(err.to_string()))?;
        serde_json::from_str(&text).map_err(|err| credentials_error(err.to_string()))
    }
}

#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Pre-issued bearer token.
    Static(String),
    ServiceAccount(ServiceAccountKey),
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct GoogleSheetsDestination {
    client: reqwest::Client,
    api_base: String,
    spreadsheet_id: String,
    token_source: TokenSource,
    cached_token: Mutex<Option<CachedToken>>,
}

impl GoogleSheetsDestination {
    pub fn new(client: reqwest::Client, spreadsheet_id: impl Into<String>, token_source: TokenSource) -> Self {
        Self::with_api_base(client, SHEETS_API_BASE, spreadsheet_id, token_source)
    }

    pub fn with_api_base(
        client: reqwest::Client,
        api_base: impl Into<String>,
        spreadsheet_id: impl Into<String>,
        token_source: TokenSource,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            spreadsheet_id: spreadsheet_id.into(),
            token_source,
            cached_token: Mutex::new(None),
        }
    }

    pub fn spreadsheet_url(&self) -> String {
        format!("https://docs.google.com/spreadsheets/d/{}/edit", self.spreadsheet_id)
    }

    fn spreadsheet_endpoint(&self) -> String {
        format!("{}/v4/spreadsheets/{}", self.api_base, self.spreadsheet_id)
    }

    fn values_endpoint(&self, range: &str) -> String {
        format!(
            "{}/values/{}",
            self.spreadsheet_endpoint(),
            urlencoding::encode(range)
        )
    }

    async fn access_token(&self) -> Result<String, DestinationError> {
        let key = match &self.token_source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ServiceAccount(key) => key,
        };

        let mut cached = self.cached_token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let issued_at = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: SHEETS_SCOPE,
            aud: &key.token_uri,
            iat: issued_at,
            exp: issued_at + 3600,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|err| DestinationError::Token(format!("invalid service account key: {err}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|err| DestinationError::Token(format!("signing assertion: {err}")))?;

        let resp = self
            .client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;
        let resp = ensure_success(resp).await?;
        let token: TokenResponse = resp.json().await?;

        // Treat the token as stale one minute before Google does.
        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600).saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        debug!(client_email = %key.client_email, "obtained sheets access token");
        Ok(token.access_token)
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<JsonValue, DestinationError> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await?;
        Ok(ensure_success(resp).await?.json().await?)
    }

    async fn post_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        body: &JsonValue,
    ) -> Result<JsonValue, DestinationError> {
        let token = self.access_token().await?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(token)
            .query(query)
            .json(body)
            .send()
            .await?;
        Ok(ensure_success(resp).await?.json().await?)
    }

    async fn batch_update(&self, requests: JsonValue) -> Result<JsonValue, DestinationError> {
        let url = format!("{}:batchUpdate", self.spreadsheet_endpoint());
        self.post_json(&url, &[], &json!({ "requests": requests })).await
    }

    async fn append_values(&self, title: &str, rows: &[Vec<String>]) -> Result<(), DestinationError> {
        let url = format!("{}:append", self.values_endpoint(&a1_range(title, "A1")));
        self.post_json(
            &url,
            &[("valueInputOption", "RAW"), ("insertDataOption", "INSERT_ROWS")],
            &json!({ "values": rows }),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Destination for GoogleSheetsDestination {
    async fn find_partition(&self, name: &str) -> Result<Option<PartitionHandle>, DestinationError> {
        let body = self
            .get_json(
                &self.spreadsheet_endpoint(),
                &[("fields", "sheets.properties(sheetId,title)")],
            )
            .await?;
        let sheets = body
            .get("sheets")
            .and_then(|v| v.as_array())
            .map(Vec::as_slice)
            .unwrap_or_default();

        for sheet in sheets {
            let props = &sheet["properties"];
            if props["title"].as_str() == Some(name) {
                let id = props["sheetId"]
                    .as_i64()
                    .ok_or_else(|| DestinationError::Malformed(format!("sheet '{name}' has no sheetId")))?;
                return Ok(Some(PartitionHandle {
                    name: name.to_string(),
                    id,
                }));
            }
        }
        Ok(None)
    }

    async fn create_partition(
        &self,
        name: &str,
        header: &[String],
        expected_rows: usize,
    ) -> Result<PartitionHandle, DestinationError> {
        let reply = self
            .batch_update(json!([{
                "addSheet": {
                    "properties": {
                        "title": name,
                        "gridProperties": {
                            "rowCount": expected_rows + SPARE_ROWS,
                            "columnCount": HEADER_COLUMNS + 1,
                        }
                    }
                }
            }]))
            .await?;
        let id = reply
            .pointer("/replies/0/addSheet/properties/sheetId")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DestinationError::Malformed("addSheet reply missing sheetId".into()))?;
        let handle = PartitionHandle {
            name: name.to_string(),
            id,
        };

        self.append_values(name, &[header.to_vec()]).await?;
        self.batch_update(json!([{
            "repeatCell": {
                "range": {
                    "sheetId": id,
                    "startRowIndex": 0,
                    "endRowIndex": 1,
                    "startColumnIndex": 0,
                    "endColumnIndex": HEADER_COLUMNS,
                },
                "cell": {
                    "userEnteredFormat": {
                        "textFormat": { "bold": true },
                        "backgroundColor": { "red": 0.9, "green": 0.9, "blue": 0.9 },
                    }
                },
                "fields": "userEnteredFormat(textFormat,backgroundColor)",
            }
        }]))
        .await?;

        info!(partition = name, sheet_id = id, "created sheet tab");
        Ok(handle)
    }

    async fn read_keys(&self, partition: &PartitionHandle) -> Result<Vec<String>, DestinationError> {
        let body = self
            .get_json(&self.values_endpoint(&a1_range(&partition.name, "A:A")), &[])
            .await?;
        Ok(first_column_keys(&body))
    }

    async fn append_rows(
        &self,
        partition: &PartitionHandle,
        rows: &[Vec<String>],
    ) -> Result<(), DestinationError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.append_values(&partition.name, rows).await?;
        self.batch_update(json!([{
            "autoResizeDimensions": {
                "dimensions": {
                    "sheetId": partition.id,
                    "dimension": "COLUMNS",
                    "startIndex": 0,
                    "endIndex": HEADER_COLUMNS,
                }
            }
        }]))
        .await?;
        info!(partition = %partition.name, rows = rows.len(), "appended rows to sheet tab");
        Ok(())
    }

    fn partition_reference(&self, partition: &PartitionHandle) -> String {
        format!("{}#gid={}", self.spreadsheet_url(), partition.id)
    }
}

/// A1 notation scoped to a sheet title; quotes inside titles are doubled.
pub fn a1_range(title: &str, cells: &str) -> String {
    format!("'{}'!{}", title.replace('\'', "''"), cells)
}

fn first_column_keys(body: &JsonValue) -> Vec<String> {
    body.get("values")
        .and_then(|v| v.as_array())
        .map(|rows| {
            stored_keys(rows.iter().filter_map(|row| row.get(0).and_then(|cell| cell.as_str())))
        })
        .unwrap_or_default()
}

async fn ensure_success(resp: reqwest::Response) -> Result<reqwest::Response, DestinationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = resp.url().to_string();
    let body = resp.text().await.unwrap_or_default();
    Err(DestinationError::HttpStatus {
        status: status.as_u16(),
        url,
        body,
    })
}
