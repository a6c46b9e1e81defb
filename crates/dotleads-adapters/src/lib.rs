//! Socrata source adapter: paginated census fetch plus record normalization.

use async_trait::async_trait;
use chrono::NaiveDate;
use dotleads_core::{format_date, raw_fields, RawRecord};
use thiserror::Error;
use tracing::{info, info_span, Instrument};

pub mod normalize;

pub use normalize::{
    canonical_registration_date, normalize_batch, normalize_record, NormalizeOutcome,
    NormalizedBatch, SkipReason,
};

pub const CRATE_NAME: &str = "dotleads-adapters";

/// Upstream page size; the largest `$limit` Socrata serves without paging tokens.
pub const DEFAULT_PAGE_SIZE: usize = 50_000;

/// One calendar day of registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub date: NaiveDate,
}

impl DateWindow {
    pub fn new(date: NaiveDate) -> Self {
        Self { date }
    }

    /// SoQL predicate over `[date 00:00:00.000, date 23:59:59.999)`.
    pub fn where_clause(&self) -> String {
        let day = format_date(self.date);
        format!(
            "{field} >= '{day}T00:00:00.000' AND {field} < '{day}T23:59:59.999'",
            field = raw_fields::ADD_DATE
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("decoding page at offset {offset}: {reason}")]
    Decode { offset: usize, reason: String },
}

/// Source of one page of raw records for a date window.
#[async_trait]
pub trait RecordPager: Send + Sync {
    async fn fetch_page(
        &self,
        window: &DateWindow,
        page: PageRequest,
    ) -> Result<Vec<RawRecord>, FetchError>;
}

/// Pull every page for `window`, stopping at the first page shorter than `page_size`.
///
/// Any page failure fails the whole fetch; nothing fetched so far is returned.
pub async fn fetch_all<P>(
    pager: &P,
    window: &DateWindow,
    page_size: usize,
) -> Result<Vec<RawRecord>, FetchError>
where
    P: RecordPager + ?Sized,
{
    let page_size = page_size.max(1);
    let span = info_span!("census_fetch", date = %format_date(window.date), page_size);

    async move {
        let mut records = Vec::new();
        let mut offset = 0usize;

        loop {
            info!(offset, limit = page_size, "fetching page");
            let page = pager
                .fetch_page(
                    window,
                    PageRequest {
                        offset,
                        limit: page_size,
                    },
                )
                .await?;
            let count = page.len();
            records.extend(page);
            info!(count, total = records.len(), "fetched page");

            if count < page_size {
                break;
            }
            offset += page_size;
        }

        info!(total = records.len(), "fetch complete");
        Ok(records)
    }
    .instrument(span)
    .await
}

/// SODA 2.x resource endpoint client.
pub struct SocrataClient {
    client: reqwest::Client,
    base_url: String,
    dataset_id: String,
    app_token: Option<String>,
}

impl SocrataClient {
    pub fn new(
        client: reqwest::Client,
        base_url: impl Into<String>,
        dataset_id: impl Into<String>,
        app_token: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            dataset_id: dataset_id.into(),
            app_token: app_token.filter(|t| !t.trim().is_empty()),
        }
    }

    /// `https://<domain>` for a bare Socrata domain name.
    pub fn base_url_for_domain(domain: &str) -> String {
        format!("https://{}", domain.trim().trim_end_matches('/'))
    }

    pub fn resource_url(&self) -> String {
        format!("{}/resource/{}.json", self.base_url, self.dataset_id)
    }
}

#[async_trait]
impl RecordPager for SocrataClient {
    async fn fetch_page(
        &self,
        window: &DateWindow,
        page: PageRequest,
    ) -> Result<Vec<RawRecord>, FetchError> {
        let query = [
            ("$where", window.where_clause()),
            ("$limit", page.limit.to_string()),
            ("$offset", page.offset.to_string()),
            ("$order", raw_fields::DOT_NUMBER.to_string()),
        ];
        let mut request = self.client.get(self.resource_url()).query(&query);
        if let Some(token) = &self.app_token {
            request = request.header("X-App-Token", token);
        }

        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let url = resp.url().to_string();
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url,
                body,
            });
        }

        let bytes = resp.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|err| FetchError::Decode {
            offset: page.offset,
            reason: err.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Serves pages of the given sizes in order and records each request.
    struct ScriptedPager {
        sizes: Vec<usize>,
        requests: Mutex<Vec<PageRequest>>,
    }

    impl ScriptedPager {
        fn new(sizes: Vec<usize>) -> Self {
            Self {
                sizes,
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl RecordPager for ScriptedPager {
        async fn fetch_page(
            &self,
            _window: &DateWindow,
            page: PageRequest,
        ) -> Result<Vec<RawRecord>, FetchError> {
            let mut requests = self.requests.lock().unwrap();
            let size = self.sizes.get(requests.len()).copied().unwrap_or(0);
            requests.push(page);
            Ok(vec![RawRecord::default(); size])
        }
    }

    fn window() -> DateWindow {
        DateWindow::new(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap())
    }

    #[test]
    fn where_clause_covers_one_day() {
        assert_eq!(
            window().where_clause(),
            "add_date >= '2024-03-01T00:00:00.000' AND add_date < '2024-03-01T23:59:59.999'"
        );
    }

    #[tokio::test]
    async fn pagination_stops_after_short_page() {
        let pager = ScriptedPager::new(vec![50_000, 50_000, 23_000, 50_000]);
        let records = fetch_all(&pager, &window(), DEFAULT_PAGE_SIZE).await.unwrap();

        assert_eq!(records.len(), 123_000);
        let requests = pager.requests.lock().unwrap();
        assert_eq!(
            requests.iter().map(|r| r.offset).collect::<Vec<_>>(),
            vec![0, 50_000, 100_000]
        );
        assert!(requests.iter().all(|r| r.limit == DEFAULT_PAGE_SIZE));
    }

    #[tokio::test]
    async fn empty_first_page_returns_nothing() {
        let pager = ScriptedPager::new(vec![0]);
        let records = fetch_all(&pager, &window(), DEFAULT_PAGE_SIZE).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(pager.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exact_multiple_needs_a_trailing_empty_page() {
        let pager = ScriptedPager::new(vec![2, 2, 0]);
        let records = fetch_all(&pager, &window(), 2).await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(pager.requests.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn socrata_client_pages_with_soql_params() {
        let server = MockServer::start_async().await;
        let first = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/resource/49yn-d2k2.json")
                    .header("X-App-Token", "app-token")
                    .query_param("$limit", "2")
                    .query_param("$offset", "0")
                    .query_param("$order", "dot_number")
                    .query_param(
                        "$where",
                        "add_date >= '2024-03-01T00:00:00.000' AND add_date < '2024-03-01T23:59:59.999'",
                    );
                then.status(200).json_body(json!([
                    { "dot_number": "100", "legal_name": "A" },
                    { "dot_number": "101", "legal_name": "B" }
                ]));
            })
            .await;
        let second = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/resource/49yn-d2k2.json")
                    .query_param("$offset", "2");
                then.status(200)
                    .json_body(json!([{ "dot_number": "102", "legal_name": "C" }]));
            })
            .await;

        let client = SocrataClient::new(
            reqwest::Client::new(),
            server.base_url(),
            "49yn-d2k2",
            Some("app-token".into()),
        );
        let records = fetch_all(&client, &window(), 2).await.unwrap();

        first.assert_async().await;
        second.assert_async().await;
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].text("dot_number"), "102");
    }

    #[tokio::test]
    async fn upstream_error_fails_the_whole_fetch() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).query_param("$offset", "0");
                then.status(200).json_body(json!([{ "dot_number": "1" }, { "dot_number": "2" }]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).query_param("$offset", "2");
                then.status(503).body("service unavailable");
            })
            .await;

        let client = SocrataClient::new(reqwest::Client::new(), server.base_url(), "ds", None);
        let err = fetch_all(&client, &window(), 2).await.unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }), "{err}");
    }

    #[tokio::test]
    async fn non_array_body_is_a_decode_error() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET);
                then.status(200).json_body(json!({ "error": true, "message": "bad query" }));
            })
            .await;

        let client = SocrataClient::new(reqwest::Client::new(), server.base_url(), "ds", None);
        let err = fetch_all(&client, &window(), 10).await.unwrap_err();
        assert!(matches!(err, FetchError::Decode { offset: 0, .. }), "{err}");
    }

    #[test]
    fn base_url_from_domain() {
        assert_eq!(
            SocrataClient::base_url_for_domain("data.transportation.gov/"),
            "https://data.transportation.gov"
        );
    }
}
