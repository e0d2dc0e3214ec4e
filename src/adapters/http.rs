use crate::config::toml_config::ApiConfig;
use crate::core::search::MAX_RADIUS_M;
use crate::domain::model::{ExternalItem, GeoPoint};
use crate::domain::ports::{SearchApi, SearchPage, SearchRequest};
use crate::utils::error::{HarvestError, Result};
use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    businesses: Vec<Value>,
}

/// 以 `latitude`/`longitude`/`radius` 查詢的分頁搜尋 API
pub struct HttpSearchApi {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    page_size: u32,
    max_offset: u32,
    parameters: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
}

impl HttpSearchApi {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, api_key, Duration::from_secs(30))
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            page_size: 50,
            max_offset: 1000,
            parameters: BTreeMap::new(),
            headers: BTreeMap::new(),
        })
    }

    pub fn from_config(config: &ApiConfig) -> Result<Self> {
        let mut api = Self::with_timeout(
            config.endpoint.clone(),
            config.api_key.clone(),
            Duration::from_secs(config.timeout_seconds),
        )?
        .with_paging(config.page_size, config.max_offset);
        api.parameters = config.parameters.clone();
        api.headers = config.headers.clone();
        Ok(api)
    }

    pub fn with_paging(mut self, page_size: u32, max_offset: u32) -> Self {
        self.page_size = page_size;
        self.max_offset = max_offset;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    fn query(&self, request: &SearchRequest) -> Vec<(String, String)> {
        let mut query = vec![
            ("latitude".to_string(), request.lat.to_string()),
            ("longitude".to_string(), request.lng.to_string()),
            (
                "radius".to_string(),
                request.radius_m.min(MAX_RADIUS_M).to_string(),
            ),
            ("offset".to_string(), request.offset.to_string()),
            ("limit".to_string(), request.limit.to_string()),
        ];
        query.extend(
            self.parameters
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        query
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    value
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// 沒有 `id` 的資料無法去重，直接略過
fn parse_business(value: Value) -> Option<ExternalItem> {
    let id = match value.get("id")? {
        Value::String(s) if !s.is_empty() => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let name = value.get("name").and_then(Value::as_str).map(str::to_string);
    let coordinates = value.get("coordinates").and_then(|c| {
        let lat = c.get("latitude")?.as_f64()?;
        let lng = c.get("longitude")?.as_f64()?;
        Some(GeoPoint::new(lat, lng))
    });

    Some(ExternalItem {
        id,
        name,
        coordinates,
        raw: value,
    })
}

#[async_trait]
impl SearchApi for HttpSearchApi {
    async fn search(&self, request: &SearchRequest) -> Result<SearchPage> {
        let mut builder = self.client.get(&self.endpoint).query(&self.query(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }

        tracing::trace!(
            "Searching ({}, {}) r={}m offset={}",
            request.lat,
            request.lng,
            request.radius_m,
            request.offset
        );
        let resp = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                HarvestError::TransientApi {
                    status: None,
                    message: e.to_string(),
                    retry_after: None,
                }
            } else {
                HarvestError::Http(e)
            }
        })?;

        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(resp.headers().get(RETRY_AFTER));
            return Err(HarvestError::TransientApi {
                status: Some(status.as_u16()),
                message: "rate limited by the search API".to_string(),
                retry_after,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(HarvestError::TransientApi {
                    status: Some(status.as_u16()),
                    message: body,
                    retry_after: None,
                });
            }
            return Err(HarvestError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: SearchResponse = resp.json().await?;
        let received = body.businesses.len();
        let items: Vec<ExternalItem> = body
            .businesses
            .into_iter()
            .filter_map(parse_business)
            .collect();
        if items.len() < received {
            tracing::debug!(
                "Skipped {} results without an id",
                received - items.len()
            );
        }

        Ok(SearchPage {
            total: body.total,
            items,
        })
    }

    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn max_offset(&self) -> u32 {
        self.max_offset
    }
}
