//! Platform integration capabilities, the integration registry and the
//! record normalizer.

use std::time::Duration;

use adpulse_core::{NormalizedRecord, RawRecord};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "adpulse-integrations";

const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const GOOGLE_ADS_API_URL: &str = "https://googleads.googleapis.com/v14";
const META_GRAPH_URL: &str = "https://graph.facebook.com/v18.0";

#[derive(Debug, Error)]
pub enum IntegrationError {
    #[error("{platform} API error ({context}): {message}")]
    Platform {
        platform: String,
        context: String,
        message: String,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IntegrationError {
    fn platform(
        platform: &str,
        context: &str,
        message: impl std::fmt::Display,
    ) -> Self {
        Self::Platform {
            platform: platform.to_string(),
            context: context.to_string(),
            message: message.to_string(),
        }
    }
}

/// Polymorphic per-platform extraction capability.
///
/// `validate_credentials` reports `false` on any auth or transport
/// failure and never errors; `extract_data` wraps transport failures
/// with platform context and makes a single attempt; retry policy
/// belongs to the caller.
#[async_trait]
pub trait Integration: Send + Sync {
    fn platform_name(&self) -> &str;

    fn available_metrics(&self) -> &'static [&'static str];

    fn available_dimensions(&self) -> &'static [&'static str];

    async fn validate_credentials(&self) -> bool;

    /// One raw record per (entity, date) reported by the platform.
    /// `start_date > end_date` yields the empty vector, not an error.
    async fn extract_data(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        metrics: &[String],
        dimensions: &[String],
        filters: &Map<String, Value>,
    ) -> Result<Vec<RawRecord>, IntegrationError>;

    async fn account_info(&self) -> Value {
        let status = if self.validate_credentials().await {
            "connected"
        } else {
            "error"
        };
        json!({ "platform": self.platform_name(), "status": status })
    }
}

// ─── HTTP client ─────────────────────────────────────────────────────

/// No default timeout: bounded latency around a capability call is the
/// caller's responsibility.
#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
    if let Some(timeout) = config.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

fn credential_str<'a>(credentials: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    credentials.get(field).and_then(Value::as_str)
}

fn has_fields(credentials: &Map<String, Value>, fields: &[&str]) -> bool {
    fields.iter().all(|field| credentials.contains_key(*field))
}

fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ─── Google Ads ──────────────────────────────────────────────────────

const GOOGLE_ADS_METRICS: &[&str] = &[
    "impressions",
    "clicks",
    "cost",
    "conversions",
    "revenue",
    "ctr",
    "cpc",
    "cpm",
    "roas",
    "search_impression_share",
    "view_through_conversions",
];

const GOOGLE_ADS_DIMENSIONS: &[&str] = &[
    "date",
    "campaign_id",
    "campaign_name",
    "ad_group_name",
    "device",
    "ad_network_type",
];

pub struct GoogleAdsIntegration {
    credentials: Map<String, Value>,
    http: reqwest::Client,
}

impl GoogleAdsIntegration {
    pub fn new(credentials: Map<String, Value>, http: reqwest::Client) -> Self {
        Self { credentials, http }
    }

    async fn access_token(&self) -> Result<String, IntegrationError> {
        let params = [
            ("client_id", credential_str(&self.credentials, "client_id").unwrap_or_default()),
            (
                "client_secret",
                credential_str(&self.credentials, "client_secret").unwrap_or_default(),
            ),
            (
                "refresh_token",
                credential_str(&self.credentials, "refresh_token").unwrap_or_default(),
            ),
            ("grant_type", "refresh_token"),
        ];

        let resp = self
            .http
            .post(GOOGLE_TOKEN_URL)
            .form(&params)
            .send()
            .await
            .map_err(|err| IntegrationError::platform("google_ads", "token exchange", err))?;

        if !resp.status().is_success() {
            return Err(IntegrationError::platform(
                "google_ads",
                "token exchange",
                format!("http status {}", resp.status().as_u16()),
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|err| IntegrationError::platform("google_ads", "token exchange", err))?;
        body.get("access_token")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                IntegrationError::platform(
                    "google_ads",
                    "token exchange",
                    "response carried no access_token",
                )
            })
    }
}

#[async_trait]
impl Integration for GoogleAdsIntegration {
    fn platform_name(&self) -> &str {
        "google_ads"
    }

    fn available_metrics(&self) -> &'static [&'static str] {
        GOOGLE_ADS_METRICS
    }

    fn available_dimensions(&self) -> &'static [&'static str] {
        GOOGLE_ADS_DIMENSIONS
    }

    async fn validate_credentials(&self) -> bool {
        if !has_fields(&self.credentials, requirements("google_ads").required_fields) {
            return false;
        }
        let token = match self.access_token().await {
            Ok(token) => token,
            Err(_) => return false,
        };

        let url = match credential_str(&self.credentials, "customer_id") {
            Some(customer) => format!("{GOOGLE_ADS_API_URL}/customers/{customer}"),
            None => format!("{GOOGLE_ADS_API_URL}/customers"),
        };
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .header(
                "developer-token",
                credential_str(&self.credentials, "developer_token").unwrap_or_default(),
            )
            .send()
            .await;
        matches!(resp, Ok(resp) if resp.status().is_success())
    }

    async fn extract_data(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        _metrics: &[String],
        _dimensions: &[String],
        _filters: &Map<String, Value>,
    ) -> Result<Vec<RawRecord>, IntegrationError> {
        if start_date > end_date {
            return Ok(Vec::new());
        }

        let token = self.access_token().await?;
        let customer = credential_str(&self.credentials, "customer_id").ok_or_else(|| {
            IntegrationError::platform(
                "google_ads",
                "data extraction",
                "customer_id is required for report extraction",
            )
        })?;

        info!(platform = "google_ads", %start_date, %end_date, "extracting campaign report");

        let query = format!(
            "SELECT campaign.id, campaign.name, segments.date, metrics.impressions, \
             metrics.clicks, metrics.cost_micros, metrics.conversions, \
             metrics.conversions_value FROM campaign \
             WHERE segments.date BETWEEN '{start_date}' AND '{end_date}' \
             ORDER BY segments.date"
        );
        let url = format!("{GOOGLE_ADS_API_URL}/customers/{customer}/googleAds:searchStream");
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&token)
            .header(
                "developer-token",
                credential_str(&self.credentials, "developer_token").unwrap_or_default(),
            )
            .json(&json!({ "query": query }))
            .send()
            .await
            .map_err(|err| IntegrationError::platform("google_ads", "data extraction", err))?;

        if !resp.status().is_success() {
            return Err(IntegrationError::platform(
                "google_ads",
                "data extraction",
                format!("http status {}", resp.status().as_u16()),
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|err| IntegrationError::platform("google_ads", "data extraction", err))?;
        Ok(flatten_google_response(&body))
    }

    async fn account_info(&self) -> Value {
        let status = if self.validate_credentials().await {
            "connected"
        } else {
            "error"
        };
        json!({
            "platform": "google_ads",
            "status": status,
            "customer_id": credential_str(&self.credentials, "customer_id").unwrap_or("N/A"),
        })
    }
}

/// searchStream responds with a sequence of batches, each carrying a
/// `results` array of `{campaign, segments, metrics}` objects.
fn flatten_google_response(body: &Value) -> Vec<RawRecord> {
    let batches: Vec<&Value> = match body {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };

    let mut records = Vec::new();
    for batch in batches {
        let Some(results) = batch.get("results").and_then(Value::as_array) else {
            continue;
        };
        for row in results {
            records.push(flatten_google_row(row));
        }
    }
    records
}

fn flatten_google_row(row: &Value) -> RawRecord {
    let mut record = RawRecord::new();

    if let Some(id) = row.pointer("/campaign/id") {
        record.insert("campaign_id".into(), id.clone());
    }
    if let Some(name) = row.pointer("/campaign/name").and_then(Value::as_str) {
        record.insert("campaign_name".into(), json!(name));
    }
    if let Some(date) = row.pointer("/segments/date").and_then(Value::as_str) {
        record.insert("date".into(), json!(date));
    }

    let Some(metrics) = row.get("metrics") else {
        return record;
    };
    for (key, target) in [
        ("impressions", "impressions"),
        ("clicks", "clicks"),
        ("conversions", "conversions"),
    ] {
        if let Some(value) = metrics.get(key).and_then(json_number) {
            record.insert(target.into(), json!(value));
        }
    }
    // int64 metrics arrive as JSON strings; cost is reported in micros.
    if let Some(micros) = metrics
        .get("costMicros")
        .or_else(|| metrics.get("cost_micros"))
        .and_then(json_number)
    {
        record.insert("cost".into(), json!(round2(micros / 1_000_000.0)));
    }
    if let Some(value) = metrics
        .get("conversionsValue")
        .or_else(|| metrics.get("conversions_value"))
        .and_then(json_number)
    {
        record.insert("revenue".into(), json!(round2(value)));
    }
    record
}

// ─── Facebook / Meta Ads ─────────────────────────────────────────────

const META_ADS_METRICS: &[&str] = &[
    "impressions",
    "clicks",
    "cost",
    "spend",
    "reach",
    "frequency",
    "conversions",
    "ctr",
    "cpc",
    "cpm",
    "link_clicks",
    "post_engagement",
];

const META_ADS_DIMENSIONS: &[&str] = &[
    "date",
    "date_start",
    "date_stop",
    "campaign_id",
    "campaign_name",
    "adset_name",
    "country",
    "publisher_platform",
];

pub struct MetaAdsIntegration {
    credentials: Map<String, Value>,
    http: reqwest::Client,
}

impl MetaAdsIntegration {
    pub fn new(credentials: Map<String, Value>, http: reqwest::Client) -> Self {
        Self { credentials, http }
    }
}

#[async_trait]
impl Integration for MetaAdsIntegration {
    fn platform_name(&self) -> &str {
        "facebook_ads"
    }

    fn available_metrics(&self) -> &'static [&'static str] {
        META_ADS_METRICS
    }

    fn available_dimensions(&self) -> &'static [&'static str] {
        META_ADS_DIMENSIONS
    }

    async fn validate_credentials(&self) -> bool {
        if !has_fields(&self.credentials, requirements("facebook_ads").required_fields) {
            return false;
        }
        let access_token = credential_str(&self.credentials, "access_token").unwrap_or_default();
        let resp = self
            .http
            .get(format!("{META_GRAPH_URL}/me"))
            .query(&[("access_token", access_token), ("fields", "id,name")])
            .send()
            .await;
        matches!(resp, Ok(resp) if resp.status().is_success())
    }

    async fn extract_data(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        _metrics: &[String],
        _dimensions: &[String],
        _filters: &Map<String, Value>,
    ) -> Result<Vec<RawRecord>, IntegrationError> {
        if start_date > end_date {
            return Ok(Vec::new());
        }

        let access_token = credential_str(&self.credentials, "access_token").unwrap_or_default();
        let account = credential_str(&self.credentials, "account_id").ok_or_else(|| {
            IntegrationError::platform(
                "facebook_ads",
                "data extraction",
                "account_id is required for insights extraction",
            )
        })?;

        info!(platform = "facebook_ads", %start_date, %end_date, "extracting insights report");

        let time_range = format!(r#"{{"since":"{start_date}","until":"{end_date}"}}"#);
        let resp = self
            .http
            .get(format!("{META_GRAPH_URL}/act_{account}/insights"))
            .query(&[
                ("access_token", access_token),
                ("level", "campaign"),
                ("time_increment", "1"),
                (
                    "fields",
                    "campaign_id,campaign_name,impressions,clicks,spend,reach,frequency,date_start,date_stop",
                ),
                ("time_range", time_range.as_str()),
            ])
            .send()
            .await
            .map_err(|err| IntegrationError::platform("facebook_ads", "data extraction", err))?;

        if !resp.status().is_success() {
            return Err(IntegrationError::platform(
                "facebook_ads",
                "data extraction",
                format!("http status {}", resp.status().as_u16()),
            ));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|err| IntegrationError::platform("facebook_ads", "data extraction", err))?;
        let rows = body.get("data").and_then(Value::as_array);
        Ok(rows
            .map(|rows| rows.iter().map(flatten_meta_row).collect())
            .unwrap_or_default())
    }

    async fn account_info(&self) -> Value {
        let status = if self.validate_credentials().await {
            "connected"
        } else {
            "error"
        };
        json!({
            "platform": "facebook_ads",
            "status": status,
            "account_id": credential_str(&self.credentials, "account_id").unwrap_or("N/A"),
        })
    }
}

/// Graph insights rows report every numeric metric as a string.
fn flatten_meta_row(row: &Value) -> RawRecord {
    let mut record = RawRecord::new();

    for key in ["campaign_id", "campaign_name", "date_start", "date_stop"] {
        if let Some(value) = row.get(key).and_then(Value::as_str) {
            record.insert(key.into(), json!(value));
        }
    }
    if let Some(date) = row.get("date_start").and_then(Value::as_str) {
        record.insert("date".into(), json!(date));
    }

    for key in ["impressions", "clicks", "reach", "frequency"] {
        if let Some(value) = row.get(key).and_then(json_number) {
            record.insert(key.into(), json!(value));
        }
    }
    if let Some(spend) = row.get("spend").and_then(json_number) {
        record.insert("spend".into(), json!(spend));
        record.insert("cost".into(), json!(spend));
    }
    record
}

// ─── Development stub ────────────────────────────────────────────────

const STUB_METRICS: &[&str] = &[
    "impressions",
    "clicks",
    "cost",
    "conversions",
    "revenue",
];

const STUB_DIMENSIONS: &[&str] = &["date", "campaign_name"];

const STUB_CAMPAIGNS: &[&str] = &[
    "Summer Sale",
    "Brand Awareness",
    "Product Launch",
    "Holiday Special",
];

/// Development stand-in for platforms whose live API client has not
/// been built yet. Fabricates per-campaign daily records
/// deterministically from the date (identical calls return identical
/// records) and never touches the network. Not for production use.
pub struct StubIntegration {
    platform: String,
    credentials: Map<String, Value>,
    required_fields: &'static [&'static str],
}

impl StubIntegration {
    pub fn new(
        platform: impl Into<String>,
        credentials: Map<String, Value>,
        required_fields: &'static [&'static str],
    ) -> Self {
        Self {
            platform: platform.into(),
            credentials,
            required_fields,
        }
    }

    fn record_for(&self, date: NaiveDate, campaign_index: usize) -> RawRecord {
        use chrono::Datelike;

        let seed = date.num_days_from_ce() as i64 * 31 + campaign_index as i64 * 7;
        let impressions = 1_000 + (seed * 97) % 9_000;
        let clicks = 50 + (seed * 13) % 450;
        let cost = (10_000 + (seed * 41) % 90_000) as f64 / 100.0;
        let conversions = 5 + (seed * 7) % 45;
        let revenue = (50_000 + (seed * 59) % 450_000) as f64 / 100.0;

        let mut record = RawRecord::new();
        record.insert("date".into(), json!(date.format("%Y-%m-%d").to_string()));
        record.insert(
            "campaign_name".into(),
            json!(STUB_CAMPAIGNS[campaign_index % STUB_CAMPAIGNS.len()]),
        );
        record.insert("impressions".into(), json!(impressions));
        record.insert("clicks".into(), json!(clicks));
        record.insert("cost".into(), json!(cost));
        record.insert("conversions".into(), json!(conversions));
        record.insert("revenue".into(), json!(revenue));
        record
    }
}

#[async_trait]
impl Integration for StubIntegration {
    fn platform_name(&self) -> &str {
        &self.platform
    }

    fn available_metrics(&self) -> &'static [&'static str] {
        STUB_METRICS
    }

    fn available_dimensions(&self) -> &'static [&'static str] {
        STUB_DIMENSIONS
    }

    async fn validate_credentials(&self) -> bool {
        has_fields(&self.credentials, self.required_fields)
    }

    async fn extract_data(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        _metrics: &[String],
        _dimensions: &[String],
        _filters: &Map<String, Value>,
    ) -> Result<Vec<RawRecord>, IntegrationError> {
        let mut records = Vec::new();
        let mut date = start_date;
        while date <= end_date {
            for campaign_index in 0..STUB_CAMPAIGNS.len() {
                records.push(self.record_for(date, campaign_index));
            }
            date = match date.succ_opt() {
                Some(next) => next,
                None => break,
            };
        }
        Ok(records)
    }
}

// ─── Registry ────────────────────────────────────────────────────────

pub const SUPPORTED_PLATFORMS: &[&str] = &[
    "google_ads",
    "facebook_ads",
    "meta_ads",
    "ga4",
    "google_analytics",
    "instagram_insights",
    "facebook_insights",
    "shopify",
    "amazon_ads",
    "metricool",
    "klaviyo",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    Oauth2,
    ApiKey,
    ServiceAccount,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlatformRequirements {
    pub required_fields: &'static [&'static str],
    pub optional_fields: &'static [&'static str],
    pub auth_kind: AuthKind,
    pub description: &'static str,
}

/// Static credential-requirement catalog, keyed case-insensitively.
/// Unknown platforms fall back to a generic api-key shape.
pub fn requirements(platform: &str) -> PlatformRequirements {
    match platform.to_ascii_lowercase().as_str() {
        "google_ads" => PlatformRequirements {
            required_fields: &["client_id", "client_secret", "refresh_token", "developer_token"],
            optional_fields: &["customer_id"],
            auth_kind: AuthKind::Oauth2,
            description: "Google Ads API requires OAuth2 authentication and a developer token",
        },
        "facebook_ads" | "meta_ads" => PlatformRequirements {
            required_fields: &["access_token", "app_id", "app_secret"],
            optional_fields: &["account_id"],
            auth_kind: AuthKind::Oauth2,
            description: "Meta Marketing API requires a long-lived access token",
        },
        "ga4" => PlatformRequirements {
            required_fields: &["service_account_key", "property_id"],
            optional_fields: &[],
            auth_kind: AuthKind::ServiceAccount,
            description: "Google Analytics 4 requires a service account key",
        },
        "google_analytics" => PlatformRequirements {
            required_fields: &["service_account_key", "view_id"],
            optional_fields: &[],
            auth_kind: AuthKind::ServiceAccount,
            description: "Google Analytics requires a service account key",
        },
        "instagram_insights" => PlatformRequirements {
            required_fields: &["access_token", "instagram_business_account_id"],
            optional_fields: &[],
            auth_kind: AuthKind::Oauth2,
            description: "Instagram Basic Display API requires an access token",
        },
        "facebook_insights" => PlatformRequirements {
            required_fields: &["access_token", "page_id"],
            optional_fields: &[],
            auth_kind: AuthKind::Oauth2,
            description: "Facebook Graph API requires an access token",
        },
        "shopify" => PlatformRequirements {
            required_fields: &["shop_domain", "access_token"],
            optional_fields: &[],
            auth_kind: AuthKind::ApiKey,
            description: "Shopify Admin API requires a private app access token",
        },
        "amazon_ads" => PlatformRequirements {
            required_fields: &["client_id", "client_secret", "refresh_token"],
            optional_fields: &["profile_id"],
            auth_kind: AuthKind::Oauth2,
            description: "Amazon Advertising API requires OAuth2 authentication",
        },
        "metricool" => PlatformRequirements {
            required_fields: &["api_key"],
            optional_fields: &[],
            auth_kind: AuthKind::ApiKey,
            description: "Metricool API requires an API key",
        },
        "klaviyo" => PlatformRequirements {
            required_fields: &["api_key"],
            optional_fields: &[],
            auth_kind: AuthKind::ApiKey,
            description: "Klaviyo API requires an API key",
        },
        _ => PlatformRequirements {
            required_fields: &["api_key"],
            optional_fields: &[],
            auth_kind: AuthKind::ApiKey,
            description: "Platform-specific credentials required",
        },
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct CredentialValidation {
    pub platform: String,
    pub valid: bool,
    pub missing_fields: Vec<String>,
    pub account_info: Option<Value>,
    pub error: Option<String>,
}

/// Maps platform identifiers to capability constructors. Adding a
/// platform means adding an arm here and a catalog entry in
/// [`requirements`]; callers stay untouched.
#[derive(Clone)]
pub struct IntegrationRegistry {
    http: reqwest::Client,
}

impl IntegrationRegistry {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            http: build_http_client(&HttpClientConfig::default())?,
        })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    pub fn supported_platforms(&self) -> &'static [&'static str] {
        SUPPORTED_PLATFORMS
    }

    /// Case-insensitive capability lookup; `meta_ads` aliases
    /// `facebook_ads`.
    pub fn resolve(
        &self,
        platform: &str,
        credentials: &Map<String, Value>,
    ) -> Result<Box<dyn Integration>, RegistryError> {
        let normalized = platform.to_ascii_lowercase();
        if !SUPPORTED_PLATFORMS.contains(&normalized.as_str()) {
            return Err(RegistryError::UnsupportedPlatform(normalized));
        }
        match normalized.as_str() {
            "google_ads" => Ok(Box::new(GoogleAdsIntegration::new(
                credentials.clone(),
                self.http.clone(),
            ))),
            "facebook_ads" | "meta_ads" => Ok(Box::new(MetaAdsIntegration::new(
                credentials.clone(),
                self.http.clone(),
            ))),
            name => Ok(Box::new(StubIntegration::new(
                name,
                credentials.clone(),
                requirements(name).required_fields,
            ))),
        }
    }

    /// Shape check first: missing required fields short-circuit with a
    /// report and no network call. Only then comes the live round trip.
    pub async fn validate_credential_payload(
        &self,
        platform: &str,
        payload: &Map<String, Value>,
    ) -> CredentialValidation {
        let reqs = requirements(platform);
        let missing_fields: Vec<String> = reqs
            .required_fields
            .iter()
            .filter(|field| !payload.contains_key(**field))
            .map(|field| field.to_string())
            .collect();
        if !missing_fields.is_empty() {
            return CredentialValidation {
                platform: platform.to_string(),
                valid: false,
                error: Some(format!(
                    "missing required fields: {}",
                    missing_fields.join(", ")
                )),
                missing_fields,
                account_info: None,
            };
        }

        let integration = match self.resolve(platform, payload) {
            Ok(integration) => integration,
            Err(err) => {
                return CredentialValidation {
                    platform: platform.to_string(),
                    valid: false,
                    missing_fields: Vec::new(),
                    account_info: None,
                    error: Some(err.to_string()),
                }
            }
        };

        let valid = integration.validate_credentials().await;
        CredentialValidation {
            platform: platform.to_string(),
            valid,
            missing_fields: Vec::new(),
            account_info: if valid {
                Some(integration.account_info().await)
            } else {
                None
            },
            error: if valid {
                None
            } else {
                Some("credential validation failed".to_string())
            },
        }
    }
}

// ─── Record normalizer ───────────────────────────────────────────────

pub const DEFAULT_METRICS: &[&str] = &["impressions", "clicks", "cost"];
pub const DEFAULT_DIMENSIONS: &[&str] = &["date", "campaign_name"];

const DERIVED_METRICS: &[&str] = &["ctr", "cpc", "cpm", "roas"];

/// Converts one raw platform record into the canonical shape,
/// restricted to the requested metric and dimension names. Unknown
/// requested names are silently omitted; derived ratios are computed
/// only when requested and not already supplied by the platform.
pub fn normalize_record(
    platform: &str,
    raw: &RawRecord,
    metrics: &[String],
    dimensions: &[String],
    data_type: &str,
    fallback_date: NaiveDate,
) -> NormalizedRecord {
    let effective_metrics = effective_names(metrics, DEFAULT_METRICS);
    let effective_dimensions = effective_names(dimensions, DEFAULT_DIMENSIONS);

    let mut out_dimensions = Map::new();
    for name in &effective_dimensions {
        if let Some(value) = raw.get(name) {
            out_dimensions.insert(name.clone(), value.clone());
        }
    }

    let mut out_metrics = Map::new();
    for name in &effective_metrics {
        if let Some(value) = raw.get(name) {
            out_metrics.insert(name.clone(), value.clone());
            continue;
        }
        if DERIVED_METRICS.contains(&name.as_str()) {
            if let Some(value) = derived_metric(name, raw) {
                out_metrics.insert(name.clone(), json!(value));
            }
        }
    }

    NormalizedRecord {
        platform: platform.to_string(),
        extracted_at: Utc::now(),
        data_type: data_type.to_string(),
        data_date: record_date(raw).unwrap_or(fallback_date),
        dimensions: out_dimensions,
        metrics: out_metrics,
        raw: Value::Object(raw.clone()),
    }
}

fn effective_names(requested: &[String], defaults: &[&str]) -> Vec<String> {
    if requested.is_empty() {
        defaults.iter().map(|name| name.to_string()).collect()
    } else {
        requested.to_vec()
    }
}

/// Derived ratios, rounded to 2 decimal places. Division by zero never
/// errors; it yields 0.
pub fn derived_metric(name: &str, raw: &RawRecord) -> Option<f64> {
    let field = |key: &str| raw.get(key).and_then(json_number);
    let value = match name {
        "ctr" => safe_ratio(field("clicks")?, field("impressions")?) * 100.0,
        "cpc" => safe_ratio(field("cost")?, field("clicks")?),
        "cpm" => safe_ratio(field("cost")?, field("impressions")?) * 1000.0,
        "roas" => safe_ratio(field("revenue")?, field("cost")?),
        _ => return None,
    };
    Some(round2(value))
}

fn safe_ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

/// The record's own calendar date, when the platform reported one.
pub fn record_date(raw: &RawRecord) -> Option<NaiveDate> {
    for key in ["date", "date_start"] {
        if let Some(text) = raw.get(key).and_then(Value::as_str) {
            if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
                return Some(date);
            }
        }
    }
    None
}
