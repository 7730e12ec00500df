//! Connectors for the three upstream systems: the asset/ticketing API, the
//! directory/device-management API and the network-infrastructure API.
//!
//! Each connector owns its auth headers and pagination quirks and exposes a
//! pager object plus point lookups. Transforms from raw JSON to canonical
//! records are pure functions so they can be tested on fixtures.

use std::collections::HashSet;
use std::time::Duration;

use atlas_core::{
    format_mac, normalize_mac, parse_decimal_field, AssetRecord, DeviceRecord,
    NetworkClientRecord, RecordError,
};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{RequestBuilder, StatusCode};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "atlas-connectors";

/// Default field-type id of the fee-tracker custom field on asset records.
pub const DEFAULT_FEE_FIELD_TYPE_ID: &str = "fb1baf3c-345c-4b85-ab35-d109851e27d4";

/// Network clients are listed over a trailing 24h window.
const CLIENT_TIMESPAN_SECS: u64 = 86_400;

const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("request failed after retries: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("decoding response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("invalid connector configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    pub point_lookup_timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            point_lookup_timeout: Duration::from_secs(10),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

fn build_client(http: &HttpConfig, headers: HeaderMap) -> Result<reqwest::Client, ConnectorError> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .timeout(http.timeout)
        .default_headers(headers);
    if let Some(user_agent) = &http.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    Ok(builder.build()?)
}

fn header_value(value: &str, what: &str) -> Result<HeaderValue, ConnectorError> {
    HeaderValue::from_str(value)
        .map_err(|_| ConnectorError::Config(format!("{what} is not a valid header value")))
}

/// Sends a request, retrying retryable failures with bounded backoff, and
/// decodes the body as JSON. Non-2xx after retries surfaces as `Status`.
async fn send_json(
    backoff: &BackoffPolicy,
    build: impl Fn() -> RequestBuilder,
) -> Result<Value, ConnectorError> {
    let mut last_request_error: Option<reqwest::Error> = None;

    for attempt in 0..=backoff.max_retries {
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                let url = resp.url().to_string();

                if status.is_success() {
                    let span = info_span!("upstream_fetch", %url, status = status.as_u16());
                    return resp
                        .json::<Value>()
                        .instrument(span)
                        .await
                        .map_err(|err| ConnectorError::Decode {
                            url,
                            message: err.to_string(),
                        });
                }

                if classify_status(status) == RetryDisposition::Retryable
                    && attempt < backoff.max_retries
                {
                    debug!(%url, status = status.as_u16(), attempt, "retryable upstream status");
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    continue;
                }

                return Err(ConnectorError::Status {
                    status: status.as_u16(),
                    url,
                });
            }
            Err(err) => {
                if classify_reqwest_error(&err) == RetryDisposition::Retryable
                    && attempt < backoff.max_retries
                {
                    last_request_error = Some(err);
                    tokio::time::sleep(backoff.delay_for_attempt(attempt)).await;
                    continue;
                }
                return Err(ConnectorError::Transport(err));
            }
        }
    }

    match last_request_error {
        Some(err) => Err(ConnectorError::Transport(err)),
        None => Err(ConnectorError::Config(
            "retry loop exited without a captured error".to_string(),
        )),
    }
}

fn str_field(raw: &Value, key: &str) -> Option<String> {
    raw.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

fn nested_str(raw: &Value, path: &[&str]) -> Option<String> {
    let mut current = raw;
    for key in path {
        current = current.get(key)?;
    }
    current
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

// ---------------------------------------------------------------------------
// Asset system
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct AssetSystemConfig {
    pub base_url: String,
    pub api_token: String,
    pub site_id: String,
    pub product_id: String,
    pub fee_field_type_id: String,
}

pub struct AssetSystemConnector {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
    point_lookup_timeout: Duration,
    fee_field_type_id: String,
}

impl AssetSystemConnector {
    pub fn new(config: AssetSystemConfig, http: &HttpConfig) -> Result<Self, ConnectorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", config.api_token), "asset api token")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("SiteId", header_value(&config.site_id, "asset site id")?);
        headers.insert(
            "ProductId",
            header_value(&config.product_id, "asset product id")?,
        );
        headers.insert("Client", HeaderValue::from_static("ApiClient"));

        Ok(Self {
            client: build_client(http, headers)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            backoff: http.backoff,
            point_lookup_timeout: http.point_lookup_timeout,
            fee_field_type_id: config.fee_field_type_id,
        })
    }

    pub fn fee_field_type_id(&self) -> &str {
        &self.fee_field_type_id
    }

    async fn point_lookup(&self, url: String) -> Result<Option<Value>, ConnectorError> {
        let result = send_json(&self.backoff, || {
            self.client.get(&url).timeout(self.point_lookup_timeout)
        })
        .await;
        match result {
            Ok(body) => Ok(unwrap_item_envelope(&body)),
            Err(ConnectorError::Status { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Looks up one asset by serial number. Absence is `Ok(None)`.
    pub async fn fetch_by_serial(&self, serial: &str) -> Result<Option<Value>, ConnectorError> {
        let url = format!("{}/api/v1.0/assets/serial/{}", self.base_url, serial.trim());
        self.point_lookup(url).await
    }

    /// Looks up one asset by asset tag. Absence is `Ok(None)`.
    pub async fn fetch_by_tag(&self, tag: &str) -> Result<Option<Value>, ConnectorError> {
        let url = format!("{}/api/v1.0/assets/assettag/{}", self.base_url, tag.trim());
        self.point_lookup(url).await
    }

    /// Resolves a location id to its display name. The nil uuid is treated as
    /// unset.
    pub async fn location_name(&self, location_id: &str) -> Result<Option<String>, ConnectorError> {
        if location_id.is_empty() || location_id == NIL_UUID {
            return Ok(None);
        }
        let url = format!("{}/api/v1.0/locations/{}", self.base_url, location_id);
        match send_json(&self.backoff, || self.client.get(&url)).await {
            Ok(body) => Ok(nested_str(&body, &["Location", "Name"])),
            Err(ConnectorError::Status { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn asset_pages(&self, page_size: u64) -> AssetPager<'_> {
        AssetPager {
            connector: self,
            page_index: 0,
            page_size,
            total_rows: None,
            fetched: 0,
            done: false,
        }
    }
}

/// Page-index pager over the asset list endpoint. The paging block must be
/// sent in the POST body; query parameters are ignored by the upstream. The
/// first response's `Paging.TotalRows` bounds the loop.
pub struct AssetPager<'a> {
    connector: &'a AssetSystemConnector,
    page_index: u64,
    page_size: u64,
    total_rows: Option<u64>,
    fetched: u64,
    done: bool,
}

impl AssetPager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ConnectorError> {
        if self.done {
            return Ok(None);
        }

        let url = format!("{}/api/v1.0/assets", self.connector.base_url);
        let body = json!({
            "OnlyShowDeleted": false,
            "Paging": { "PageIndex": self.page_index, "PageSize": self.page_size },
        });

        let page = send_json(&self.connector.backoff, || {
            self.connector.client.post(&url).json(&body)
        })
        .await
        .inspect_err(|_| self.done = true)?;

        let (items, total_rows) = parse_asset_envelope(&page);
        if self.total_rows.is_none() {
            self.total_rows = Some(total_rows.unwrap_or(0));
        }

        if items.is_empty() {
            self.done = true;
            return Ok(None);
        }

        self.fetched += items.len() as u64;
        if self.fetched >= self.total_rows.unwrap_or(0) {
            self.done = true;
        }
        self.page_index += 1;
        Ok(Some(items))
    }

    pub fn total_rows(&self) -> Option<u64> {
        self.total_rows
    }
}

/// Splits a list-envelope response into its items and `Paging.TotalRows`.
pub fn parse_asset_envelope(body: &Value) -> (Vec<Value>, Option<u64>) {
    let items = body
        .get("Items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let total = body
        .get("Paging")
        .and_then(|p| p.get("TotalRows"))
        .and_then(Value::as_u64);
    (items, total)
}

fn unwrap_item_envelope(body: &Value) -> Option<Value> {
    let count = body.get("ItemCount").and_then(Value::as_u64).unwrap_or(0);
    if count == 0 {
        return None;
    }
    body.get("Items")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .cloned()
}

/// The owner's location id, resolved separately through the location cache.
pub fn asset_owner_location_id(raw: &Value) -> Option<String> {
    nested_str(raw, &["Owner", "LocationId"]).filter(|id| id != NIL_UUID)
}

/// Transforms one raw asset into a canonical record. A missing serial number
/// is a per-record validation failure, never an abort.
pub fn transform_asset(raw: &Value, fee_field_type_id: &str) -> Result<AssetRecord, RecordError> {
    let Some(serial) = str_field(raw, "SerialNumber") else {
        let identifier = str_field(raw, "AssetTag")
            .or_else(|| str_field(raw, "AssetId"))
            .unwrap_or_else(|| "<unknown>".to_string());
        return Err(RecordError::new(identifier, "asset has no serial number"));
    };

    let (fee_balance, fee_past_due) = parse_fee_data(raw, fee_field_type_id);

    Ok(AssetRecord {
        external_id: str_field(raw, "AssetId"),
        asset_tag: str_field(raw, "AssetTag"),
        model: nested_str(raw, &["Model", "Name"]),
        model_category: nested_str(raw, &["Model", "Category", "Name"]),
        status: nested_str(raw, &["Status", "Name"]),
        mac_address: str_field(raw, "WifiMacAddress")
            .or_else(|| str_field(raw, "MacAddress"))
            .and_then(|mac| normalize_mac(&mac)),
        assigned_user_email: nested_str(raw, &["Owner", "Email"]),
        assigned_user_name: nested_str(raw, &["Owner", "FullName"]),
        assigned_user_role: nested_str(raw, &["Owner", "RoleName"]),
        assigned_user_grade: nested_str(raw, &["Owner", "Grade"]),
        assigned_user_sis_id: nested_str(raw, &["Owner", "SchoolIdNumber"]),
        owner_external_id: nested_str(raw, &["Owner", "UserId"]),
        owner_location: None,
        location: nested_str(raw, &["Location", "Name"]),
        open_tickets: raw.get("OpenTickets").and_then(Value::as_i64).unwrap_or(0),
        fee_balance,
        fee_past_due,
        raw: raw.clone(),
        last_updated: Utc::now(),
        serial_number: serial,
    })
}

/// Sums fee entries with a positive balance from the fee-tracker custom
/// field. The upstream occasionally repeats entries, so identical
/// (Amount, Balance, LastActivityDate) triples count once.
pub fn parse_fee_data(raw: &Value, fee_field_type_id: &str) -> (Option<f64>, Option<f64>) {
    let Some(fields) = raw.get("CustomFieldValues").and_then(Value::as_array) else {
        return (None, None);
    };
    let Some(value) = fields
        .iter()
        .find(|f| {
            f.get("CustomFieldTypeId").and_then(Value::as_str) == Some(fee_field_type_id)
        })
        .and_then(|f| f.get("Value"))
        .and_then(Value::as_str)
    else {
        return (None, None);
    };
    let Ok(Value::Array(entries)) = serde_json::from_str::<Value>(value) else {
        return (None, None);
    };

    let mut seen = HashSet::new();
    let mut total_balance = 0.0;
    let mut total_past_due = 0.0;
    for entry in &entries {
        let balance = decimal_value(entry.get("Balance")).unwrap_or(0.0);
        if balance <= 0.0 {
            continue;
        }
        let key = (
            entry.get("Amount").map(Value::to_string),
            entry.get("Balance").map(Value::to_string),
            entry.get("LastActivityDate").map(Value::to_string),
        );
        if seen.insert(key) {
            total_balance += balance;
            total_past_due += decimal_value(entry.get("PastDueAmount")).unwrap_or(0.0);
        }
    }

    (
        (total_balance > 0.0).then_some(total_balance),
        (total_past_due > 0.0).then_some(total_past_due),
    )
}

fn decimal_value(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => parse_decimal_field(s),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Directory system
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DirectorySystemConfig {
    pub base_url: String,
    pub access_token: String,
    pub customer_id: String,
}

pub struct DirectorySystemConnector {
    client: reqwest::Client,
    base_url: String,
    customer_id: String,
    backoff: BackoffPolicy,
    point_lookup_timeout: Duration,
}

impl DirectorySystemConnector {
    pub fn new(config: DirectorySystemConfig, http: &HttpConfig) -> Result<Self, ConnectorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            header_value(
                &format!("Bearer {}", config.access_token),
                "directory access token",
            )?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        Ok(Self {
            client: build_client(http, headers)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            customer_id: config.customer_id,
            backoff: http.backoff,
            point_lookup_timeout: http.point_lookup_timeout,
        })
    }

    fn devices_url(&self) -> String {
        format!(
            "{}/admin/directory/v1/customer/{}/devices/chromeos",
            self.base_url, self.customer_id
        )
    }

    /// Query lookup by serial number. An empty device list is `Ok(None)`.
    pub async fn fetch_device_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<Value>, ConnectorError> {
        let query = serial.trim().to_ascii_uppercase();
        let url = self.devices_url();
        let result = send_json(&self.backoff, || {
            self.client
                .get(&url)
                .query(&[("query", query.as_str())])
                .timeout(self.point_lookup_timeout)
        })
        .await;
        match result {
            Ok(body) => {
                let (devices, _) = parse_directory_page(&body);
                Ok(devices.into_iter().next())
            }
            Err(ConnectorError::Status { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn device_pages(&self, page_size: u64) -> DevicePager<'_> {
        DevicePager {
            connector: self,
            page_size,
            page_token: None,
            done: false,
        }
    }
}

/// Cursor pager over the directory device list. Terminates when the response
/// carries no `nextPageToken`.
pub struct DevicePager<'a> {
    connector: &'a DirectorySystemConnector,
    page_size: u64,
    page_token: Option<String>,
    done: bool,
}

impl DevicePager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ConnectorError> {
        if self.done {
            return Ok(None);
        }

        let url = self.connector.devices_url();
        let max_results = self.page_size.to_string();
        let token = self.page_token.clone();
        let body = send_json(&self.connector.backoff, || {
            let mut req = self.connector.client.get(&url).query(&[
                ("maxResults", max_results.as_str()),
                ("projection", "FULL"),
            ]);
            if let Some(token) = &token {
                req = req.query(&[("pageToken", token.as_str())]);
            }
            req
        })
        .await
        .inspect_err(|_| self.done = true)?;

        let (devices, next_token) = parse_directory_page(&body);
        self.page_token = next_token;
        if self.page_token.is_none() {
            self.done = true;
        }

        if devices.is_empty() && self.done {
            return Ok(None);
        }
        Ok(Some(devices))
    }
}

/// Splits a directory list response into its devices and cursor token.
pub fn parse_directory_page(body: &Value) -> (Vec<Value>, Option<String>) {
    let devices = body
        .get("chromeosdevices")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let token = str_field(body, "nextPageToken");
    (devices, token)
}

/// Parses an upstream timestamp, treating the epoch sentinel as "never".
pub fn parse_directory_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?.with_timezone(&Utc);
    if parsed.timestamp() == 0 {
        return None;
    }
    Some(parsed)
}

/// Battery health as full-charge over design capacity, capped at 100.
pub fn battery_health_percent(raw: &Value) -> Option<i32> {
    let full = raw
        .get("batteryStatusReport")
        .and_then(Value::as_array)
        .and_then(|reports| reports.first())
        .and_then(|r| capacity_value(r.get("fullChargeCapacity")))?;
    let design = raw
        .get("batteryInfo")
        .and_then(Value::as_array)
        .and_then(|info| info.first())
        .and_then(|i| capacity_value(i.get("designCapacity")))?;
    if design <= 0 {
        return None;
    }
    let percent = ((full as f64 / design as f64) * 100.0) as i32;
    Some(percent.min(100))
}

fn capacity_value(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Transforms one raw directory device into a canonical record.
pub fn transform_device(raw: &Value) -> Result<DeviceRecord, RecordError> {
    let Some(serial) = str_field(raw, "serialNumber") else {
        let identifier = str_field(raw, "deviceId")
            .or_else(|| str_field(raw, "annotatedAssetId"))
            .unwrap_or_else(|| "<unknown>".to_string());
        return Err(RecordError::new(identifier, "device has no serial number"));
    };

    let recent_users = raw
        .get("recentUsers")
        .and_then(Value::as_array)
        .map(|users| {
            users
                .iter()
                .filter_map(|u| str_field(u, "email"))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    Ok(DeviceRecord {
        directory_id: str_field(raw, "deviceId"),
        org_unit: str_field(raw, "orgUnitPath"),
        annotated_asset_tag: str_field(raw, "annotatedAssetId"),
        annotated_user: str_field(raw, "annotatedUser"),
        annotated_location: str_field(raw, "annotatedLocation"),
        model: str_field(raw, "model"),
        status: str_field(raw, "status"),
        os_version: str_field(raw, "osVersion"),
        auto_update_expiration: str_field(raw, "autoUpdateThrough"),
        boot_mode: str_field(raw, "bootMode"),
        battery_health_percent: battery_health_percent(raw),
        mac_address: str_field(raw, "macAddress").and_then(|mac| normalize_mac(&mac)),
        ethernet_mac_address: str_field(raw, "ethernetMacAddress")
            .and_then(|mac| normalize_mac(&mac)),
        recent_users,
        last_sync: str_field(raw, "lastSync").and_then(|ts| parse_directory_timestamp(&ts)),
        raw: raw.clone(),
        last_updated: Utc::now(),
        serial_number: serial,
    })
}

// ---------------------------------------------------------------------------
// Network system
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct NetworkSystemConfig {
    pub base_url: String,
    pub api_key: String,
    pub org_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRef {
    pub id: String,
    pub name: String,
}

pub struct NetworkSystemConnector {
    client: reqwest::Client,
    base_url: String,
    org_id: String,
    backoff: BackoffPolicy,
    point_lookup_timeout: Duration,
    // Client enumeration is scoped per network; the wireless subset is
    // fetched once per connector instance.
    wireless_networks: Mutex<Option<Vec<NetworkRef>>>,
}

impl NetworkSystemConnector {
    pub fn new(config: NetworkSystemConfig, http: &HttpConfig) -> Result<Self, ConnectorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            header_value(&format!("Bearer {}", config.api_key), "network api key")?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        Ok(Self {
            client: build_client(http, headers)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            org_id: config.org_id,
            backoff: http.backoff,
            point_lookup_timeout: http.point_lookup_timeout,
            wireless_networks: Mutex::new(None),
        })
    }

    /// The org's wireless networks (by naming convention), cached for the
    /// connector's lifetime. Switch networks carry no client-AP data.
    pub async fn wireless_networks(&self) -> Result<Vec<NetworkRef>, ConnectorError> {
        let mut cache = self.wireless_networks.lock().await;
        if let Some(networks) = cache.as_ref() {
            return Ok(networks.clone());
        }

        let url = format!("{}/organizations/{}/networks", self.base_url, self.org_id);
        let body = send_json(&self.backoff, || self.client.get(&url)).await?;
        let networks = filter_wireless_networks(&body);
        debug!(count = networks.len(), "cached wireless networks");
        *cache = Some(networks.clone());
        Ok(networks)
    }

    pub fn client_pages(&self, page_size: u64) -> NetworkClientPager<'_> {
        NetworkClientPager {
            connector: self,
            page_size,
            networks: None,
            network_index: 0,
            starting_after: None,
            done: false,
        }
    }

    /// Org-wide search for a client by MAC, restricted to wireless networks.
    /// When multiple networks have seen the client the freshest record wins.
    pub async fn fetch_client_by_mac(&self, mac: &str) -> Result<Option<Value>, ConnectorError> {
        let Some(normalized) = normalize_mac(mac) else {
            return Ok(None);
        };
        let formatted = format_mac(&normalized);
        let wireless = self.wireless_networks().await?;
        if wireless.is_empty() {
            return Ok(None);
        }
        let wireless_ids: HashSet<&str> = wireless.iter().map(|n| n.id.as_str()).collect();

        let url = format!(
            "{}/organizations/{}/clients/search",
            self.base_url, self.org_id
        );
        let body = match send_json(&self.backoff, || {
            self.client
                .get(&url)
                .query(&[("mac", formatted.as_str())])
                .timeout(self.point_lookup_timeout)
        })
        .await
        {
            Ok(body) => body,
            Err(ConnectorError::Status { status: 404, .. }) => return Ok(None),
            Err(err) => return Err(err),
        };

        let mut records: Vec<Value> = body
            .get("records")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| {
                nested_str(r, &["network", "id"])
                    .is_some_and(|id| wireless_ids.contains(id.as_str()))
            })
            .collect();
        records.sort_by_key(|r| std::cmp::Reverse(parse_last_seen(r.get("lastSeen"))));

        let Some(mut record) = records.into_iter().next() else {
            return Ok(None);
        };
        if let Some(obj) = record.as_object_mut() {
            obj.entry("mac").or_insert_with(|| Value::from(formatted));
        }
        Ok(Some(record))
    }
}

fn filter_wireless_networks(body: &Value) -> Vec<NetworkRef> {
    body.as_array()
        .map(|networks| {
            networks
                .iter()
                .filter_map(|n| {
                    let id = str_field(n, "id")?;
                    let name = str_field(n, "name")?;
                    name.to_ascii_lowercase()
                        .contains("wireless")
                        .then_some(NetworkRef { id, name })
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Cursor pager over per-network client lists. Walks every cached wireless
/// network in turn; each returned client is annotated with its network id and
/// name for the transform.
pub struct NetworkClientPager<'a> {
    connector: &'a NetworkSystemConnector,
    page_size: u64,
    networks: Option<Vec<NetworkRef>>,
    network_index: usize,
    starting_after: Option<String>,
    done: bool,
}

impl NetworkClientPager<'_> {
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ConnectorError> {
        if self.done {
            return Ok(None);
        }

        if self.networks.is_none() {
            let networks = self
                .connector
                .wireless_networks()
                .await
                .inspect_err(|_| self.done = true)?;
            self.networks = Some(networks);
        }

        loop {
            let Some(network) = self
                .networks
                .as_ref()
                .and_then(|n| n.get(self.network_index))
                .cloned()
            else {
                self.done = true;
                return Ok(None);
            };

            let url = format!("{}/networks/{}/clients", self.connector.base_url, network.id);
            let per_page = self.page_size.to_string();
            let timespan = CLIENT_TIMESPAN_SECS.to_string();
            let starting_after = self.starting_after.clone();
            let body = send_json(&self.connector.backoff, || {
                let mut req = self.connector.client.get(&url).query(&[
                    ("perPage", per_page.as_str()),
                    ("timespan", timespan.as_str()),
                ]);
                if let Some(after) = &starting_after {
                    req = req.query(&[("startingAfter", after.as_str())]);
                }
                req
            })
            .await
            .inspect_err(|_| self.done = true)?;

            let mut clients = body.as_array().cloned().unwrap_or_default();
            let full_page = clients.len() as u64 >= self.page_size;
            if full_page {
                self.starting_after = clients
                    .last()
                    .and_then(|c| str_field(c, "id"))
                    .or_else(|| {
                        warn!(network = %network.name, "page has no cursor id, moving on");
                        None
                    });
                if self.starting_after.is_none() {
                    self.network_index += 1;
                }
            } else {
                self.network_index += 1;
                self.starting_after = None;
            }

            if clients.is_empty() {
                continue;
            }
            for client in &mut clients {
                if let Some(obj) = client.as_object_mut() {
                    obj.insert("networkId".to_string(), Value::from(network.id.clone()));
                    obj.insert("networkName".to_string(), Value::from(network.name.clone()));
                }
            }
            return Ok(Some(clients));
        }
    }
}

/// Parses a `lastSeen` value that may arrive as epoch seconds or RFC 3339.
pub fn parse_last_seen(value: Option<&Value>) -> Option<DateTime<Utc>> {
    match value? {
        Value::Number(n) => {
            let secs = n.as_i64()?;
            if secs <= 0 {
                return None;
            }
            DateTime::from_timestamp(secs, 0)
        }
        Value::String(s) => {
            let parsed = DateTime::parse_from_rfc3339(s).ok()?.with_timezone(&Utc);
            (parsed.timestamp() > 0).then_some(parsed)
        }
        _ => None,
    }
}

/// Transforms one raw network client into a canonical record. A client whose
/// MAC is missing or malformed is a per-record validation failure.
pub fn transform_client(raw: &Value) -> Result<NetworkClientRecord, RecordError> {
    let raw_mac = str_field(raw, "mac");
    let Some(mac) = raw_mac.as_deref().and_then(normalize_mac) else {
        let identifier = str_field(raw, "id")
            .or(raw_mac)
            .unwrap_or_else(|| "<unknown>".to_string());
        return Err(RecordError::new(identifier, "client has no usable mac address"));
    };

    Ok(NetworkClientRecord {
        client_id: str_field(raw, "id").or_else(|| str_field(raw, "client_id")),
        network_id: str_field(raw, "networkId").or_else(|| nested_str(raw, &["network", "id"])),
        ap_name: str_field(raw, "recentDeviceName")
            .or_else(|| str_field(raw, "networkName"))
            .or_else(|| nested_str(raw, &["network", "name"])),
        ip_address: str_field(raw, "ip").or_else(|| str_field(raw, "ip_address")),
        ssid: str_field(raw, "ssid"),
        vlan: raw.get("vlan").and_then(|v| match v {
            Value::Number(n) => n.as_i64().map(|n| n as i32),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }),
        last_seen: parse_last_seen(raw.get("lastSeen")),
        raw: raw.clone(),
        last_updated: Utc::now(),
        mac_address: mac,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[test]
    fn asset_envelope_yields_items_and_total() {
        let body = serde_json::json!({
            "Paging": { "PageIndex": 0, "PageSize": 100, "TotalRows": 2412 },
            "Items": [{ "SerialNumber": "A" }, { "SerialNumber": "B" }],
        });
        let (items, total) = parse_asset_envelope(&body);
        assert_eq!(items.len(), 2);
        assert_eq!(total, Some(2412));

        let (items, total) = parse_asset_envelope(&serde_json::json!({}));
        assert!(items.is_empty());
        assert_eq!(total, None);
    }

    #[test]
    fn directory_page_yields_devices_and_cursor() {
        let body = serde_json::json!({
            "chromeosdevices": [{ "serialNumber": "X" }],
            "nextPageToken": "tok-2",
        });
        let (devices, token) = parse_directory_page(&body);
        assert_eq!(devices.len(), 1);
        assert_eq!(token.as_deref(), Some("tok-2"));

        let (_, token) =
            parse_directory_page(&serde_json::json!({ "chromeosdevices": [] }));
        assert_eq!(token, None);
    }

    #[test]
    fn asset_transform_extracts_nested_owner_and_model() {
        let raw = serde_json::json!({
            "SerialNumber": " 5CD1234XYZ ",
            "AssetId": "a-1",
            "AssetTag": "T-100",
            "Model": { "Name": "Chromebook 11", "Category": { "Name": "Laptop" } },
            "Status": { "Name": "In Service" },
            "Owner": {
                "Email": "student@example.org",
                "FullName": "Sam Student",
                "RoleName": "Student",
                "Grade": "7",
                "SchoolIdNumber": "900123",
                "UserId": "u-9",
            },
            "Location": { "Name": "North Campus" },
            "OpenTickets": 3,
        });
        let record = transform_asset(&raw, DEFAULT_FEE_FIELD_TYPE_ID).unwrap();
        assert_eq!(record.serial_number, "5CD1234XYZ");
        assert_eq!(record.model.as_deref(), Some("Chromebook 11"));
        assert_eq!(record.model_category.as_deref(), Some("Laptop"));
        assert_eq!(record.assigned_user_email.as_deref(), Some("student@example.org"));
        assert_eq!(record.assigned_user_grade.as_deref(), Some("7"));
        assert_eq!(record.location.as_deref(), Some("North Campus"));
        assert_eq!(record.open_tickets, 3);
        assert_eq!(record.fee_balance, None);
    }

    #[test]
    fn asset_without_serial_is_a_record_error() {
        let raw = serde_json::json!({ "AssetTag": "T-404" });
        let err = transform_asset(&raw, DEFAULT_FEE_FIELD_TYPE_ID).unwrap_err();
        assert_eq!(err.identifier, "T-404");
    }

    fn asset_with_fees(entries: &str) -> Value {
        serde_json::json!({
            "SerialNumber": "SN1",
            "CustomFieldValues": [
                { "CustomFieldTypeId": "some-other-field", "Value": "ignored" },
                { "CustomFieldTypeId": DEFAULT_FEE_FIELD_TYPE_ID, "Value": entries },
            ],
        })
    }

    #[test]
    fn duplicate_fee_entries_count_once() {
        let entry = r#"{"Amount": "45.50", "Balance": "45.50", "LastActivityDate": "2026-01-10", "PastDueAmount": "10.00"}"#;
        let raw = asset_with_fees(&format!("[{entry},{entry}]"));
        let (balance, past_due) = parse_fee_data(&raw, DEFAULT_FEE_FIELD_TYPE_ID);
        assert_eq!(balance, Some(45.5));
        assert_eq!(past_due, Some(10.0));
    }

    #[test]
    fn settled_fees_and_malformed_fee_json_yield_nothing() {
        let raw = asset_with_fees(r#"[{"Amount": "20.00", "Balance": "0", "LastActivityDate": "2025-10-01"}]"#);
        assert_eq!(parse_fee_data(&raw, DEFAULT_FEE_FIELD_TYPE_ID), (None, None));

        let raw = asset_with_fees("not json at all");
        assert_eq!(parse_fee_data(&raw, DEFAULT_FEE_FIELD_TYPE_ID), (None, None));
    }

    #[test]
    fn device_transform_collects_recent_user_emails_in_order() {
        let raw = serde_json::json!({
            "serialNumber": "5CD777",
            "deviceId": "g-1",
            "orgUnitPath": "/Students/Grade7",
            "recentUsers": [
                { "type": "USER_TYPE_MANAGED", "email": "first@example.org" },
                { "type": "USER_TYPE_UNMANAGED" },
                { "type": "USER_TYPE_MANAGED", "email": "second@example.org" },
            ],
            "macAddress": "64:6E:E0:17:0F:A7",
            "lastSync": "2026-08-20T14:03:00.000Z",
        });
        let record = transform_device(&raw).unwrap();
        assert_eq!(record.recent_users, vec!["first@example.org", "second@example.org"]);
        assert_eq!(record.mac_address.as_deref(), Some("646ee0170fa7"));
        assert!(record.last_sync.is_some());
    }

    #[test]
    fn epoch_sync_timestamp_means_never() {
        let raw = serde_json::json!({
            "serialNumber": "5CD888",
            "lastSync": "1970-01-01T00:00:00.000Z",
        });
        let record = transform_device(&raw).unwrap();
        assert_eq!(record.last_sync, None);
    }

    #[test]
    fn battery_health_is_capacity_ratio_capped_at_100() {
        let raw = serde_json::json!({
            "batteryStatusReport": [{ "fullChargeCapacity": "4120" }],
            "batteryInfo": [{ "designCapacity": "5000" }],
        });
        assert_eq!(battery_health_percent(&raw), Some(82));

        let overfull = serde_json::json!({
            "batteryStatusReport": [{ "fullChargeCapacity": 5200 }],
            "batteryInfo": [{ "designCapacity": 5000 }],
        });
        assert_eq!(battery_health_percent(&overfull), Some(100));

        assert_eq!(battery_health_percent(&serde_json::json!({})), None);
    }

    #[test]
    fn wireless_networks_are_filtered_by_name() {
        let body = serde_json::json!([
            { "id": "N_1", "name": "HS Wireless" },
            { "id": "N_2", "name": "Core Switching" },
            { "id": "N_3", "name": "elementary wireless" },
        ]);
        let networks = filter_wireless_networks(&body);
        assert_eq!(
            networks.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(),
            vec!["N_1", "N_3"]
        );
    }

    #[test]
    fn client_transform_normalizes_mac_and_parses_last_seen() {
        let raw = serde_json::json!({
            "id": "k-1",
            "mac": "64:6E:E0:17:0F:A7",
            "ip": "10.20.0.15",
            "ssid": "Students",
            "vlan": "120",
            "recentDeviceName": "AP-Library-2",
            "networkId": "N_1",
            "lastSeen": 1755900000,
        });
        let record = transform_client(&raw).unwrap();
        assert_eq!(record.mac_address, "646ee0170fa7");
        assert_eq!(record.vlan, Some(120));
        assert_eq!(record.ap_name.as_deref(), Some("AP-Library-2"));
        assert_eq!(record.last_seen.map(|t| t.timestamp()), Some(1755900000));
    }

    #[test]
    fn client_without_mac_is_a_record_error() {
        let raw = serde_json::json!({ "id": "k-2", "mac": "garbage" });
        let err = transform_client(&raw).unwrap_err();
        assert_eq!(err.identifier, "k-2");
    }

    #[test]
    fn last_seen_accepts_epoch_and_rfc3339_but_not_zero() {
        assert!(parse_last_seen(Some(&Value::from(1755900000))).is_some());
        assert!(parse_last_seen(Some(&Value::from("2026-08-20T14:03:00Z"))).is_some());
        assert_eq!(parse_last_seen(Some(&Value::from(0))), None);
        assert_eq!(parse_last_seen(Some(&Value::from("1970-01-01T00:00:00Z"))), None);
        assert_eq!(parse_last_seen(None), None);
    }
}
