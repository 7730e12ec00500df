//! Core domain model for the Atlas sync engine: sources, canonical records,
//! the job ledger state machine, schedules, notifications and conflict types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const CRATE_NAME: &str = "atlas-core";

/// Cap on structured per-record errors retained per job.
pub const ERROR_DETAIL_CAP: usize = 50;

/// Cap on stored error message length.
pub const ERROR_MESSAGE_CAP: usize = 200;

/// The three external systems of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    AssetSystem,
    DirectorySystem,
    NetworkSystem,
}

impl Source {
    pub const ALL: [Source; 3] = [
        Source::AssetSystem,
        Source::DirectorySystem,
        Source::NetworkSystem,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::AssetSystem => "asset-system",
            Source::DirectorySystem => "directory-system",
            Source::NetworkSystem => "network-system",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown source '{0}', expected asset-system, directory-system or network-system")]
pub struct UnknownSource(pub String);

impl FromStr for Source {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asset-system" => Ok(Source::AssetSystem),
            "directory-system" => Ok(Source::DirectorySystem),
            "network-system" => Ok(Source::NetworkSystem),
            other => Err(UnknownSource(other.to_string())),
        }
    }
}

/// Lifecycle state of one sync attempt.
///
/// `Running` is the only non-terminal state; every transition out of it sets
/// `completed_at` and no transition is valid from a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Success,
    Partial,
    Error,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Success => "success",
            JobState::Partial => "partial",
            JobState::Error => "error",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }

    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(self, JobState::Running) && next.is_terminal()
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobState::Running),
            "success" => Ok(JobState::Success),
            "partial" => Ok(JobState::Partial),
            "error" => Ok(JobState::Error),
            "cancelled" => Ok(JobState::Cancelled),
            other => Err(format!("unknown job state '{other}'")),
        }
    }
}

/// How a job came to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Manual,
    Scheduled,
    Cron,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Manual => "manual",
            Trigger::Scheduled => "scheduled",
            Trigger::Cron => "cron",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured per-record failure, retained (capped) on the ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub identifier: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl RecordError {
    pub fn new(identifier: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            identifier: identifier.into(),
            error: truncate_error(&error.to_string()),
            timestamp: Utc::now(),
        }
    }
}

pub fn truncate_error(msg: &str) -> String {
    if msg.len() <= ERROR_MESSAGE_CAP {
        return msg.to_string();
    }
    let mut end = ERROR_MESSAGE_CAP;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

/// One row of the job ledger: a single sync attempt for one source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub source: Source,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: i64,
    pub records_failed: i64,
    pub error_message: Option<String>,
    pub error_details: Vec<RecordError>,
    pub triggered_by: Trigger,
    pub cancel_requested: bool,
}

impl SyncJob {
    pub fn duration_seconds(&self) -> Option<f64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds() as f64 / 1000.0)
    }
}

/// Per-source schedule: an hour-of-day allow list evaluated in the engine's
/// configured timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub source: Source,
    pub enabled: bool,
    pub hours: Vec<u8>,
    pub updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("schedule hour {0} out of range, must be 0-23")]
pub struct InvalidHour(pub u8);

impl Schedule {
    pub fn disabled(source: Source) -> Self {
        Self {
            source,
            enabled: false,
            hours: Vec::new(),
            updated_at: None,
            updated_by: None,
        }
    }

    /// Validates, dedupes and sorts an hour allow list.
    pub fn normalize_hours(hours: &[u8]) -> Result<Vec<u8>, InvalidHour> {
        let mut out = Vec::with_capacity(hours.len());
        for &h in hours {
            if h > 23 {
                return Err(InvalidHour(h));
            }
            if !out.contains(&h) {
                out.push(h);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Whether a tick at the given local hour/minute should fire this
    /// schedule. Granularity is hourly: only minute 0 fires.
    pub fn is_due(&self, local_hour: u8, local_minute: u8) -> bool {
        self.enabled && local_minute == 0 && self.hours.contains(&local_hour)
    }
}

/// Unacknowledged-until-dismissed pointer at a failed or partial job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub job_id: i64,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

/// Advisory data-integrity finding from the cross-source reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    AssetTagSerialMatch,
    OwnerMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub title: String,
    pub description: String,
    pub severity: String,
}

/// Canonical record from the asset/ticketing system, keyed by serial number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub serial_number: String,
    pub external_id: Option<String>,
    pub asset_tag: Option<String>,
    pub model: Option<String>,
    pub model_category: Option<String>,
    pub status: Option<String>,
    pub mac_address: Option<String>,
    pub assigned_user_email: Option<String>,
    pub assigned_user_name: Option<String>,
    pub assigned_user_role: Option<String>,
    pub assigned_user_grade: Option<String>,
    pub assigned_user_sis_id: Option<String>,
    pub owner_external_id: Option<String>,
    pub owner_location: Option<String>,
    pub location: Option<String>,
    pub open_tickets: i64,
    pub fee_balance: Option<f64>,
    pub fee_past_due: Option<f64>,
    pub raw: Value,
    pub last_updated: DateTime<Utc>,
}

/// Canonical record from the directory/device-management system, keyed by
/// serial number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub serial_number: String,
    pub directory_id: Option<String>,
    pub org_unit: Option<String>,
    pub annotated_asset_tag: Option<String>,
    pub annotated_user: Option<String>,
    pub annotated_location: Option<String>,
    pub model: Option<String>,
    pub status: Option<String>,
    pub os_version: Option<String>,
    pub auto_update_expiration: Option<String>,
    pub boot_mode: Option<String>,
    pub battery_health_percent: Option<i32>,
    pub mac_address: Option<String>,
    pub ethernet_mac_address: Option<String>,
    /// Most-recent-first login emails as reported upstream. Upstream does not
    /// guarantee the ordering; the reconciler's owner-mismatch rule leans on
    /// the first entry anyway.
    pub recent_users: Vec<String>,
    pub last_sync: Option<DateTime<Utc>>,
    pub raw: Value,
    pub last_updated: DateTime<Utc>,
}

/// Canonical record from the network-infrastructure system, keyed by
/// normalized MAC address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkClientRecord {
    pub mac_address: String,
    pub client_id: Option<String>,
    pub network_id: Option<String>,
    pub ap_name: Option<String>,
    pub ip_address: Option<String>,
    pub ssid: Option<String>,
    pub vlan: Option<i32>,
    pub last_seen: Option<DateTime<Utc>>,
    pub raw: Value,
    pub last_updated: DateTime<Utc>,
}

/// Strips separators and lowercases a MAC address. Returns `None` unless the
/// result is exactly 12 hex digits.
pub fn normalize_mac(mac: &str) -> Option<String> {
    let cleaned: String = mac
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if cleaned.len() == 12 {
        Some(cleaned)
    } else {
        None
    }
}

/// Renders a normalized MAC as colon-separated pairs for display and for
/// upstream query parameters.
pub fn format_mac(normalized: &str) -> String {
    normalized
        .as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

/// Defensive decimal parse for numeric fields that arrive as free text.
/// Tolerates currency symbols, thousands separators and surrounding noise.
pub fn parse_decimal_field(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_round_trips_through_str() {
        for source in Source::ALL {
            assert_eq!(source.as_str().parse::<Source>().unwrap(), source);
        }
        assert!("meraki".parse::<Source>().is_err());
    }

    #[test]
    fn only_running_transitions_to_terminal_states() {
        assert!(JobState::Running.can_transition_to(JobState::Success));
        assert!(JobState::Running.can_transition_to(JobState::Partial));
        assert!(JobState::Running.can_transition_to(JobState::Error));
        assert!(JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Running.can_transition_to(JobState::Running));
        assert!(!JobState::Success.can_transition_to(JobState::Error));
        assert!(!JobState::Cancelled.can_transition_to(JobState::Success));
    }

    #[test]
    fn schedule_hours_are_validated_deduped_and_sorted() {
        assert_eq!(
            Schedule::normalize_hours(&[14, 2, 14, 2]).unwrap(),
            vec![2, 14]
        );
        assert_eq!(Schedule::normalize_hours(&[24]), Err(InvalidHour(24)));
        assert_eq!(Schedule::normalize_hours(&[]).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn schedule_fires_only_at_minute_zero_of_an_allowed_hour() {
        let schedule = Schedule {
            source: Source::AssetSystem,
            enabled: true,
            hours: vec![2, 14],
            updated_at: None,
            updated_by: None,
        };
        assert!(schedule.is_due(14, 0));
        assert!(schedule.is_due(2, 0));
        assert!(!schedule.is_due(14, 30));
        assert!(!schedule.is_due(3, 0));

        let disabled = Schedule {
            enabled: false,
            ..schedule
        };
        assert!(!disabled.is_due(14, 0));
    }

    #[test]
    fn mac_normalization_accepts_common_formats() {
        for input in ["64:6E:E0:17:0F:A7", "64-6e-e0-17-0f-a7", "646ee0170fa7"] {
            assert_eq!(normalize_mac(input).as_deref(), Some("646ee0170fa7"));
        }
        assert_eq!(normalize_mac("not-a-mac"), None);
        assert_eq!(normalize_mac("646ee0170f"), None);
    }

    #[test]
    fn mac_formatting_inserts_colons() {
        assert_eq!(format_mac("646ee0170fa7"), "64:6e:e0:17:0f:a7");
    }

    #[test]
    fn decimal_fields_parse_defensively() {
        assert_eq!(parse_decimal_field("45.50"), Some(45.5));
        assert_eq!(parse_decimal_field("$1,250.00"), Some(1250.0));
        assert_eq!(parse_decimal_field("n/a"), None);
        assert_eq!(parse_decimal_field(""), None);
    }

    #[test]
    fn record_errors_truncate_long_messages() {
        let long = "x".repeat(500);
        let err = RecordError::new("SN123", long);
        assert_eq!(err.error.len(), ERROR_MESSAGE_CAP);
        assert_eq!(err.identifier, "SN123");
    }
}
