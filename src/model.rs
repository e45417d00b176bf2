//! Domain model for monitors, incidents and check results
//!
//! Plain data plus the pure state transitions that the storage backends
//! apply inside their atomic update sections.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Identifier assigned to a monitor by the storage backend
pub type MonitorId = i64;

/// Identifier assigned to an incident by the storage backend
pub type IncidentId = i64;

/// Maximum latency samples kept per monitor
pub const DEFAULT_LATENCY_SAMPLES: usize = 300;

/// Request timeout applied when a new monitor does not specify one
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

pub const MIN_TIMEOUT_MS: u64 = 1_000;
pub const MAX_TIMEOUT_MS: u64 = 60_000;

const MAX_NAME_LENGTH: usize = 80;

// ============================================================================
// Monitor
// ============================================================================

/// Runtime status of a monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Up,
    Down,
    Paused,
    Unknown,
}

impl fmt::Display for MonitorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorStatus::Up => write!(f, "up"),
            MonitorStatus::Down => write!(f, "down"),
            MonitorStatus::Paused => write!(f, "paused"),
            MonitorStatus::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for MonitorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(MonitorStatus::Up),
            "down" => Ok(MonitorStatus::Down),
            "paused" => Ok(MonitorStatus::Paused),
            "unknown" => Ok(MonitorStatus::Unknown),
            other => Err(format!("unknown monitor status '{other}'")),
        }
    }
}

/// Check interval; only these three values are accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum IntervalMinutes {
    One,
    Five,
    Ten,
}

impl IntervalMinutes {
    pub fn minutes(self) -> u8 {
        match self {
            IntervalMinutes::One => 1,
            IntervalMinutes::Five => 5,
            IntervalMinutes::Ten => 10,
        }
    }

    pub fn duration(self) -> Duration {
        Duration::minutes(i64::from(self.minutes()))
    }
}

impl TryFrom<u8> for IntervalMinutes {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(IntervalMinutes::One),
            5 => Ok(IntervalMinutes::Five),
            10 => Ok(IntervalMinutes::Ten),
            other => Err(ValidationError::InvalidInterval(other)),
        }
    }
}

impl From<IntervalMinutes> for u8 {
    fn from(value: IntervalMinutes) -> Self {
        value.minutes()
    }
}

/// One entry of a monitor's latency history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub checked_at: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

/// A probed HTTP endpoint together with its rolling statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Monitor {
    pub id: MonitorId,
    pub name: String,
    pub url: String,
    pub interval: IntervalMinutes,
    pub timeout_ms: u64,

    pub status: MonitorStatus,
    pub last_checked_at: Option<DateTime<Utc>>,

    /// `None` means "never scheduled", which the scheduler treats as due
    pub next_check_at: Option<DateTime<Utc>>,
    pub last_response_time_ms: Option<u64>,
    pub last_status_code: Option<u16>,
    pub total_checks: u64,
    pub total_failures: u64,
    pub consecutive_failures: u64,
    pub uptime_percentage: f64,

    /// Oldest sample first
    pub latency_samples: VecDeque<LatencySample>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Monitor {
    /// Build a freshly created monitor (status unknown, due immediately)
    pub fn from_draft(id: MonitorId, draft: MonitorDraft, now: DateTime<Utc>) -> Self {
        Self {
            id,
            name: draft.name,
            url: draft.url,
            interval: draft.interval,
            timeout_ms: draft.timeout_ms,
            status: MonitorStatus::Unknown,
            last_checked_at: None,
            next_check_at: Some(now),
            last_response_time_ms: None,
            last_status_code: None,
            total_checks: 0,
            total_failures: 0,
            consecutive_failures: 0,
            uptime_percentage: 100.0,
            latency_samples: VecDeque::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.status == MonitorStatus::Paused
    }

    /// Whether the scheduler should pick this monitor up at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_paused() && self.next_check_at.is_none_or(|next| next <= now)
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    /// Fold one check result into the monitor's statistics
    ///
    /// Callers must not apply results to paused monitors; the storage
    /// backends filter those out before calling this.
    pub fn apply_check(&mut self, result: &CheckResult, checked_at: DateTime<Utc>, latency_cap: usize) {
        self.total_checks += 1;
        if result.success {
            self.consecutive_failures = 0;
            self.status = MonitorStatus::Up;
        } else {
            self.total_failures += 1;
            self.consecutive_failures += 1;
            self.status = MonitorStatus::Down;
        }

        self.uptime_percentage = uptime_percentage(self.total_checks, self.total_failures);
        self.last_checked_at = Some(checked_at);
        self.last_response_time_ms = result.response_time_ms;
        self.last_status_code = result.status_code;
        self.next_check_at = Some(checked_at + self.interval.duration());

        if self.name.trim().is_empty() {
            self.name = default_monitor_name(&self.url);
        }

        self.latency_samples.push_back(LatencySample {
            checked_at,
            success: result.success,
            response_time_ms: result.response_time_ms,
            status_code: result.status_code,
            error_message: result.error_message.clone(),
        });
        while self.latency_samples.len() > latency_cap {
            self.latency_samples.pop_front();
        }

        self.updated_at = checked_at;
    }

    /// Flip between paused and unknown; both directions make the monitor due now
    pub fn toggle_pause(&mut self, now: DateTime<Utc>) {
        self.status = if self.is_paused() {
            MonitorStatus::Unknown
        } else {
            MonitorStatus::Paused
        };
        self.next_check_at = Some(now);
        self.updated_at = now;
    }
}

/// Uptime rounded to two decimals, 100 for a monitor that was never checked
pub fn uptime_percentage(total_checks: u64, total_failures: u64) -> f64 {
    if total_checks == 0 {
        return 100.0;
    }

    let successes = total_checks.saturating_sub(total_failures) as f64;
    round2(successes / total_checks as f64 * 100.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Host part of the URL, or the URL itself when it does not parse
pub fn default_monitor_name(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_owned))
        .unwrap_or_else(|| url.to_string())
}

// ============================================================================
// Monitor creation input
// ============================================================================

/// Errors raised for bad monitor configuration, before any side effect
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("URL must start with http:// or https://")]
    UnsupportedScheme,

    #[error("name must be at most {} characters", MAX_NAME_LENGTH)]
    NameTooLong,

    #[error("interval must be 1, 5 or 10 minutes (got {0})")]
    InvalidInterval(u8),

    #[error("timeout must be between {min} and {max} ms (got {0})", min = MIN_TIMEOUT_MS, max = MAX_TIMEOUT_MS)]
    TimeoutOutOfRange(u64),
}

/// Unvalidated monitor configuration as submitted by a caller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewMonitor {
    pub name: Option<String>,
    pub url: String,
    pub interval_minutes: u8,
    pub timeout_ms: Option<u64>,
}

/// Validated monitor configuration, ready to be stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorDraft {
    pub name: String,
    pub url: String,
    pub interval: IntervalMinutes,
    pub timeout_ms: u64,
}

impl NewMonitor {
    pub fn validate(&self, default_timeout_ms: u64) -> Result<MonitorDraft, ValidationError> {
        let url = self.url.trim();
        let parsed = Url::parse(url).map_err(|_| ValidationError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ValidationError::UnsupportedScheme);
        }

        let name = self.name.as_deref().map(str::trim).unwrap_or_default();
        if name.chars().count() > MAX_NAME_LENGTH {
            return Err(ValidationError::NameTooLong);
        }

        let interval = IntervalMinutes::try_from(self.interval_minutes)?;

        let timeout_ms = self.timeout_ms.unwrap_or(default_timeout_ms);
        if !(MIN_TIMEOUT_MS..=MAX_TIMEOUT_MS).contains(&timeout_ms) {
            return Err(ValidationError::TimeoutOutOfRange(timeout_ms));
        }

        Ok(MonitorDraft {
            name: if name.is_empty() {
                default_monitor_name(url)
            } else {
                name.to_string()
            },
            url: url.to_string(),
            interval,
            timeout_ms,
        })
    }
}

// ============================================================================
// Check result
// ============================================================================

/// Outcome of a single probe. A failed probe is data, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub success: bool,

    /// Wall-clock time of the attempt; `None` only if it never started
    pub response_time_ms: Option<u64>,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
}

impl CheckResult {
    pub fn success(status_code: u16, response_time_ms: u64) -> Self {
        Self {
            success: true,
            response_time_ms: Some(response_time_ms),
            status_code: Some(status_code),
            error_message: None,
        }
    }

    pub fn failure(
        status_code: Option<u16>,
        response_time_ms: Option<u64>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            response_time_ms,
            status_code,
            error_message: Some(error_message.into()),
        }
    }
}

// ============================================================================
// Incident
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncidentStatus::Open => write!(f, "OPEN"),
            IncidentStatus::Resolved => write!(f, "RESOLVED"),
        }
    }
}

impl FromStr for IncidentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(IncidentStatus::Open),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            _ => Err(format!("unknown incident status '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncidentEventKind {
    Down,
    Retry,
    Recovered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentEvent {
    pub kind: IncidentEventKind,
    pub message: String,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

/// An outage of one monitor, open or resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub monitor_id: MonitorId,
    pub monitor_name: String,
    pub monitor_url: String,

    /// Latest human-readable summary
    pub message: String,
    pub status: IncidentStatus,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub last_failure_at: DateTime<Utc>,
    pub failure_count: u64,
    pub last_error: Option<String>,

    /// Append-only
    pub events: Vec<IncidentEvent>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Incident {
    pub fn is_open(&self) -> bool {
        self.status == IncidentStatus::Open
    }

    /// Record one more failure on an open incident
    pub fn push_retry(&mut self, event: IncidentEvent, last_error: Option<String>) {
        self.failure_count += 1;
        self.last_failure_at = event.timestamp;
        self.last_error = last_error;
        self.message = event.message.clone();
        self.updated_at = event.timestamp;
        self.events.push(event);
    }

    /// Transition to resolved; the caller guarantees the incident is open
    pub fn resolve(&mut self, event: IncidentEvent, message: &str) {
        self.status = IncidentStatus::Resolved;
        self.resolved_at = Some(event.timestamp);
        self.message = message.to_string();
        self.updated_at = event.timestamp;
        self.events.push(event);
    }
}

/// Data for the first failure of an outage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewIncident {
    pub monitor_id: MonitorId,
    pub monitor_name: String,
    pub monitor_url: String,
    pub last_error: Option<String>,
    pub down_event: IncidentEvent,
}

impl NewIncident {
    pub fn into_incident(self, id: IncidentId) -> Incident {
        let at = self.down_event.timestamp;
        Incident {
            id,
            monitor_id: self.monitor_id,
            monitor_name: self.monitor_name,
            monitor_url: self.monitor_url,
            message: self.down_event.message.clone(),
            status: IncidentStatus::Open,
            started_at: at,
            resolved_at: None,
            last_failure_at: at,
            failure_count: 1,
            last_error: self.last_error,
            events: vec![self.down_event],
            created_at: at,
            updated_at: at,
        }
    }
}
