use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const PERCENT_DEAD_ZONE: f64 = 0.1;
const PERCENT_EPSILON: f64 = 1e-9;
const RESET_DEAD_ZONE_MS: i64 = 1000;
const USAGE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub session_percentage: f64,
    pub weekly_percentage: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_reset_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_reset_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_used: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_limit: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn new(session_percentage: f64, weekly_percentage: f64) -> Self {
        Self {
            session_percentage,
            weekly_percentage,
            session_reset_at: None,
            weekly_reset_at: None,
            session_tokens: None,
            weekly_tokens: None,
            cost_used: None,
            cost_limit: None,
            updated_at: Utc::now(),
        }
    }

    /// `updated_at` is ignored.
    pub fn differs_meaningfully(&self, stored: &UsageSnapshot) -> bool {
        percent_changed(self.session_percentage, stored.session_percentage)
            || percent_changed(self.weekly_percentage, stored.weekly_percentage)
            || self.session_tokens != stored.session_tokens
            || self.weekly_tokens != stored.weekly_tokens
            || reset_changed(self.session_reset_at, stored.session_reset_at)
            || reset_changed(self.weekly_reset_at, stored.weekly_reset_at)
            || self.cost_used != stored.cost_used
            || self.cost_limit != stored.cost_limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageSlot {
    Primary,
    Secondary,
}

impl UsageSlot {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "primary" => Some(Self::Primary),
            "secondary" => Some(Self::Secondary),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        }
    }
}

pub fn needs_persist(stored: Option<&UsageSnapshot>, incoming: &UsageSnapshot) -> bool {
    match stored {
        Some(stored) => incoming.differs_meaningfully(stored),
        None => true,
    }
}

fn percent_changed(new: f64, old: f64) -> bool {
    (new - old).abs() + PERCENT_EPSILON >= PERCENT_DEAD_ZONE
}

fn reset_changed(new: Option<DateTime<Utc>>, old: Option<DateTime<Utc>>) -> bool {
    match (new, old) {
        (Some(new), Some(old)) => (new - old).num_milliseconds().abs() >= RESET_DEAD_ZONE_MS,
        (None, None) => false,
        _ => true,
    }
}

/// Fetches a usage snapshot for `(access_token, account_id)`. `None` means the
/// numbers could not be fetched; callers never retry.
pub type UsageClient = Arc<dyn Fn(&str, Option<&str>) -> Option<UsageSnapshot> + Send + Sync>;

pub fn http_usage_client(endpoint: String) -> UsageClient {
    Arc::new(move |access_token: &str, account_id: Option<&str>| {
        fetch_usage(&endpoint, access_token, account_id)
    })
}

fn fetch_usage(endpoint: &str, access_token: &str, account_id: Option<&str>) -> Option<UsageSnapshot> {
    let client = reqwest::blocking::Client::builder()
        .timeout(USAGE_TIMEOUT)
        .build()
        .ok()?;

    let mut request = client
        .get(endpoint)
        .header("Accept", "application/json")
        .header("User-Agent", concat!("cxauth/", env!("CARGO_PKG_VERSION")))
        .bearer_auth(access_token);
    if let Some(account_id) = account_id {
        request = request.header("ChatGPT-Account-Id", account_id);
    }

    let response = match request.send() {
        Ok(response) => response,
        Err(err) => {
            warn!(error = %err, "usage request failed");
            return None;
        }
    };
    if !response.status().is_success() {
        warn!(status = response.status().as_u16(), "usage endpoint returned an error");
        return None;
    }

    let root: Value = response.json().ok()?;
    let snapshot = parse_usage_response(&root);
    if snapshot.is_none() {
        debug!("usage response carried no rate limit windows");
    }
    snapshot
}

/// Maps `rate_limit.primary_window` to the session numbers and
/// `rate_limit.secondary_window` to the weekly numbers.
pub fn parse_usage_response(root: &Value) -> Option<UsageSnapshot> {
    let rate_limit = root.get("rate_limit")?;
    let primary = rate_limit.get("primary_window");
    let secondary = rate_limit.get("secondary_window");
    if primary.is_none() && secondary.is_none() {
        return None;
    }

    let percent = |window: Option<&Value>| {
        window
            .and_then(|w| w.get("used_percent"))
            .and_then(value_as_f64)
            .unwrap_or(0.0)
    };
    let reset = |window: Option<&Value>| {
        window
            .and_then(|w| w.get("reset_at"))
            .and_then(value_as_f64)
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts as i64, 0))
    };

    let mut snapshot = UsageSnapshot::new(percent(primary), percent(secondary));
    snapshot.session_reset_at = reset(primary);
    snapshot.weekly_reset_at = reset(secondary);
    Some(snapshot)
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}
