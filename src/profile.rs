use crate::usage::{UsageSlot, UsageSnapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredentials {
    pub session_key: String,
    pub organization_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    pub enabled: bool,
    pub thresholds: Vec<u8>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            thresholds: vec![75, 90, 95],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IconSettings {
    pub style: String,
    pub show_percentage: bool,
}

impl Default for IconSettings {
    fn default() -> Self {
        Self {
            style: "battery".to_string(),
            show_percentage: true,
        }
    }
}

/// Behaviour settings. Opaque to the sync core apart from being copied into
/// newly created profiles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileSettings {
    pub refresh_interval_secs: u64,
    pub auto_start_session: bool,
    pub check_overage_limit: bool,
    pub notifications: NotificationSettings,
    pub icon: IconSettings,
}

impl Default for ProfileSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 30,
            auto_start_session: false,
            check_overage_limit: true,
            notifications: NotificationSettings::default(),
            icon: IconSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_session: Option<SessionCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_session: Option<SessionCredentials>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_credentials: Option<String>,
    #[serde(default)]
    pub has_cli_account: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_usage: Option<UsageSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_usage: Option<UsageSnapshot>,
    #[serde(default)]
    pub settings: ProfileSettings,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl Profile {
    pub fn new(name: impl Into<String>, settings: ProfileSettings) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            primary_session: None,
            secondary_session: None,
            cli_credentials: None,
            has_cli_account: false,
            cli_synced_at: None,
            primary_usage: None,
            secondary_usage: None,
            settings,
            created_at: Utc::now(),
            last_used_at: None,
        }
    }

    pub fn store_cli_credentials(&mut self, blob: String) {
        self.cli_credentials = Some(blob);
        self.has_cli_account = true;
        self.cli_synced_at = Some(Utc::now());
    }

    pub fn clear_cli_credentials(&mut self) {
        self.cli_credentials = None;
        self.has_cli_account = false;
        self.cli_synced_at = None;
    }

    pub fn usage(&self, slot: UsageSlot) -> Option<&UsageSnapshot> {
        match slot {
            UsageSlot::Primary => self.primary_usage.as_ref(),
            UsageSlot::Secondary => self.secondary_usage.as_ref(),
        }
    }

    pub fn set_usage(&mut self, slot: UsageSlot, snapshot: UsageSnapshot) {
        match slot {
            UsageSlot::Primary => self.primary_usage = Some(snapshot),
            UsageSlot::Secondary => self.secondary_usage = Some(snapshot),
        }
    }

    pub fn set_session(&mut self, slot: UsageSlot, session: Option<SessionCredentials>) {
        match slot {
            UsageSlot::Primary => self.primary_session = session,
            UsageSlot::Secondary => self.secondary_session = session,
        }
    }
}
