mod cache;
mod config;
mod coordinator;
mod credentials;
mod error;
mod events;
mod logging;
mod process;
mod profile;
mod reconcile;
mod store;
mod system_store;
mod usage;

use crate::cache::CredentialCache;
use crate::config::Config;
use crate::coordinator::{ProfileCoordinator, SwitchOutcome};
use crate::credentials::{extract_access_token, token_fingerprint, AccountSummary};
use crate::error::{SyncError, SyncResult};
use crate::events::{CredentialsChanged, EventBus};
use crate::process::{default_process_runner, ProcessRunner};
use crate::profile::{Profile, SessionCredentials};
use crate::store::{DisplayMode, ProfileStore};
use crate::system_store::SystemCredentialStore;
use crate::usage::{http_usage_client, UsageClient, UsageSlot, UsageSnapshot};
use chrono::{DateTime, Utc};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const VALIDITY_WAIT_SLACK: Duration = Duration::from_secs(1);

const SESSION_USAGE: &str =
    "usage: cxauth session <profile> <primary|secondary> (<session-key> <org-id> | --clear)";

#[derive(Debug, PartialEq)]
enum CliCommand {
    Help,
    List,
    Status,
    Sync,
    Add,
    Create(String),
    Switch(String),
    Rename { profile: String, name: String },
    Delete(String),
    Forget(String),
    Apply(String),
    Session {
        profile: String,
        slot: UsageSlot,
        credentials: Option<SessionCredentials>,
    },
    Usage { json: bool },
    Display(Option<DisplayMode>),
}

impl CliCommand {
    fn parse(args: &[String]) -> SyncResult<Self> {
        let Some(first) = args.first() else {
            return Ok(Self::List);
        };
        let rest = &args[1..];

        match first.as_str() {
            "-h" | "--help" | "help" => Ok(Self::Help),
            "list" | "ls" => no_arguments(rest, "usage: cxauth list").map(|_| Self::List),
            "status" => no_arguments(rest, "usage: cxauth status").map(|_| Self::Status),
            "sync" => no_arguments(rest, "usage: cxauth sync").map(|_| Self::Sync),
            "add" => no_arguments(rest, "usage: cxauth add").map(|_| Self::Add),
            "create" => single_argument(rest, "usage: cxauth create <name>").map(Self::Create),
            "switch" => single_argument(rest, "usage: cxauth switch <profile>").map(Self::Switch),
            "delete" => single_argument(rest, "usage: cxauth delete <profile>").map(Self::Delete),
            "forget" => single_argument(rest, "usage: cxauth forget <profile>").map(Self::Forget),
            "apply" => single_argument(rest, "usage: cxauth apply <profile>").map(Self::Apply),
            "rename" => match rest {
                [profile, name] => Ok(Self::Rename {
                    profile: profile.clone(),
                    name: name.clone(),
                }),
                _ => Err(SyncError::Usage("usage: cxauth rename <profile> <name>".to_string())),
            },
            "session" => {
                let (profile, slot, tail) = match rest {
                    [profile, slot, tail @ ..] => (profile, slot, tail),
                    _ => return Err(SyncError::Usage(SESSION_USAGE.to_string())),
                };
                let slot = UsageSlot::parse(slot)
                    .ok_or_else(|| SyncError::Usage(SESSION_USAGE.to_string()))?;
                let credentials = match tail {
                    [flag] if flag == "--clear" => None,
                    [session_key, organization_id] => Some(SessionCredentials {
                        session_key: session_key.clone(),
                        organization_id: organization_id.clone(),
                    }),
                    _ => return Err(SyncError::Usage(SESSION_USAGE.to_string())),
                };
                Ok(Self::Session {
                    profile: profile.clone(),
                    slot,
                    credentials,
                })
            }
            "usage" => match rest {
                [] => Ok(Self::Usage { json: false }),
                [flag] if flag == "--json" => Ok(Self::Usage { json: true }),
                _ => Err(SyncError::Usage("usage: cxauth usage [--json]".to_string())),
            },
            "display" => match rest {
                [] => Ok(Self::Display(None)),
                [mode] => DisplayMode::parse(mode).map(|mode| Self::Display(Some(mode))).ok_or_else(|| {
                    SyncError::Usage("usage: cxauth display [single|multi]".to_string())
                }),
                _ => Err(SyncError::Usage("usage: cxauth display [single|multi]".to_string())),
            },
            _ => Err(SyncError::Usage(format!("unknown command: {}", first))),
        }
    }
}

fn no_arguments(rest: &[String], usage: &str) -> SyncResult<()> {
    if rest.is_empty() {
        Ok(())
    } else {
        Err(SyncError::Usage(usage.to_string()))
    }
}

fn single_argument(rest: &[String], usage: &str) -> SyncResult<String> {
    match rest {
        [value] => Ok(value.clone()),
        _ => Err(SyncError::Usage(usage.to_string())),
    }
}

struct CxAuthApp {
    config: Config,
    coordinator: ProfileCoordinator,
    usage_client: UsageClient,
    changes: Receiver<CredentialsChanged>,
}

impl CxAuthApp {
    fn new(config: Config, process_runner: ProcessRunner, usage_client: UsageClient) -> Self {
        let system_store = Arc::new(SystemCredentialStore::new(&config, process_runner));
        let cache = CredentialCache::new(system_store, config.cache_ttls);
        let store = ProfileStore::new(config.store_dir.clone());
        let coordinator = ProfileCoordinator::new(store, cache, Arc::new(EventBus::new()));
        let changes = coordinator.events().subscribe();
        Self {
            config,
            coordinator,
            usage_client,
            changes,
        }
    }

    fn drain_changes(&self) -> Vec<CredentialsChanged> {
        self.changes.try_iter().collect()
    }

    fn execute(&self, command: CliCommand) -> SyncResult<Vec<String>> {
        match command {
            CliCommand::Help => Ok(usage_lines()),
            CliCommand::List => self.profile_inventory_lines(),
            CliCommand::Status => self.status_report_lines(),
            CliCommand::Sync => {
                let profile_id = self.coordinator.sync_active_profile()?;
                let profile = self.coordinator.resolve_profile(&profile_id)?;
                Ok(vec![format!("Synced current Codex login into {}", profile.name)])
            }
            CliCommand::Add => {
                let added = self.coordinator.add_current_account()?;
                let verb = if added.created { "Created" } else { "Updated" };
                Ok(vec![format!("{} profile {}", verb, added.profile_name)])
            }
            CliCommand::Create(name) => {
                let profile = self.coordinator.create_profile(&name)?;
                Ok(vec![format!("Created profile {} ({})", profile.name, profile.id)])
            }
            CliCommand::Switch(selector) => {
                let target = self.coordinator.resolve_profile(&selector)?;
                let line = match self.coordinator.switch_profile(&target.id)? {
                    SwitchOutcome::Switched {
                        credentials_applied: true,
                    } => format!("Switched to {}", target.name),
                    SwitchOutcome::Switched {
                        credentials_applied: false,
                    } => format!(
                        "Switched to {} (Codex login unchanged; see {})",
                        target.name,
                        self.config.log_dir().display()
                    ),
                    SwitchOutcome::AlreadyActive => format!("{} is already active", target.name),
                    SwitchOutcome::RejectedInFlight => {
                        "Another switch is in progress; try again".to_string()
                    }
                };
                Ok(vec![line])
            }
            CliCommand::Rename { profile, name } => {
                let target = self.coordinator.resolve_profile(&profile)?;
                let name = self.coordinator.rename_profile(&target.id, &name)?;
                Ok(vec![format!("Renamed {} to {}", target.name, name)])
            }
            CliCommand::Delete(selector) => {
                let target = self.coordinator.resolve_profile(&selector)?;
                self.coordinator.delete_profile(&target.id)?;
                Ok(vec![format!("Deleted profile {}", target.name)])
            }
            CliCommand::Forget(selector) => {
                let target = self.coordinator.resolve_profile(&selector)?;
                self.coordinator.forget_cli_credentials(&target.id)?;
                Ok(vec![format!("Removed Codex credentials from {}", target.name)])
            }
            CliCommand::Apply(selector) => {
                let target = self.coordinator.resolve_profile(&selector)?;
                self.coordinator.apply_profile_credentials(&target.id)?;
                Ok(vec![format!("Applied {} credentials to the Codex login", target.name)])
            }
            CliCommand::Session {
                profile,
                slot,
                credentials,
            } => {
                let target = self.coordinator.resolve_profile(&profile)?;
                let cleared = credentials.is_none();
                self.coordinator
                    .set_session_credentials(&target.id, slot, credentials)?;
                let verb = if cleared { "Cleared" } else { "Saved" };
                Ok(vec![format!(
                    "{} {} session for {}",
                    verb,
                    slot.as_str(),
                    target.name
                )])
            }
            CliCommand::Usage { json } => self.usage_lines(json),
            CliCommand::Display(mode) => {
                let config = match mode {
                    Some(mode) => self.coordinator.set_display_mode(mode)?,
                    None => self.coordinator.display_config()?,
                };
                Ok(vec![format!("display: {}", config.mode.as_str())])
            }
        }
    }

    fn profile_inventory_lines(&self) -> SyncResult<Vec<String>> {
        let listing = self.coordinator.list_profiles()?;
        let active_id = listing.active().map(|profile| profile.id.clone());
        let cache = self.coordinator.cache();

        let mut lines = Vec::new();
        for profile in &listing.profiles {
            let marker = if Some(&profile.id) == active_id.as_ref() {
                "*"
            } else {
                " "
            };
            lines.push(format!("{} {} [{}]", marker, profile.name, profile.id));

            let summary = profile
                .cli_credentials
                .as_deref()
                .and_then(|blob| cache.account_summary(blob));
            let expiry = profile
                .cli_credentials
                .as_deref()
                .and_then(|blob| cache.token_expiry(blob));
            lines.push(format!(
                "    email: {}",
                summary
                    .as_ref()
                    .and_then(|summary| summary.email.clone())
                    .unwrap_or_else(|| "-".to_string())
            ));
            lines.push(format!("    plan: {}", plan_text(summary.as_ref())));
            lines.push(format!("    key expires: {}", format_time(expiry)));
            lines.push(format!("    cli: {}", cli_state(profile)));
            lines.push(format!(
                "    usage: {}",
                usage_text(profile.usage(UsageSlot::Primary))
            ));
        }
        Ok(lines)
    }

    fn status_report_lines(&self) -> SyncResult<Vec<String>> {
        let cache = self.coordinator.cache();
        let system = cache.system_store();
        let mut lines = Vec::new();

        lines.push(format!("Auth file: {}", system.auth_file().display()));
        match system.read_auth_file() {
            Some(blob) => push_blob_lines(&mut lines, cache, &blob),
            None => lines.push("  (no usable credential)".to_string()),
        }

        lines.push(format!("Keychain: service={}", system.keychain_service()));
        match system.read_keychain() {
            Ok(Some(raw)) => match crate::credentials::normalize_credentials(&raw) {
                Ok(blob) => push_blob_lines(&mut lines, cache, &blob),
                Err(err) => lines.push(format!("  unreadable: {}", err)),
            },
            Ok(None) => lines.push("  (no credential)".to_string()),
            Err(err) => lines.push(format!("  read failed: {}", err)),
        }

        let valid =
            cache.wait_for_validity(self.config.keychain_read_timeout + VALIDITY_WAIT_SLACK);
        lines.push(format!(
            "Current login: {}",
            if valid { "valid" } else { "missing or expired" }
        ));

        let listing = self.coordinator.list_profiles()?;
        lines.push(format!(
            "Active profile: {}",
            listing
                .active()
                .map(|profile| profile.name.clone())
                .unwrap_or_else(|| "-".to_string())
        ));
        Ok(lines)
    }

    fn usage_lines(&self, json: bool) -> SyncResult<Vec<String>> {
        let Some(report) = self.coordinator.refresh_active_usage(&self.usage_client)? else {
            return Ok(vec![
                "Usage unavailable for the active profile".to_string()
            ]);
        };
        info!(
            profile_id = %report.profile_id,
            persisted = report.persisted,
            "fetched usage"
        );

        if json {
            let rendered = serde_json::to_string_pretty(&report.snapshot).map_err(|source| {
                SyncError::Encode {
                    what: "usage snapshot",
                    source,
                }
            })?;
            return Ok(vec![rendered]);
        }

        Ok(vec![
            format!("Profile: {}", report.profile_name),
            format!(
                "  session: {:.1}% (resets {})",
                report.snapshot.session_percentage,
                format_time(report.snapshot.session_reset_at)
            ),
            format!(
                "  weekly: {:.1}% (resets {})",
                report.snapshot.weekly_percentage,
                format_time(report.snapshot.weekly_reset_at)
            ),
        ])
    }
}

fn push_blob_lines(lines: &mut Vec<String>, cache: &CredentialCache, blob: &str) {
    let summary = cache.account_summary(blob);
    lines.push(format!(
        "  token: {}",
        token_fingerprint(extract_access_token(blob).as_deref()).unwrap_or_else(|| "-".to_string())
    ));
    lines.push(format!(
        "  email: {}",
        summary
            .as_ref()
            .and_then(|summary| summary.email.clone())
            .unwrap_or_else(|| "-".to_string())
    ));
    lines.push(format!(
        "  account: {}",
        summary
            .as_ref()
            .and_then(|summary| summary.account_id.clone())
            .unwrap_or_else(|| "-".to_string())
    ));
    lines.push(format!("  plan: {}", plan_text(summary.as_ref())));
    lines.push(format!("  expires: {}", format_time(cache.token_expiry(blob))));
}

fn plan_text(summary: Option<&AccountSummary>) -> String {
    summary
        .map(|summary| summary.plan_label.clone())
        .unwrap_or_else(|| "-".to_string())
}

fn cli_state(profile: &Profile) -> String {
    if !profile.has_cli_account || profile.cli_credentials.is_none() {
        return "none".to_string();
    }
    format!("synced {}", format_time(profile.cli_synced_at))
}

fn usage_text(snapshot: Option<&UsageSnapshot>) -> String {
    match snapshot {
        Some(snapshot) => format!(
            "session {:.1}% weekly {:.1}% (updated {})",
            snapshot.session_percentage,
            snapshot.weekly_percentage,
            format_time(Some(snapshot.updated_at))
        ),
        None => "-".to_string(),
    }
}

fn format_time(value: Option<DateTime<Utc>>) -> String {
    value
        .map(|value| value.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn usage_lines() -> Vec<String> {
    [
        "cxauth - Codex auth profile manager",
        "",
        "Usage:",
        "  cxauth list                          List profiles (active marked with *)",
        "  cxauth status                        Show auth file, keychain and login state",
        "  cxauth sync                          Store the current Codex login on the active profile",
        "  cxauth add                           Store the current Codex login on a matching or new profile",
        "  cxauth create <name>                 Create an empty profile",
        "  cxauth switch <profile>              Make a profile active and load its login",
        "  cxauth rename <profile> <name>       Rename a profile",
        "  cxauth delete <profile>              Delete a profile",
        "  cxauth forget <profile>              Remove a profile's stored Codex login",
        "  cxauth apply <profile>               Write a profile's login into the keychain",
        "  cxauth session <profile> <slot> <key> <org> | --clear",
        "                                       Set or clear session credentials",
        "  cxauth usage [--json]                Fetch usage for the active profile",
        "  cxauth display [single|multi]        Show or set the display mode",
        "  cxauth help                          Show this help",
    ]
    .iter()
    .map(|line| line.to_string())
    .collect()
}

fn main() {
    if let Err(err) = run() {
        eprintln!("cxauth: {}", err);
        std::process::exit(err.exit_code());
    }
}

fn run() -> SyncResult<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = CliCommand::parse(&args)?;
    let config = Config::from_env();
    logging::init(&config);

    let process_runner: ProcessRunner = Arc::new(default_process_runner);
    let usage_client = http_usage_client(config.usage_endpoint.clone());
    let app = CxAuthApp::new(config, process_runner, usage_client);
    for line in app.execute(command)? {
        println!("{}", line);
    }
    for change in app.drain_changes() {
        debug!(profile_id = ?change.profile_id, "credentials changed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::test_support::canonical_blob;
    use crate::system_store::test_support::FakeKeychain;
    use tempfile::TempDir;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| value.to_string()).collect()
    }

    fn app_with(temp: &TempDir, keychain: &FakeKeychain) -> CxAuthApp {
        let config = Config::for_home(temp.path().to_path_buf());
        let usage_client: UsageClient =
            Arc::new(|_: &str, _: Option<&str>| Some(UsageSnapshot::new(42.0, 7.5)));
        CxAuthApp::new(config, keychain.runner(), usage_client)
    }

    #[test]
    fn parse_defaults_to_list_and_rejects_bad_arity() {
        assert_eq!(CliCommand::parse(&[]).expect("empty"), CliCommand::List);
        assert_eq!(CliCommand::parse(&args(&["ls"])).expect("ls"), CliCommand::List);
        assert_eq!(
            CliCommand::parse(&args(&["switch", "work"])).expect("switch"),
            CliCommand::Switch("work".to_string())
        );

        let err = CliCommand::parse(&args(&["switch"])).expect_err("missing profile");
        assert_eq!(err.exit_code(), 2);
        let err = CliCommand::parse(&args(&["frobnicate"])).expect_err("unknown");
        assert_eq!(err.to_string(), "unknown command: frobnicate");
    }

    #[test]
    fn parse_session_and_display_forms() {
        assert_eq!(
            CliCommand::parse(&args(&["session", "work", "secondary", "--clear"])).expect("clear"),
            CliCommand::Session {
                profile: "work".to_string(),
                slot: UsageSlot::Secondary,
                credentials: None,
            }
        );
        assert_eq!(
            CliCommand::parse(&args(&["session", "work", "primary", "sk", "org"])).expect("set"),
            CliCommand::Session {
                profile: "work".to_string(),
                slot: UsageSlot::Primary,
                credentials: Some(SessionCredentials {
                    session_key: "sk".to_string(),
                    organization_id: "org".to_string(),
                }),
            }
        );
        assert!(CliCommand::parse(&args(&["session", "work", "other", "--clear"])).is_err());
        assert_eq!(
            CliCommand::parse(&args(&["display", "multi"])).expect("display"),
            CliCommand::Display(Some(DisplayMode::Multi))
        );
        assert!(CliCommand::parse(&args(&["display", "grid"])).is_err());
        assert_eq!(
            CliCommand::parse(&args(&["usage", "--json"])).expect("usage"),
            CliCommand::Usage { json: true }
        );
    }

    #[test]
    fn list_marks_active_profile_and_shows_account() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::with_secret(&canonical_blob(
            "at-list",
            Some("acct-list"),
            Some("list@example.com"),
            Some(1_900_000_000),
        ));
        let app = app_with(&temp, &keychain);
        app.execute(CliCommand::Add).expect("add");
        app.execute(CliCommand::Switch("list@example.com".to_string()))
            .expect("switch");

        let lines = app.execute(CliCommand::List).expect("list");
        let active_line = lines
            .iter()
            .find(|line| line.starts_with("* "))
            .expect("active marker");
        assert!(active_line.contains("list@example.com"));
        assert!(lines.iter().any(|line| line == "    plan: Plus"));
        assert!(lines.iter().any(|line| line.contains("key expires: 2030-03-17")));
        assert!(lines.iter().any(|line| line.starts_with("  Default [")));
    }

    #[test]
    fn status_reports_sources_without_printing_tokens() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::with_secret(&canonical_blob(
            "at-secret-value",
            None,
            Some("status@example.com"),
            None,
        ));
        let app = app_with(&temp, &keychain);

        let lines = app.execute(CliCommand::Status).expect("status");
        let joined = lines.join("\n");
        assert!(joined.contains("(no usable credential)"));
        assert!(joined.contains("email: status@example.com"));
        assert!(joined.contains("Current login: valid"));
        assert!(joined.contains("Active profile: Default"));
        assert!(joined.contains(&format!(
            "token: {}",
            token_fingerprint(Some("at-secret-value")).expect("fingerprint")
        )));
        assert!(!joined.contains("at-secret-value"));
    }

    #[test]
    fn credential_changes_are_collected_per_command() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::with_secret(&canonical_blob("at", None, None, None));
        let app = app_with(&temp, &keychain);

        app.execute(CliCommand::List).expect("list");
        assert!(app.drain_changes().is_empty());

        app.execute(CliCommand::Sync).expect("sync");
        let changes = app.drain_changes();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].profile_id.is_some());
        assert!(app.drain_changes().is_empty());
    }

    #[test]
    fn usage_is_recorded_for_active_profile() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::with_secret(&canonical_blob("at", None, None, None));
        let app = app_with(&temp, &keychain);
        app.execute(CliCommand::Sync).expect("sync");

        let lines = app.execute(CliCommand::Usage { json: false }).expect("usage");
        assert_eq!(lines[0], "Profile: Default");
        assert!(lines[1].starts_with("  session: 42.0%"));

        let listing = app.execute(CliCommand::List).expect("list");
        assert!(listing.iter().any(|line| line.contains("session 42.0% weekly 7.5%")));
    }

    #[test]
    fn deleting_last_profile_is_reported() {
        let temp = TempDir::new().expect("temp dir");
        let keychain = FakeKeychain::default();
        let app = app_with(&temp, &keychain);
        let err = app
            .execute(CliCommand::Delete("Default".to_string()))
            .expect_err("last profile");
        assert!(matches!(err, SyncError::CannotDeleteLastProfile));
        assert_eq!(err.exit_code(), 1);
    }
}
