//! Single owner of every profile and credential mutation.
//!
//! Each operation runs one load-modify-save cycle under an in-process mutex and
//! the store's file lock, always against what is on disk at that moment.
//! Switches are additionally guarded so at most one is in flight.

use crate::cache::CredentialCache;
use crate::credentials::{short_hash_hex, CanonicalBlob};
use crate::error::{SyncError, SyncResult};
use crate::events::{CredentialsChanged, EventBus};
use crate::profile::{Profile, ProfileSettings, SessionCredentials};
use crate::reconcile::{default_profile_name, match_existing_profile, unique_profile_name};
use crate::store::{resolve_active, DisplayConfig, DisplayMode, ProfileStore};
use crate::usage::{needs_persist, UsageClient, UsageSlot, UsageSnapshot};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const DEFAULT_PROFILE_NAME: &str = "Default";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched { credentials_applied: bool },
    AlreadyActive,
    RejectedInFlight,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddedAccount {
    pub profile_id: String,
    pub profile_name: String,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct ProfileListing {
    pub profiles: Vec<Profile>,
    pub active_id: Option<String>,
}

impl ProfileListing {
    pub fn active(&self) -> Option<&Profile> {
        resolve_active(&self.profiles, self.active_id.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct UsageReport {
    pub profile_id: String,
    pub profile_name: String,
    pub snapshot: UsageSnapshot,
    pub persisted: bool,
}

struct SwitchGuard<'a>(&'a AtomicBool);

impl Drop for SwitchGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct ProfileCoordinator {
    store: ProfileStore,
    cache: CredentialCache,
    events: Arc<EventBus>,
    mutation_lock: Mutex<()>,
    switch_in_flight: AtomicBool,
}

impl ProfileCoordinator {
    pub fn new(store: ProfileStore, cache: CredentialCache, events: Arc<EventBus>) -> Self {
        Self {
            store,
            cache,
            events,
            mutation_lock: Mutex::new(()),
            switch_in_flight: AtomicBool::new(false),
        }
    }

    pub fn cache(&self) -> &CredentialCache {
        &self.cache
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[cfg(test)]
    pub fn switch_in_flight(&self) -> bool {
        self.switch_in_flight.load(Ordering::Acquire)
    }

    /// Makes `target_id` the active profile.
    ///
    /// Steps: re-sync the outgoing profile from the system store, reload the
    /// profile set, push the incoming profile's credentials into the system
    /// store, then record last use and move the active pointer. The first and
    /// third steps are best-effort; their failures are logged and the switch
    /// still completes.
    pub fn switch_profile(&self, target_id: &str) -> SyncResult<SwitchOutcome> {
        if self
            .switch_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(target_profile = %target_id, "switch already in progress; request ignored");
            return Ok(SwitchOutcome::RejectedInFlight);
        }
        let _guard = SwitchGuard(&self.switch_in_flight);

        let outcome = self.mutate(|| self.switch_locked(target_id))?;
        if matches!(outcome, SwitchOutcome::Switched { credentials_applied: true }) {
            self.notify(Some(target_id));
        }
        Ok(outcome)
    }

    fn switch_locked(&self, target_id: &str) -> SyncResult<SwitchOutcome> {
        let profiles = self.load_seeded()?;
        if !profiles.iter().any(|profile| profile.id == target_id) {
            return Err(SyncError::ProfileNotFound(target_id.to_string()));
        }
        let active_id = self.store.load_active_profile_id()?;
        let outgoing = resolve_active(&profiles, active_id.as_deref()).cloned();

        if outgoing.as_ref().map(|profile| profile.id.as_str()) == Some(target_id) {
            debug!(profile_id = %target_id, "switch target already active");
            return Ok(SwitchOutcome::AlreadyActive);
        }

        if let Some(outgoing) = outgoing.filter(|profile| profile.cli_credentials.is_some()) {
            self.resync_outgoing(profiles, &outgoing.id);
        }

        let mut profiles = self
            .store
            .load_profiles()
            .map_err(|err| SyncError::ProfileReloadAfterSyncFailed(err.to_string()))?;
        let incoming = profiles
            .iter_mut()
            .find(|profile| profile.id == target_id)
            .ok_or_else(|| SyncError::ProfileNotFound(target_id.to_string()))?;

        let mut credentials_applied = false;
        if let Some(blob) = incoming.cli_credentials.as_deref() {
            match self.cache.write_credentials(blob) {
                Ok(()) => credentials_applied = true,
                Err(err) => warn!(
                    step = "apply_incoming",
                    profile_id = %target_id,
                    error = %err,
                    "failed to apply incoming profile credentials; continuing switch"
                ),
            }
        }

        incoming.last_used_at = Some(Utc::now());
        self.store.save_profiles(&profiles)?;
        self.store.save_active_profile_id(target_id)?;
        info!(profile_id = %target_id, credentials_applied, "switched profile");
        Ok(SwitchOutcome::Switched {
            credentials_applied,
        })
    }

    /// Best effort. The system login may belong to a different account if it
    /// changed outside this tool; it is stored on the outgoing profile anyway.
    fn resync_outgoing(&self, mut profiles: Vec<Profile>, outgoing_id: &str) {
        let blob = match self.cache.read_credentials(true) {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                warn!(step = "resync_outgoing", profile_id = %outgoing_id, "no system credentials to re-sync");
                return;
            }
            Err(err) => {
                warn!(step = "resync_outgoing", profile_id = %outgoing_id, error = %err, "failed to read system credentials");
                return;
            }
        };

        let Some(profile) = profiles.iter_mut().find(|profile| profile.id == outgoing_id) else {
            return;
        };
        debug!(profile_id = %outgoing_id, blob_fp = %short_hash_hex(blob.as_bytes()), "re-synced outgoing profile");
        profile.store_cli_credentials(blob);
        if let Err(err) = self.store.save_profiles(&profiles) {
            warn!(step = "resync_outgoing", profile_id = %outgoing_id, error = %err, "failed to save re-synced profile");
        }
    }

    pub fn sync_active_profile(&self) -> SyncResult<String> {
        let profile_id = self.mutate(|| {
            let blob = self.read_usable_system_credentials()?;
            let mut profiles = self.load_seeded()?;
            let active_id = self.store.load_active_profile_id()?;
            let target_id = resolve_active(&profiles, active_id.as_deref())
                .map(|profile| profile.id.clone())
                .ok_or_else(|| SyncError::ProfileNotFound("active profile".to_string()))?;
            if let Some(profile) = profiles.iter_mut().find(|profile| profile.id == target_id) {
                profile.store_cli_credentials(blob);
            }
            self.store.save_profiles(&profiles)?;
            info!(profile_id = %target_id, "synced active profile from system credentials");
            Ok(target_id)
        })?;
        self.notify(Some(&profile_id));
        Ok(profile_id)
    }

    /// Stores the current system credential on the profile that already holds
    /// the same account, or on a new profile named after it.
    pub fn add_current_account(&self) -> SyncResult<AddedAccount> {
        let added = self.mutate(|| {
            let blob = self.read_usable_system_credentials()?;
            let mut profiles = self.load_seeded()?;

            let matched = match_existing_profile(&blob, &profiles, |candidate| {
                self.cache.account_summary(candidate)
            });
            let added = match matched.and_then(|id| profiles.iter_mut().find(|p| p.id == id)) {
                Some(profile) => {
                    profile.store_cli_credentials(blob);
                    AddedAccount {
                        profile_id: profile.id.clone(),
                        profile_name: profile.name.clone(),
                        created: false,
                    }
                }
                None => {
                    let summary = self.cache.account_summary(&blob);
                    let name = unique_profile_name(
                        &default_profile_name(summary.as_ref()),
                        profiles.iter().map(|profile| profile.name.as_str()),
                    );
                    let mut profile = Profile::new(name, self.active_settings(&profiles)?);
                    profile.store_cli_credentials(blob);
                    let added = AddedAccount {
                        profile_id: profile.id.clone(),
                        profile_name: profile.name.clone(),
                        created: true,
                    };
                    profiles.push(profile);
                    added
                }
            };

            self.store.save_profiles(&profiles)?;
            info!(profile_id = %added.profile_id, created = added.created, "added current account");
            Ok(added)
        })?;
        self.notify(Some(&added.profile_id));
        Ok(added)
    }

    pub fn create_profile(&self, name: &str) -> SyncResult<Profile> {
        let base = validated_name(name)?;
        self.mutate(|| {
            let mut profiles = self.load_seeded()?;
            let name = unique_profile_name(
                &base,
                profiles.iter().map(|profile| profile.name.as_str()),
            );
            let profile = Profile::new(name, self.active_settings(&profiles)?);
            profiles.push(profile.clone());
            self.store.save_profiles(&profiles)?;
            info!(profile_id = %profile.id, "created profile");
            Ok(profile)
        })
    }

    pub fn rename_profile(&self, profile_id: &str, name: &str) -> SyncResult<String> {
        let base = validated_name(name)?;
        self.mutate(|| {
            let mut profiles = self.load_seeded()?;
            let name = unique_profile_name(
                &base,
                profiles
                    .iter()
                    .filter(|profile| profile.id != profile_id)
                    .map(|profile| profile.name.as_str()),
            );
            let profile = find_profile_mut(&mut profiles, profile_id)?;
            profile.name = name.clone();
            self.store.save_profiles(&profiles)?;
            Ok(name)
        })
    }

    /// Deleting the active profile moves the pointer to the first remaining
    /// profile without touching the system store.
    pub fn delete_profile(&self, profile_id: &str) -> SyncResult<()> {
        self.mutate(|| {
            let mut profiles = self.load_seeded()?;
            let index = profiles
                .iter()
                .position(|profile| profile.id == profile_id)
                .ok_or_else(|| SyncError::ProfileNotFound(profile_id.to_string()))?;
            if profiles.len() <= 1 {
                return Err(SyncError::CannotDeleteLastProfile);
            }

            let active_id = self.store.load_active_profile_id()?;
            let was_active = resolve_active(&profiles, active_id.as_deref())
                .is_some_and(|profile| profile.id == profile_id);
            profiles.remove(index);
            self.store.save_profiles(&profiles)?;

            if was_active {
                if let Some(first) = profiles.first() {
                    self.store.save_active_profile_id(&first.id)?;
                }
            }

            let mut display = self.store.load_display_config()?;
            let before = display.selected_profile_ids.len();
            display.selected_profile_ids.retain(|id| id != profile_id);
            if display.selected_profile_ids.len() != before {
                self.store.save_display_config(&display)?;
            }
            info!(profile_id = %profile_id, was_active, "deleted profile");
            Ok(())
        })
    }

    pub fn forget_cli_credentials(&self, profile_id: &str) -> SyncResult<()> {
        self.mutate(|| {
            let mut profiles = self.load_seeded()?;
            let profile = find_profile_mut(&mut profiles, profile_id)?;
            if profile.cli_credentials.is_none() {
                return Err(SyncError::ProfileHasNoCliCredential(profile.name.clone()));
            }
            profile.clear_cli_credentials();
            self.store.save_profiles(&profiles)
        })?;
        self.notify(Some(profile_id));
        Ok(())
    }

    /// Writes a profile's stored credential into the system store. Unlike the
    /// same step inside a switch, failures surface.
    pub fn apply_profile_credentials(&self, profile_id: &str) -> SyncResult<()> {
        self.mutate(|| {
            let profiles = self.load_seeded()?;
            let profile = profiles
                .iter()
                .find(|profile| profile.id == profile_id)
                .ok_or_else(|| SyncError::ProfileNotFound(profile_id.to_string()))?;
            let blob = profile
                .cli_credentials
                .as_deref()
                .ok_or_else(|| SyncError::ProfileHasNoCliCredential(profile.name.clone()))?;
            self.cache.write_credentials(blob)?;
            info!(profile_id = %profile_id, "applied profile credentials to system store");
            Ok(())
        })?;
        self.notify(Some(profile_id));
        Ok(())
    }

    pub fn set_session_credentials(
        &self,
        profile_id: &str,
        slot: UsageSlot,
        session: Option<SessionCredentials>,
    ) -> SyncResult<()> {
        if let Some(session) = session.as_ref() {
            if session.session_key.trim().is_empty() || session.organization_id.trim().is_empty() {
                return Err(SyncError::Usage(
                    "session key and organization id must not be empty".to_string(),
                ));
            }
        }
        self.mutate(|| {
            let mut profiles = self.load_seeded()?;
            find_profile_mut(&mut profiles, profile_id)?.set_session(slot, session);
            self.store.save_profiles(&profiles)
        })?;
        self.notify(Some(profile_id));
        Ok(())
    }

    /// Stores `snapshot` unless it is within the dead-zone of the stored one.
    /// Returns whether anything was written.
    pub fn record_usage(
        &self,
        profile_id: &str,
        slot: UsageSlot,
        snapshot: UsageSnapshot,
    ) -> SyncResult<bool> {
        self.mutate(|| {
            let mut profiles = self.load_seeded()?;
            let profile = find_profile_mut(&mut profiles, profile_id)?;
            if !needs_persist(profile.usage(slot), &snapshot) {
                debug!(profile_id = %profile_id, slot = slot.as_str(), "usage unchanged; skipping write");
                return Ok(false);
            }
            profile.set_usage(slot, snapshot);
            self.store.save_profiles(&profiles)?;
            Ok(true)
        })
    }

    /// Fetches usage for the active profile's stored credential and records it
    /// in the primary slot. `Ok(None)` when there is nothing to fetch with or
    /// the fetch failed.
    pub fn refresh_active_usage(&self, client: &UsageClient) -> SyncResult<Option<UsageReport>> {
        let listing = self.list_profiles()?;
        let Some(active) = listing.active() else {
            return Ok(None);
        };
        let Some(parsed) = active
            .cli_credentials
            .as_deref()
            .and_then(CanonicalBlob::parse)
        else {
            return Ok(None);
        };

        let account_id = parsed.account_id();
        let Some(snapshot) = client(&parsed.oauth.access_token, account_id.as_deref()) else {
            return Ok(None);
        };
        let persisted = self.record_usage(&active.id, UsageSlot::Primary, snapshot.clone())?;
        Ok(Some(UsageReport {
            profile_id: active.id.clone(),
            profile_name: active.name.clone(),
            snapshot,
            persisted,
        }))
    }

    pub fn list_profiles(&self) -> SyncResult<ProfileListing> {
        self.mutate(|| {
            let profiles = self.load_seeded()?;
            let active_id = self.store.load_active_profile_id()?;
            Ok(ProfileListing {
                profiles,
                active_id,
            })
        })
    }

    pub fn resolve_profile(&self, selector: &str) -> SyncResult<Profile> {
        let profiles = self.list_profiles()?.profiles;
        profiles
            .iter()
            .find(|profile| profile.id == selector)
            .or_else(|| profiles.iter().find(|profile| profile.name == selector))
            .cloned()
            .ok_or_else(|| SyncError::ProfileNotFound(selector.to_string()))
    }

    pub fn display_config(&self) -> SyncResult<DisplayConfig> {
        self.mutate(|| self.store.load_display_config())
    }

    pub fn set_display_mode(&self, mode: DisplayMode) -> SyncResult<DisplayConfig> {
        self.mutate(|| {
            let profiles = self.load_seeded()?;
            let mut config = self.store.load_display_config()?;
            config.mode = mode;
            config
                .selected_profile_ids
                .retain(|id| profiles.iter().any(|profile| &profile.id == id));
            self.store.save_display_config(&config)?;
            Ok(config)
        })
    }

    fn mutate<T, F>(&self, operation: F) -> SyncResult<T>
    where
        F: FnOnce() -> SyncResult<T>,
    {
        let _serialized = self.lock_mutations();
        self.store.with_lock(operation)
    }

    fn lock_mutations(&self) -> MutexGuard<'_, ()> {
        self.mutation_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Loads the profile set, creating the first-run default profile when it
    /// is empty. Must run inside [`Self::mutate`].
    fn load_seeded(&self) -> SyncResult<Vec<Profile>> {
        let profiles = self.store.load_profiles()?;
        if !profiles.is_empty() {
            return Ok(profiles);
        }
        let profile = Profile::new(DEFAULT_PROFILE_NAME, ProfileSettings::default());
        let profiles = vec![profile];
        self.store.save_profiles(&profiles)?;
        self.store.save_active_profile_id(&profiles[0].id)?;
        info!(profile_id = %profiles[0].id, "created default profile");
        Ok(profiles)
    }

    fn active_settings(&self, profiles: &[Profile]) -> SyncResult<ProfileSettings> {
        let active_id = self.store.load_active_profile_id()?;
        Ok(resolve_active(profiles, active_id.as_deref())
            .map(|profile| profile.settings.clone())
            .unwrap_or_default())
    }

    fn read_usable_system_credentials(&self) -> SyncResult<String> {
        let blob = self
            .cache
            .read_credentials(true)?
            .ok_or(SyncError::NoCredentialsFound)?;
        let parsed = CanonicalBlob::parse(&blob).ok_or_else(|| {
            SyncError::MalformedJson("system credential has no access token".to_string())
        })?;
        if !parsed.is_usable_at(Utc::now()) {
            return Err(SyncError::CurrentLoginExpired);
        }
        Ok(blob)
    }

    fn notify(&self, profile_id: Option<&str>) {
        self.events.broadcast(CredentialsChanged {
            profile_id: profile_id.map(str::to_string),
        });
    }
}

fn validated_name(raw: &str) -> SyncResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(SyncError::InvalidProfileName(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

fn find_profile_mut<'a>(profiles: &'a mut [Profile], profile_id: &str) -> SyncResult<&'a mut Profile> {
    profiles
        .iter_mut()
        .find(|profile| profile.id == profile_id)
        .ok_or_else(|| SyncError::ProfileNotFound(profile_id.to_string()))
}
