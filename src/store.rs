use crate::error::{SyncError, SyncResult};
use crate::profile::Profile;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

const PROFILES_FILE: &str = "profiles.json";
const ACTIVE_PROFILE_FILE: &str = "active-profile.json";
const DISPLAY_FILE: &str = "display.json";
const LOCK_FILE: &str = "store.lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    #[default]
    Single,
    Multi,
}

impl DisplayMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single" => Some(Self::Single),
            "multi" => Some(Self::Multi),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Multi => "multi",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct DisplayConfig {
    pub mode: DisplayMode,
    pub selected_profile_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveProfilePointer {
    #[serde(default)]
    profile_id: Option<String>,
}

/// Durable profile persistence under the store directory.
///
/// Every read goes to disk. Callers run load-modify-save cycles inside
/// [`ProfileStore::with_lock`] and never hold a profile list across cycles.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    root_dir: PathBuf,
}

impl ProfileStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    #[cfg(test)]
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn load_profiles(&self) -> SyncResult<Vec<Profile>> {
        Ok(self.read_json(PROFILES_FILE)?.unwrap_or_default())
    }

    pub fn save_profiles(&self, profiles: &[Profile]) -> SyncResult<()> {
        self.write_json(PROFILES_FILE, "profiles", &profiles)?;
        debug!(count = profiles.len(), "saved profiles");
        Ok(())
    }

    pub fn load_active_profile_id(&self) -> SyncResult<Option<String>> {
        let pointer: Option<ActiveProfilePointer> = self.read_json(ACTIVE_PROFILE_FILE)?;
        Ok(pointer
            .and_then(|pointer| pointer.profile_id)
            .filter(|id| !id.trim().is_empty()))
    }

    pub fn save_active_profile_id(&self, profile_id: &str) -> SyncResult<()> {
        let pointer = ActiveProfilePointer {
            profile_id: Some(profile_id.to_string()),
        };
        self.write_json(ACTIVE_PROFILE_FILE, "active profile", &pointer)
    }

    pub fn load_display_config(&self) -> SyncResult<DisplayConfig> {
        Ok(self.read_json(DISPLAY_FILE)?.unwrap_or_default())
    }

    pub fn save_display_config(&self, config: &DisplayConfig) -> SyncResult<()> {
        self.write_json(DISPLAY_FILE, "display config", config)
    }

    /// Runs `operation` holding an exclusive advisory lock on the store. The
    /// lock is not re-entrant: `operation` must not call `with_lock` again.
    pub fn with_lock<T, F>(&self, operation: F) -> SyncResult<T>
    where
        F: FnOnce() -> SyncResult<T>,
    {
        fs::create_dir_all(&self.root_dir)
            .map_err(|err| SyncError::io(format!("create {}", self.root_dir.display()), err))?;

        let lock_path = self.root_dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| SyncError::io(format!("open lock file {}", lock_path.display()), err))?;
        let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        file.lock_exclusive()
            .map_err(|err| SyncError::io(format!("acquire lock {}", lock_path.display()), err))?;

        let result = operation();
        let _ = file.unlock();
        result
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> SyncResult<Option<T>> {
        let path = self.root_dir.join(name);
        if !path.exists() {
            return Ok(None);
        }
        let data =
            fs::read(&path).map_err(|err| SyncError::io(format!("read {}", path.display()), err))?;
        serde_json::from_slice::<T>(&data)
            .map(Some)
            .map_err(|err| SyncError::MalformedJson(format!("{}: {}", name, err)))
    }

    fn write_json<T: Serialize + ?Sized>(
        &self,
        name: &str,
        what: &'static str,
        value: &T,
    ) -> SyncResult<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|source| SyncError::Encode { what, source })?;
        write_file_atomic(&self.root_dir.join(name), &data)
    }
}

/// Picks the profile the active pointer names, or the first profile when the
/// pointer is absent or stale.
pub fn resolve_active<'a>(profiles: &'a [Profile], active_id: Option<&str>) -> Option<&'a Profile> {
    active_id
        .and_then(|id| profiles.iter().find(|profile| profile.id == id))
        .or_else(|| profiles.first())
}

/// Writes `data` to a sibling temp file and renames it over `path`, leaving the
/// result readable only by the owner.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> SyncResult<()> {
    let parent = path.parent().ok_or_else(|| {
        SyncError::io(
            format!("invalid target path {}", path.display()),
            std::io::Error::from(std::io::ErrorKind::InvalidInput),
        )
    })?;
    fs::create_dir_all(parent)
        .map_err(|err| SyncError::io(format!("create {}", parent.display()), err))?;

    let mut temp_file = NamedTempFile::new_in(parent)
        .map_err(|err| SyncError::io("create temp file", err))?;
    temp_file
        .write_all(data)
        .map_err(|err| SyncError::io("write temp file", err))?;
    let _ = temp_file
        .as_file()
        .set_permissions(fs::Permissions::from_mode(0o600));

    temp_file
        .persist(path)
        .map_err(|err| SyncError::io(format!("persist {}", path.display()), err.error))?;
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));
    Ok(())
}
