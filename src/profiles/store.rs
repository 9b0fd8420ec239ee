use super::bindings::SessionBindings;
use super::error::ProfileError;
use crate::shared::clock::{Clock, SystemClock};
use crate::shared::fs_atomic::{
    atomic_write_file_with_mode, create_dir_all_with_mode, PRIVATE_FILE_MODE, STATE_DIR_MODE,
};
use crate::shared::ids::{IdGenerator, ProfileId, RandomIds};
use crate::shared::logging::Logger;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const PROFILE_FILE_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: ProfileId,
    pub display_name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_used_at: i64,
    #[serde(default)]
    pub serialized_state: Vec<u8>,
}

/// Disk-backed profile registry plus in-memory session bindings.
///
/// One mutex serialises every operation, disk I/O included.
pub struct ProfileStore {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    logger: Logger,
    state: Mutex<SessionBindings>,
}

impl std::fmt::Debug for ProfileStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileStore").field("dir", &self.dir).finish()
    }
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            clock: Arc::new(SystemClock),
            ids: Arc::new(RandomIds),
            logger: Logger::disabled(),
            state: Mutex::new(SessionBindings::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = logger;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Profiles ordered by last use, newest first.
    pub fn list(&self) -> Result<Vec<Profile>, ProfileError> {
        let _guard = self.lock();
        self.list_locked()
    }

    pub fn get(&self, profile_id: &str) -> Result<Profile, ProfileError> {
        let _guard = self.lock();
        self.load_locked(&parse_id(profile_id)?)
    }

    pub fn create(&self, display_name: &str) -> Result<Profile, ProfileError> {
        let _guard = self.lock();
        let existing = self.list_locked()?.len();
        let raw_id = self
            .ids
            .next_id("prof")
            .map_err(ProfileError::IdGeneration)?;
        let id = ProfileId::parse(&raw_id).map_err(ProfileError::IdGeneration)?;
        let now = self.clock.now_millis();
        let profile = Profile {
            id,
            display_name: resolve_display_name(display_name, existing),
            created_at: now,
            updated_at: now,
            last_used_at: now,
            serialized_state: Vec::new(),
        };
        self.write_locked(&profile)?;
        self.logger.info(
            "profiles.created",
            format!("profile={} name={}", profile.id, profile.display_name),
        );
        Ok(profile)
    }

    pub fn rename(&self, profile_id: &str, display_name: &str) -> Result<Profile, ProfileError> {
        let _guard = self.lock();
        let mut profile = self.load_locked(&parse_id(profile_id)?)?;
        let existing = self.list_locked()?.len();
        // the renamed profile already counts toward `existing`
        profile.display_name = resolve_display_name(display_name, existing.saturating_sub(1));
        profile.updated_at = self.clock.now_millis();
        self.write_locked(&profile)?;
        Ok(profile)
    }

    /// Removes the profile file and every session bound to it.
    pub fn delete(&self, profile_id: &str) -> Result<(), ProfileError> {
        let mut bindings = self.lock();
        let id = parse_id(profile_id)?;
        let path = self.profile_path(&id);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ProfileError::NotFound {
                    profile_id: id.to_string(),
                });
            }
            Err(source) => {
                return Err(ProfileError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        }
        let cleared = bindings.clear_for_profile(id.as_str());
        self.logger.info(
            "profiles.deleted",
            format!("profile={id} cleared_bindings={cleared}"),
        );
        Ok(())
    }

    /// Stores `state` when non-empty and marks the profile used now.
    pub fn save_state(&self, profile_id: &str, state: &[u8]) -> Result<Profile, ProfileError> {
        let _guard = self.lock();
        let mut profile = self.load_locked(&parse_id(profile_id)?)?;
        if !state.is_empty() {
            profile.serialized_state = state.to_vec();
        }
        self.mark_used(&mut profile)?;
        self.write_locked(&profile)?;
        Ok(profile)
    }

    pub fn touch(&self, profile_id: &str) -> Result<Profile, ProfileError> {
        let _guard = self.lock();
        let mut profile = self.load_locked(&parse_id(profile_id)?)?;
        self.mark_used(&mut profile)?;
        self.write_locked(&profile)?;
        Ok(profile)
    }

    pub fn most_recent(&self) -> Result<Option<Profile>, ProfileError> {
        Ok(self.list()?.into_iter().next())
    }

    pub fn set_active(&self, session_id: &str, profile_id: &str) {
        self.lock().set(session_id, profile_id);
    }

    pub fn get_active(&self, session_id: &str) -> String {
        self.lock().get(session_id)
    }

    pub fn clear_active(&self, session_id: &str) -> String {
        self.lock().clear(session_id)
    }

    pub fn clear_for_profile(&self, profile_id: &str) -> usize {
        self.lock().clear_for_profile(profile_id)
    }

    fn lock(&self) -> MutexGuard<'_, SessionBindings> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stamps the profile as used, strictly after every other profile's last
    /// use so it lists first even within the same millisecond.
    fn mark_used(&self, profile: &mut Profile) -> Result<(), ProfileError> {
        let newest_other = self
            .list_locked()?
            .into_iter()
            .filter(|other| other.id != profile.id)
            .map(|other| other.last_used_at)
            .max();
        let mut now = self.clock.now_millis().max(profile.created_at);
        if let Some(newest) = newest_other {
            now = now.max(newest.saturating_add(1));
        }
        profile.last_used_at = now;
        profile.updated_at = now;
        Ok(())
    }

    fn ensure_dir(&self) -> Result<(), ProfileError> {
        create_dir_all_with_mode(&self.dir, STATE_DIR_MODE).map_err(|source| ProfileError::Io {
            path: self.dir.display().to_string(),
            source,
        })
    }

    fn profile_path(&self, id: &ProfileId) -> PathBuf {
        self.dir
            .join(format!("{}.{PROFILE_FILE_EXTENSION}", id.as_str()))
    }

    fn list_locked(&self) -> Result<Vec<Profile>, ProfileError> {
        self.ensure_dir()?;
        let entries = fs::read_dir(&self.dir).map_err(|source| ProfileError::Io {
            path: self.dir.display().to_string(),
            source,
        })?;

        let mut profiles = Vec::new();
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    self.logger
                        .warn("profiles.list.skipped", format!("unreadable entry: {err}"));
                    continue;
                }
            };
            if !path.is_file()
                || path.extension().and_then(|ext| ext.to_str()) != Some(PROFILE_FILE_EXTENSION)
            {
                continue;
            }
            match read_profile(&path) {
                Ok(profile) => profiles.push(profile),
                Err(err) => self
                    .logger
                    .warn("profiles.list.skipped", format!("{}: {err}", path.display())),
            }
        }
        profiles.sort_by(compare_recency);
        Ok(profiles)
    }

    fn load_locked(&self, id: &ProfileId) -> Result<Profile, ProfileError> {
        self.ensure_dir()?;
        let path = self.profile_path(id);
        if !path.is_file() {
            return Err(ProfileError::NotFound {
                profile_id: id.to_string(),
            });
        }
        read_profile(&path)
    }

    fn write_locked(&self, profile: &Profile) -> Result<(), ProfileError> {
        self.ensure_dir()?;
        let path = self.profile_path(&profile.id);
        let body = serde_json::to_vec_pretty(profile).map_err(|source| ProfileError::Json {
            path: path.display().to_string(),
            source,
        })?;
        atomic_write_file_with_mode(&path, &body, Some(PRIVATE_FILE_MODE)).map_err(|source| {
            ProfileError::Io {
                path: path.display().to_string(),
                source,
            }
        })
    }
}

fn read_profile(path: &Path) -> Result<Profile, ProfileError> {
    let raw = fs::read(path).map_err(|source| ProfileError::Io {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_slice(&raw).map_err(|source| ProfileError::Json {
        path: path.display().to_string(),
        source,
    })
}

fn parse_id(raw: &str) -> Result<ProfileId, ProfileError> {
    ProfileId::parse(raw.trim()).map_err(ProfileError::InvalidArgument)
}

fn resolve_display_name(requested: &str, existing: usize) -> String {
    let trimmed = requested.trim();
    if trimmed.is_empty() {
        format!("Session {}", existing + 1)
    } else {
        trimmed.to_string()
    }
}

fn compare_recency(left: &Profile, right: &Profile) -> Ordering {
    right
        .last_used_at
        .cmp(&left.last_used_at)
        .then_with(|| right.created_at.cmp(&left.created_at))
        .then_with(|| left.id.cmp(&right.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::clock::ManualClock;
    use crate::shared::ids::SequentialIds;

    fn store(dir: &Path) -> (ProfileStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = ProfileStore::new(dir.join("profiles"))
            .with_clock(clock.clone())
            .with_ids(Arc::new(SequentialIds::new()));
        (store, clock)
    }

    #[test]
    fn blank_names_count_existing_profiles() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, _) = store(dir.path());
        assert_eq!(store.create("  ").expect("create").display_name, "Session 1");
        assert_eq!(store.create("Work").expect("create").display_name, "Work");
        assert_eq!(store.create("").expect("create").display_name, "Session 3");
    }

    #[test]
    fn rename_falls_back_to_session_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, clock) = store(dir.path());
        let profile = store.create("Work").expect("create");
        clock.advance_millis(5);
        let renamed = store.rename(profile.id.as_str(), " ").expect("rename");
        assert_eq!(renamed.display_name, "Session 1");
        assert_eq!(renamed.updated_at, 1_005);
        assert_eq!(renamed.last_used_at, profile.last_used_at);
    }

    #[cfg(unix)]
    #[test]
    fn files_are_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, _) = store(dir.path());
        let profile = store.create("").expect("create");
        let path = store.dir().join(format!("{}.json", profile.id));
        let mode = fs::metadata(&path).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn record_uses_camel_case_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, _) = store(dir.path());
        let profile = store.create("x").expect("create");
        let raw = fs::read_to_string(store.dir().join(format!("{}.json", profile.id)))
            .expect("read");
        assert!(raw.contains("\"displayName\""));
        assert!(raw.contains("\"lastUsedAt\""));
    }
}
