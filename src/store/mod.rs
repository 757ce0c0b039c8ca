//! JSON file persistence for user balances and the OAuth credential record.
//! One file per concern under the configured data directory; a startup backup
//! copies the whole directory aside before the bot starts mutating it.

use crate::model::{Credentials, PointsKind, UserData};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const USERS_FILE: &str = "users.json";
const AUTH_FILE: &str = "auth/trovo.json";

pub struct Store {
    data_dir: PathBuf,
    users: Vec<UserData>,
}

impl Store {
    /// Open the store, loading any persisted users. A missing users file is
    /// normal on first run; a present but undecodable one is an error rather
    /// than something to silently overwrite.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(StoreError::Io)?;

        let users_path = data_dir.join(USERS_FILE);
        let users = match fs::read_to_string(&users_path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(StoreError::Json)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %users_path.display(), "users file not found, starting empty");
                Vec::new()
            }
            Err(err) => return Err(StoreError::Io(err)),
        };

        Ok(Self { data_dir, users })
    }

    pub fn users(&self) -> &[UserData] {
        &self.users
    }

    pub fn user_named(&self, name: &str) -> Option<&UserData> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Resolve a user by display name, falling back to the platform id, and
    /// creating a fresh record on first sight.
    pub fn find_user(&mut self, name: &str, trovo_id: i64) -> UserData {
        let idx = self.find_or_create(name, trovo_id);
        self.users[idx].clone()
    }

    /// Credit (or debit, for negative amounts) one currency balance. Every
    /// mutation is written through to disk before returning.
    pub fn add_points(
        &mut self,
        name: &str,
        trovo_id: i64,
        amount: i64,
        kind: PointsKind,
    ) -> Result<UserData, StoreError> {
        let idx = self.find_or_create(name, trovo_id);
        {
            let user = &mut self.users[idx];
            match kind {
                PointsKind::Mana => user.mana = user.mana.saturating_add(amount),
                PointsKind::Elixir => user.elixir = user.elixir.saturating_add(amount),
            }
            tracing::info!(
                user = %user.name,
                amount,
                kind = kind.label(),
                total = user.balance(kind),
                "points added"
            );
        }
        self.save_users()?;
        Ok(self.users[idx].clone())
    }

    fn find_or_create(&mut self, name: &str, trovo_id: i64) -> usize {
        if let Some(i) = self.users.iter().position(|u| u.name == name) {
            return i;
        }
        if trovo_id > 0 {
            if let Some(i) = self.users.iter().position(|u| u.trovo_id == trovo_id) {
                return i;
            }
        }
        let id = if trovo_id > 0 { trovo_id } else { -1 };
        self.users.push(UserData::new(name, id));
        self.users.len() - 1
    }

    fn save_users(&self) -> Result<(), StoreError> {
        let data = serde_json::to_string_pretty(&self.users).map_err(StoreError::Json)?;
        fs::write(self.data_dir.join(USERS_FILE), data).map_err(StoreError::Io)
    }

    pub fn load_credentials(&self) -> Result<Credentials, StoreError> {
        let path = self.data_dir.join(AUTH_FILE);
        match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).map_err(StoreError::Json),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "credential file not found");
                Ok(Credentials::default())
            }
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    pub fn save_credentials(&self, creds: &Credentials) -> Result<(), StoreError> {
        let path = self.data_dir.join(AUTH_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(StoreError::Io)?;
        }
        let data = serde_json::to_string_pretty(creds).map_err(StoreError::Json)?;
        fs::write(path, data).map_err(StoreError::Io)
    }

    /// Copy the data directory into a timestamped sibling backup directory.
    pub fn backup(&self) -> Result<PathBuf, StoreError> {
        let parent = self.data_dir.parent().unwrap_or_else(|| Path::new("."));
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let target = parent.join("backups").join(format!("backup_{ts}"));
        copy_tree(&self.data_dir, &target).map_err(StoreError::Io)?;
        tracing::info!(path = %target.display(), "data backup created");
        Ok(target)
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &to)?;
        } else {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Json(serde_json::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "store io error: {err}"),
            Self::Json(err) => write!(f, "store decode error: {err}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_on_empty_dir_starts_with_no_users() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data")).unwrap();
        assert!(store.users().is_empty());
    }

    #[test]
    fn add_points_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");

        let mut store = Store::open(&data).unwrap();
        let user = store.add_points("viewer", 42, 30, PointsKind::Mana).unwrap();
        assert_eq!(user.mana, 30);
        assert_eq!(user.trovo_id, 42);

        let store = Store::open(&data).unwrap();
        let user = store.user_named("viewer").unwrap();
        assert_eq!(user.mana, 30);
        assert_eq!(user.elixir, 0);
    }

    #[test]
    fn find_user_matches_name_before_id_and_creates_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path().join("data")).unwrap();

        store.add_points("alice", 7, 10, PointsKind::Elixir).unwrap();

        // same name, different id: name wins
        let by_name = store.find_user("alice", 99);
        assert_eq!(by_name.trovo_id, 7);

        // renamed user found through the platform id
        let by_id = store.find_user("alice_renamed", 7);
        assert_eq!(by_id.elixir, 10);

        // unknown in both dimensions: fresh record
        let fresh = store.find_user("bob", 0);
        assert_eq!(fresh.mana, 0);
        assert_eq!(fresh.trovo_id, -1);
    }

    #[test]
    fn saturating_credit_cannot_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path().join("data")).unwrap();
        store
            .add_points("whale", 1, i64::MAX, PointsKind::Mana)
            .unwrap();
        let user = store.add_points("whale", 1, i64::MAX, PointsKind::Mana).unwrap();
        assert_eq!(user.mana, i64::MAX);
    }

    #[test]
    fn credentials_round_trip_and_default_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("data")).unwrap();

        assert!(store.load_credentials().unwrap().is_empty());

        let creds = Credentials {
            access_token: Some("acc".to_string()),
            refresh_token: Some("ref".to_string()),
        };
        store.save_credentials(&creds).unwrap();
        let loaded = store.load_credentials().unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("acc"));
        assert_eq!(loaded.refresh_token.as_deref(), Some("ref"));
    }

    #[test]
    fn backup_copies_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let mut store = Store::open(&data).unwrap();
        store.add_points("viewer", 1, 5, PointsKind::Mana).unwrap();
        store
            .save_credentials(&Credentials {
                access_token: Some("acc".to_string()),
                refresh_token: None,
            })
            .unwrap();

        let target = store.backup().unwrap();
        assert!(target.join(USERS_FILE).exists());
        assert!(target.join(AUTH_FILE).exists());
    }
}
