//! Login Codes
//!
//! A client logs in over HTTP with a name and receives a one-time code. The
//! code is redeemed once when the stream connection is upgraded. Names map to
//! stable identities for the lifetime of the process.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Login configuration.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    /// How long a code stays valid.
    pub code_ttl: Duration,
    /// Longest accepted name, in characters.
    pub max_name_len: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            code_ttl: Duration::from_secs(5 * 60),
            max_name_len: 32,
        }
    }
}

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Empty or missing name.
    #[error("name is required")]
    MissingName,
    /// Name longer than allowed.
    #[error("name longer than {0} characters")]
    NameTooLong(usize),
    /// Empty or missing code.
    #[error("code is required")]
    MissingCode,
    /// Code never issued or already used.
    #[error("invalid code")]
    InvalidCode,
    /// Code outlived its TTL.
    #[error("code expired")]
    Expired,
}

#[derive(Debug)]
struct PendingCode {
    user: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Users {
    by_name: BTreeMap<String, Uuid>,
    by_id: BTreeMap<Uuid, String>,
}

/// In-memory users and one-time codes.
#[derive(Debug, Default)]
pub struct LoginStore {
    config: AuthConfig,
    users: Mutex<Users>,
    codes: Mutex<BTreeMap<String, PendingCode>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LoginStore {
    /// Create a store.
    pub fn new(config: AuthConfig) -> Self {
        Self {
            config,
            users: Mutex::new(Users::default()),
            codes: Mutex::new(BTreeMap::new()),
        }
    }

    /// Identity for `name`, created on first use.
    pub fn get_or_create_user(&self, name: &str) -> Uuid {
        let mut users = lock(&self.users);
        if let Some(id) = users.by_name.get(name) {
            return *id;
        }

        let id = Uuid::new_v4();
        users.by_name.insert(name.to_string(), id);
        users.by_id.insert(id, name.to_string());
        debug!("Created user {} as {}", name, id);
        id
    }

    /// Name registered for `id`.
    pub fn name_of(&self, id: &Uuid) -> Option<String> {
        lock(&self.users).by_id.get(id).cloned()
    }

    /// Resolve `name` and issue a code for it.
    pub fn login(&self, name: &str) -> Result<(Uuid, String), AuthError> {
        self.login_at(name, Instant::now())
    }

    /// [`LoginStore::login`] with an explicit clock.
    pub fn login_at(&self, name: &str, now: Instant) -> Result<(Uuid, String), AuthError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AuthError::MissingName);
        }
        if name.chars().count() > self.config.max_name_len {
            return Err(AuthError::NameTooLong(self.config.max_name_len));
        }

        let user = self.get_or_create_user(name);
        let code = Uuid::new_v4().simple().to_string();
        lock(&self.codes).insert(
            code.clone(),
            PendingCode {
                user,
                expires_at: now + self.config.code_ttl,
            },
        );
        Ok((user, code))
    }

    /// Consume a code. A code works once, even if it was expired.
    pub fn redeem(&self, code: &str) -> Result<Uuid, AuthError> {
        self.redeem_at(code, Instant::now())
    }

    /// [`LoginStore::redeem`] with an explicit clock.
    pub fn redeem_at(&self, code: &str, now: Instant) -> Result<Uuid, AuthError> {
        if code.is_empty() {
            return Err(AuthError::MissingCode);
        }

        let pending = lock(&self.codes).remove(code).ok_or(AuthError::InvalidCode)?;
        if now > pending.expires_at {
            return Err(AuthError::Expired);
        }
        Ok(pending.user)
    }

    /// Drop expired codes. Returns how many were removed.
    pub fn prune_expired(&self, now: Instant) -> usize {
        let mut codes = lock(&self.codes);
        let before = codes.len();
        codes.retain(|_, pending| pending.expires_at >= now);
        before - codes.len()
    }

    /// Codes not yet redeemed or pruned.
    pub fn pending_codes(&self) -> usize {
        lock(&self.codes).len()
    }
}
