use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::users::repo_types::{NewUser, User, UserPatch};

pub const DEFAULT_ROLE: &str = "CUSTOMER";

/// Failures a store implementation can signal. `NotFound` and
/// `DuplicateEmail` are distinguishable so the service can map them to
/// 404/409 without sniffing backend-specific error codes.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found")]
    NotFound,

    #[error("email already in use")]
    DuplicateEmail,

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence contract for users. The store is the sole source of
/// truth; its unique index on email is the final arbiter for
/// conflicting concurrent writes.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// All users, ordered by ascending id.
    async fn list(&self) -> StoreResult<Vec<User>>;

    async fn find_by_id(&self, id: i64) -> StoreResult<Option<User>>;

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;

    async fn create(&self, new: NewUser) -> StoreResult<User>;

    /// Apply a patch to an existing row. Fails with `NotFound` if the
    /// id does not exist.
    async fn update(&self, id: i64, patch: UserPatch) -> StoreResult<User>;

    /// Fails with `NotFound` if the id does not exist.
    async fn delete(&self, id: i64) -> StoreResult<()>;
}

/// In-memory implementation of `UserStore` (for development/testing).
#[derive(Debug, Default, Clone)]
pub struct MemoryUserStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    users: BTreeMap<i64, User>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn list(&self) -> StoreResult<Vec<User>> {
        let inner = self.inner.read().await;
        // BTreeMap iterates in key order, which is id order.
        Ok(inner.users.values().cloned().collect())
    }

    async fn find_by_id(&self, id: i64) -> StoreResult<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let inner = self.inner.read().await;
        Ok(inner.users.values().find(|u| u.email == email).cloned())
    }

    async fn create(&self, new: NewUser) -> StoreResult<User> {
        let mut inner = self.inner.write().await;

        if inner.users.values().any(|u| u.email == new.email) {
            return Err(StoreError::DuplicateEmail);
        }

        inner.next_id += 1;
        let now = OffsetDateTime::now_utc();
        let user = User {
            id: inner.next_id,
            name: new.name,
            email: new.email,
            password_hash: new.password_hash,
            role: new.role.unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            created_at: now,
            updated_at: now,
        };
        inner.users.insert(user.id, user.clone());

        tracing::debug!(user_id = user.id, "created user in memory store");
        Ok(user)
    }

    async fn update(&self, id: i64, patch: UserPatch) -> StoreResult<User> {
        let mut inner = self.inner.write().await;

        if !inner.users.contains_key(&id) {
            return Err(StoreError::NotFound);
        }
        if let Some(ref email) = patch.email {
            if inner.users.values().any(|u| u.id != id && u.email == *email) {
                return Err(StoreError::DuplicateEmail);
            }
        }

        let user = inner.users.get_mut(&id).ok_or(StoreError::NotFound)?;
        if let Some(name) = patch.name {
            user.name = name;
        }
        if let Some(email) = patch.email {
            user.email = email;
        }
        if let Some(password_hash) = patch.password_hash {
            user.password_hash = password_hash;
        }
        if let Some(role) = patch.role {
            user.role = role;
        }
        user.updated_at = OffsetDateTime::now_utc();

        Ok(user.clone())
    }

    async fn delete(&self, id: i64) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .users
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}
