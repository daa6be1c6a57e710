use std::sync::Arc;

use tracing::{info, warn};

use crate::users::dto::{CreateUserRequest, UpdateUserRequest, UserResponse};
use crate::users::error::{ApiError, ApiResult};
use crate::users::password::CredentialHasher;
use crate::users::repo_types::{NewUser, UserPatch};
use crate::users::store::UserStore;

/// Orchestrates validation, uniqueness pre-checks, hashing and store
/// calls for the user endpoints. Holds no mutable state of its own;
/// both collaborators are injected so tests can swap them out.
#[derive(Clone)]
pub struct UserService {
    store: Arc<dyn UserStore>,
    hasher: Arc<dyn CredentialHasher>,
}

impl UserService {
    pub fn new(store: Arc<dyn UserStore>, hasher: Arc<dyn CredentialHasher>) -> Self {
        Self { store, hasher }
    }

    pub async fn list(&self) -> ApiResult<Vec<UserResponse>> {
        let users = self.store.list().await?;
        Ok(users.into_iter().map(UserResponse::from).collect())
    }

    pub async fn get_by_id(&self, raw_id: &str) -> ApiResult<UserResponse> {
        let id = parse_id(raw_id)?;
        let user = self
            .store
            .find_by_id(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".into()))?;
        Ok(user.into())
    }

    pub async fn create(&self, req: CreateUserRequest) -> ApiResult<UserResponse> {
        let (name, email, password) = match (
            non_empty(req.name),
            non_empty(req.email),
            non_empty(req.password),
        ) {
            (Some(name), Some(email), Some(password)) => (name, email, password),
            _ => {
                return Err(ApiError::InvalidArgument(
                    "Name, email, and password are required".into(),
                ))
            }
        };

        if !email.contains('@') {
            return Err(ApiError::InvalidArgument("Invalid email format".into()));
        }

        // Best-effort pre-check; the store's unique index remains the
        // final arbiter for racing writes.
        if self.store.find_by_email(&email).await?.is_some() {
            warn!(%email, "create rejected, email already in use");
            return Err(ApiError::Conflict("Email already in use".into()));
        }

        let password_hash = self.hasher.hash(&password)?;

        let user = self
            .store
            .create(NewUser {
                name,
                email,
                password_hash,
                // Role is stored as-is; no allow-list is enforced here.
                role: req.role,
            })
            .await?;

        info!(user_id = user.id, email = %user.email, "user created");
        Ok(user.into())
    }

    pub async fn update(&self, raw_id: &str, req: UpdateUserRequest) -> ApiResult<UserResponse> {
        let id = parse_id(raw_id)?;

        let email = match req.email {
            Some(email) => {
                if !email.contains('@') {
                    return Err(ApiError::InvalidArgument("Invalid email format".into()));
                }
                // A hit on the user's own row is not a conflict.
                if let Some(existing) = self.store.find_by_email(&email).await? {
                    if existing.id != id {
                        warn!(%email, user_id = id, "update rejected, email already in use");
                        return Err(ApiError::Conflict("Email already in use".into()));
                    }
                }
                Some(email)
            }
            None => None,
        };

        let password_hash = match req.password {
            Some(password) => {
                if password.chars().count() < 6 {
                    return Err(ApiError::InvalidArgument(
                        "Password must be at least 6 characters".into(),
                    ));
                }
                Some(self.hasher.hash(&password)?)
            }
            None => None,
        };

        let patch = UserPatch {
            name: req.name,
            email,
            password_hash,
            role: req.role,
        };

        let user = self.store.update(id, patch).await?;
        info!(user_id = user.id, "user updated");
        Ok(user.into())
    }

    pub async fn delete(&self, raw_id: &str) -> ApiResult<()> {
        let id = parse_id(raw_id)?;
        self.store.delete(id).await?;
        info!(user_id = id, "user deleted");
        Ok(())
    }
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>()
        .map_err(|_| ApiError::InvalidArgument("Invalid user id".into()))
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::users::repo_types::User;
    use crate::users::store::{MemoryUserStore, StoreResult, DEFAULT_ROLE};

    struct FakeHasher;

    impl CredentialHasher for FakeHasher {
        fn hash(&self, plain: &str) -> anyhow::Result<String> {
            Ok(format!("hashed:{plain}"))
        }
    }

    /// Store double that fails the test if any operation is reached.
    struct UnreachableStore;

    #[async_trait]
    impl UserStore for UnreachableStore {
        async fn list(&self) -> StoreResult<Vec<User>> {
            unreachable!("store must not be touched")
        }
        async fn find_by_id(&self, _id: i64) -> StoreResult<Option<User>> {
            unreachable!("store must not be touched")
        }
        async fn find_by_email(&self, _email: &str) -> StoreResult<Option<User>> {
            unreachable!("store must not be touched")
        }
        async fn create(&self, _new: NewUser) -> StoreResult<User> {
            unreachable!("store must not be touched")
        }
        async fn update(&self, _id: i64, _patch: UserPatch) -> StoreResult<User> {
            unreachable!("store must not be touched")
        }
        async fn delete(&self, _id: i64) -> StoreResult<()> {
            unreachable!("store must not be touched")
        }
    }

    fn service() -> (UserService, Arc<MemoryUserStore>) {
        let store = Arc::new(MemoryUserStore::new());
        let service = UserService::new(store.clone(), Arc::new(FakeHasher));
        (service, store)
    }

    fn unreachable_service() -> UserService {
        UserService::new(Arc::new(UnreachableStore), Arc::new(FakeHasher))
    }

    fn create_req(name: &str, email: &str, password: &str) -> CreateUserRequest {
        CreateUserRequest {
            name: Some(name.to_string()),
            email: Some(email.to_string()),
            password: Some(password.to_string()),
            role: None,
        }
    }

    #[tokio::test]
    async fn create_returns_projection_without_credential_material() {
        let (service, _) = service();

        let user = service
            .create(create_req("Alice", "alice@example.com", "p4ssword"))
            .await
            .unwrap();

        let json = serde_json::to_value(&user).unwrap();
        assert_eq!(json["name"], "Alice");
        assert_eq!(json["email"], "alice@example.com");
        assert_eq!(json["role"], DEFAULT_ROLE);
        assert!(json.get("password").is_none());
        assert!(json.get("password_hash").is_none());
    }

    #[tokio::test]
    async fn create_requires_name_email_and_password() {
        let (service, store) = service();

        let missing = CreateUserRequest {
            name: Some("Alice".to_string()),
            email: Some("alice@example.com".to_string()),
            password: None,
            role: None,
        };
        let empty = CreateUserRequest {
            name: Some("".to_string()),
            email: Some("alice@example.com".to_string()),
            password: Some("p4ssword".to_string()),
            role: None,
        };

        for req in [missing, empty] {
            match service.create(req).await {
                Err(ApiError::InvalidArgument(msg)) => {
                    assert_eq!(msg, "Name, email, and password are required")
                }
                other => panic!("expected InvalidArgument, got {other:?}"),
            }
        }
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn create_rejects_email_without_at_sign() {
        let (service, _) = service();

        match service.create(create_req("Alice", "not-an-email", "p4ssword")).await {
            Err(ApiError::InvalidArgument(msg)) => assert_eq!(msg, "Invalid email format"),
            other => panic!("expected InvalidArgument, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_stores_any_role_verbatim() {
        let (service, _) = service();

        let mut req = create_req("Alice", "alice@example.com", "p4ssword");
        req.role = Some("WIZARD".to_string());

        // No allow-list is applied to roles; this documents the
        // permissive behavior rather than endorsing it.
        let user = service.create(req).await.unwrap();
        assert_eq!(user.role, "WIZARD");
    }

    #[tokio::test]
    async fn duplicate_email_create_conflicts_without_mutation() {
        let (service, store) = service();

        service
            .create(create_req("A", "a@x.com", "p4ssword"))
            .await
            .unwrap();

        match service.create(create_req("B", "a@x.com", "other-pw")).await {
            Err(ApiError::Conflict(msg)) => assert_eq!(msg, "Email already in use"),
            other => panic!("expected Conflict, got {other:?}"),
        }

        let users = store.list().await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].name, "A");
    }

    #[tokio::test]
    async fn non_integer_ids_fail_before_the_store_is_touched() {
        let service = unreachable_service();

        for raw in ["abc", "1.5", "", "9999999999999999999999"] {
            match service.get_by_id(raw).await {
                Err(ApiError::InvalidArgument(msg)) => assert_eq!(msg, "Invalid user id"),
                other => panic!("expected InvalidArgument for {raw:?}, got {other:?}"),
            }
            match service.update(raw, UpdateUserRequest::default()).await {
                Err(ApiError::InvalidArgument(msg)) => assert_eq!(msg, "Invalid user id"),
                other => panic!("expected InvalidArgument for {raw:?}, got {other:?}"),
            }
            match service.delete(raw).await {
                Err(ApiError::InvalidArgument(msg)) => assert_eq!(msg, "Invalid user id"),
                other => panic!("expected InvalidArgument for {raw:?}, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn get_by_id_missing_user_is_not_found() {
        let (service, _) = service();

        match service.get_by_id("42").await {
            Err(ApiError::NotFound(msg)) => assert_eq!(msg, "User not found"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_with_only_name_leaves_other_fields_alone() {
        let (service, store) = service();

        let created = service
            .create(create_req("Alice", "alice@example.com", "p4ssword"))
            .await
            .unwrap();
        let before = store.find_by_id(created.id).await.unwrap().unwrap();

        let patch = UpdateUserRequest {
            name: Some("Alicia".to_string()),
            ..Default::default()
        };
        let updated = service.update(&created.id.to_string(), patch).await.unwrap();

        assert_eq!(updated.name, "Alicia");
        assert_eq!(updated.email, before.email);
        assert_eq!(updated.role, before.role);
        assert!(updated.updated_at >= before.updated_at);

        let after = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(after.password_hash, before.password_hash);
    }

    #[tokio::test]
    async fn update_rejects_short_password_and_keeps_old_hash() {
        let (service, store) = service();

        let created = service
            .create(create_req("Alice", "alice@example.com", "p4ssword"))
            .await
            .unwrap();
        let before = store.find_by_id(created.id).await.unwrap().unwrap();

        let patch = UpdateUserRequest {
            password: Some("short".to_string()),
            ..Default::default()
        };
        match service.update(&created.id.to_string(), patch).await {
            Err(ApiError::InvalidArgument(msg)) => {
                assert_eq!(msg, "Password must be at least 6 characters")
            }
            other => panic!("expected InvalidArgument, got {other:?}"),
        }

        let after = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(after.password_hash, before.password_hash);
    }

    #[tokio::test]
    async fn update_rehashes_an_acceptable_password() {
        let (service, store) = service();

        let created = service
            .create(create_req("Alice", "alice@example.com", "p4ssword"))
            .await
            .unwrap();

        let patch = UpdateUserRequest {
            password: Some("secret".to_string()),
            ..Default::default()
        };
        service.update(&created.id.to_string(), patch).await.unwrap();

        let after = store.find_by_id(created.id).await.unwrap().unwrap();
        assert_eq!(after.password_hash, "hashed:secret");
    }

    #[tokio::test]
    async fn update_conflicts_when_email_belongs_to_another_user() {
        let (service, _) = service();

        service
            .create(create_req("A", "a@x.com", "p4ssword"))
            .await
            .unwrap();
        let b = service
            .create(create_req("B", "b@x.com", "p4ssword"))
            .await
            .unwrap();

        let patch = UpdateUserRequest {
            email: Some("a@x.com".to_string()),
            ..Default::default()
        };
        match service.update(&b.id.to_string(), patch).await {
            Err(ApiError::Conflict(msg)) => assert_eq!(msg, "Email already in use"),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_to_own_email_is_not_a_conflict() {
        let (service, _) = service();

        let a = service
            .create(create_req("A", "a@x.com", "p4ssword"))
            .await
            .unwrap();

        let patch = UpdateUserRequest {
            email: Some("a@x.com".to_string()),
            ..Default::default()
        };
        let updated = service.update(&a.id.to_string(), patch).await.unwrap();
        assert_eq!(updated.email, "a@x.com");
    }

    #[tokio::test]
    async fn update_missing_user_is_not_found() {
        let (service, _) = service();

        let patch = UpdateUserRequest {
            name: Some("X".to_string()),
            ..Default::default()
        };
        match service.update("99", patch).await {
            Err(ApiError::NotFound(msg)) => assert_eq!(msg, "User not found"),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_delete_is_not_found_every_time() {
        let (service, _) = service();

        let a = service
            .create(create_req("A", "a@x.com", "p4ssword"))
            .await
            .unwrap();
        let id = a.id.to_string();

        service.delete(&id).await.unwrap();
        for _ in 0..2 {
            match service.delete(&id).await {
                Err(ApiError::NotFound(msg)) => assert_eq!(msg, "User not found"),
                other => panic!("expected NotFound, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn list_returns_users_in_ascending_id_order() {
        let (service, _) = service();

        for (name, email) in [("A", "a@x.com"), ("B", "b@x.com"), ("C", "c@x.com")] {
            service.create(create_req(name, email, "p4ssword")).await.unwrap();
        }

        let users = service.list().await.unwrap();
        let ids: Vec<i64> = users.iter().map(|u| u.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(users.len(), 3);
    }
}
