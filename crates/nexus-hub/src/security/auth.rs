//! Authentication providers and the auth manager.
//!
//! Two providers ship with the hub:
//!
//! - [`PasswordProvider`] checks `{username, password}` against a salted
//!   sha256 user store and issues opaque 64-hex-char bearer tokens with an
//!   absolute expiry (default one hour).
//! - [`ApiKeyProvider`] issues `nxs_`-prefixed keys with no default expiry;
//!   the same store backs authenticate and validate.
//!
//! Failed authentication is uniform: the caller cannot tell an unknown
//! user from a wrong password. Token stores persist to per-provider JSON
//! files on every mutation; expired tokens are evicted when validation
//! discovers them.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Duration, Utc};
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::HubResult;
use crate::persist;

/// Prefix on API keys issued by the [`ApiKeyProvider`].
pub const API_KEY_PREFIX: &str = "nxs_";

/// A user profile as returned to callers; never carries the password.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    /// Username
    pub username: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Email address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Any further profile fields carried through verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    /// Create a bare profile.
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }
}

/// Credentials accepted by the providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    /// Username and password for the password provider
    Password {
        /// Username
        username: String,
        /// Password
        password: String,
    },
    /// API key for the key provider
    ApiKey {
        /// The `nxs_`-prefixed key
        api_key: String,
    },
}

/// Salted password hash: `hash = base64(sha256(password ‖ salt))`,
/// `salt = base64(16 random bytes)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordHash {
    /// Base64 digest
    pub hash: String,
    /// Base64 salt
    pub salt: String,
}

impl PasswordHash {
    /// Hash a password with a fresh random salt.
    #[must_use]
    pub fn create(password: &str) -> Self {
        let salt_bytes: [u8; 16] = rng().random();
        let salt = BASE64.encode(salt_bytes);
        let hash = Self::digest(password, &salt);
        Self { hash, salt }
    }

    /// Re-hash a candidate password with the stored salt and compare.
    #[must_use]
    pub fn verify(&self, password: &str) -> bool {
        Self::digest(password, &self.salt) == self.hash
    }

    fn digest(password: &str, salt: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(password.as_bytes());
        hasher.update(salt.as_bytes());
        BASE64.encode(hasher.finalize())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    password: PasswordHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenRecord {
    user_info: UserProfile,
    created: DateTime<Utc>,
    expiry: Option<DateTime<Utc>>,
}

impl TokenRecord {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }
}

/// An authentication backend.
pub trait AuthProvider: Send + Sync {
    /// Provider name, used to address it through the manager.
    fn name(&self) -> &str;

    /// Check credentials; `None` on any failure, with no distinction
    /// between unknown user and bad secret.
    fn authenticate(&self, credentials: &Credentials) -> Option<UserProfile>;

    /// Issue a token for an authenticated profile.
    fn generate_token(&self, profile: &UserProfile) -> HubResult<String>;

    /// Resolve a token to its profile; expired tokens are revoked on
    /// discovery and yield `None`.
    fn validate_token(&self, token: &str) -> Option<UserProfile>;

    /// Revoke a token. Returns whether the token existed.
    fn revoke_token(&self, token: &str) -> bool;
}

/// Username/password authentication with opaque bearer tokens.
pub struct PasswordProvider {
    users_file: PathBuf,
    tokens_file: PathBuf,
    token_lifetime: Duration,
    users: StdMutex<BTreeMap<String, UserRecord>>,
    tokens: StdMutex<HashMap<String, TokenRecord>>,
}

impl std::fmt::Debug for PasswordProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordProvider")
            .field("users_file", &self.users_file)
            .finish()
    }
}

impl PasswordProvider {
    /// Create a provider backed by the given user and token stores.
    pub fn new(
        users_file: PathBuf,
        tokens_file: PathBuf,
        token_lifetime_secs: u64,
    ) -> HubResult<Self> {
        let users = persist::load_json::<BTreeMap<String, UserRecord>>(&users_file)?
            .unwrap_or_default();
        let tokens = persist::load_json::<HashMap<String, TokenRecord>>(&tokens_file)?
            .unwrap_or_default();
        if !users.is_empty() {
            info!("Loaded {} user(s) from {}", users.len(), users_file.display());
        }
        Ok(Self {
            users_file,
            tokens_file,
            token_lifetime: Duration::seconds(token_lifetime_secs as i64),
            users: StdMutex::new(users),
            tokens: StdMutex::new(tokens),
        })
    }

    /// Create or replace a user.
    pub fn add_user(
        &self,
        username: &str,
        password: &str,
        name: Option<&str>,
        email: Option<&str>,
    ) -> HubResult<()> {
        let mut users = self.users.lock().expect("users mutex poisoned");
        users.insert(
            username.to_string(),
            UserRecord {
                password: PasswordHash::create(password),
                name: name.map(ToString::to_string),
                email: email.map(ToString::to_string),
                extra: Map::new(),
            },
        );
        info!("Stored user: {username}");
        persist::save_json(&self.users_file, &*users)
    }

    /// Remove a user. Existing tokens for the user are left to expire.
    pub fn remove_user(&self, username: &str) -> HubResult<bool> {
        let mut users = self.users.lock().expect("users mutex poisoned");
        if users.remove(username).is_none() {
            return Ok(false);
        }
        info!("Removed user: {username}");
        persist::save_json(&self.users_file, &*users)?;
        Ok(true)
    }

    fn profile_of(username: &str, record: &UserRecord) -> UserProfile {
        UserProfile {
            username: username.to_string(),
            name: record.name.clone(),
            email: record.email.clone(),
            extra: record.extra.clone(),
        }
    }

    fn save_tokens(&self, tokens: &HashMap<String, TokenRecord>) {
        if let Err(save_error) = persist::save_json(&self.tokens_file, tokens) {
            warn!("Failed to persist token store: {save_error}");
        }
    }
}

impl AuthProvider for PasswordProvider {
    fn name(&self) -> &str {
        "password"
    }

    fn authenticate(&self, credentials: &Credentials) -> Option<UserProfile> {
        let Credentials::Password { username, password } = credentials else {
            return None;
        };

        let users = self.users.lock().expect("users mutex poisoned");
        let record = users.get(username)?;
        if !record.password.verify(password) {
            warn!("Authentication failed for user: {username}");
            return None;
        }
        Some(Self::profile_of(username, record))
    }

    fn generate_token(&self, profile: &UserProfile) -> HubResult<String> {
        let token_bytes: [u8; 32] = rng().random();
        let token = hex::encode(token_bytes);

        let now = Utc::now();
        let mut tokens = self.tokens.lock().expect("tokens mutex poisoned");
        tokens.insert(
            token.clone(),
            TokenRecord {
                user_info: profile.clone(),
                created: now,
                expiry: Some(now + self.token_lifetime),
            },
        );
        self.save_tokens(&tokens);
        info!("Generated token for user: {}", profile.username);
        Ok(token)
    }

    fn validate_token(&self, token: &str) -> Option<UserProfile> {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().expect("tokens mutex poisoned");
        let record = tokens.get(token)?;
        if record.expired(now) {
            warn!("Token expired for user: {}", record.user_info.username);
            tokens.remove(token);
            self.save_tokens(&tokens);
            return None;
        }
        Some(record.user_info.clone())
    }

    fn revoke_token(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock().expect("tokens mutex poisoned");
        let Some(record) = tokens.remove(token) else {
            return false;
        };
        self.save_tokens(&tokens);
        info!("Revoked token for user: {}", record.user_info.username);
        true
    }
}

/// API-key authentication with `nxs_`-prefixed keys.
pub struct ApiKeyProvider {
    tokens_file: PathBuf,
    tokens: StdMutex<HashMap<String, TokenRecord>>,
}

impl std::fmt::Debug for ApiKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyProvider")
            .field("tokens_file", &self.tokens_file)
            .finish()
    }
}

impl ApiKeyProvider {
    /// Create a provider backed by the given key store.
    pub fn new(tokens_file: PathBuf) -> HubResult<Self> {
        let tokens = persist::load_json::<HashMap<String, TokenRecord>>(&tokens_file)?
            .unwrap_or_default();
        if !tokens.is_empty() {
            info!(
                "Loaded {} API key(s) from {}",
                tokens.len(),
                tokens_file.display()
            );
        }
        Ok(Self {
            tokens_file,
            tokens: StdMutex::new(tokens),
        })
    }

    fn save_tokens(&self, tokens: &HashMap<String, TokenRecord>) {
        if let Err(save_error) = persist::save_json(&self.tokens_file, tokens) {
            warn!("Failed to persist API key store: {save_error}");
        }
    }
}

impl AuthProvider for ApiKeyProvider {
    fn name(&self) -> &str {
        "token"
    }

    fn authenticate(&self, credentials: &Credentials) -> Option<UserProfile> {
        let Credentials::ApiKey { api_key } = credentials else {
            return None;
        };
        self.validate_token(api_key)
    }

    fn generate_token(&self, profile: &UserProfile) -> HubResult<String> {
        let key_bytes: [u8; 16] = rng().random();
        let api_key = format!("{API_KEY_PREFIX}{}", hex::encode(key_bytes));

        let mut tokens = self.tokens.lock().expect("tokens mutex poisoned");
        tokens.insert(
            api_key.clone(),
            TokenRecord {
                user_info: profile.clone(),
                created: Utc::now(),
                // API keys do not expire unless revoked.
                expiry: None,
            },
        );
        self.save_tokens(&tokens);
        info!("Generated API key for user: {}", profile.username);
        Ok(api_key)
    }

    fn validate_token(&self, token: &str) -> Option<UserProfile> {
        let now = Utc::now();
        let mut tokens = self.tokens.lock().expect("tokens mutex poisoned");
        let record = tokens.get(token)?;
        if record.expired(now) {
            warn!("API key expired for user: {}", record.user_info.username);
            tokens.remove(token);
            self.save_tokens(&tokens);
            return None;
        }
        Some(record.user_info.clone())
    }

    fn revoke_token(&self, token: &str) -> bool {
        let mut tokens = self.tokens.lock().expect("tokens mutex poisoned");
        let Some(record) = tokens.remove(token) else {
            return false;
        };
        self.save_tokens(&tokens);
        info!("Revoked API key for user: {}", record.user_info.username);
        true
    }
}

/// Named providers with a default; `validate_token` and `revoke_token` try
/// every provider when none is named.
#[derive(Default)]
pub struct AuthManager {
    providers: Vec<Arc<dyn AuthProvider>>,
    default_provider: Option<String>,
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.providers.iter().map(|p| p.name()).collect();
        f.debug_struct("AuthManager")
            .field("providers", &names)
            .field("default_provider", &self.default_provider)
            .finish()
    }
}

impl AuthManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider. The first registration becomes the default.
    pub fn register_provider(&mut self, provider: Arc<dyn AuthProvider>) {
        if self.default_provider.is_none() {
            self.default_provider = Some(provider.name().to_string());
        }
        info!("Registered authentication provider: {}", provider.name());
        self.providers.push(provider);
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn AuthProvider>> {
        self.providers.iter().find(|provider| provider.name() == name)
    }

    /// Authenticate with a named provider, or the default.
    #[must_use]
    pub fn authenticate(
        &self,
        credentials: &Credentials,
        provider: Option<&str>,
    ) -> Option<UserProfile> {
        let name = provider.or(self.default_provider.as_deref())?;
        let Some(provider) = self.find(name) else {
            warn!("Authentication provider not found: {name}");
            return None;
        };
        provider.authenticate(credentials)
    }

    /// Issue a token with a named provider, or the default.
    pub fn generate_token(
        &self,
        profile: &UserProfile,
        provider: Option<&str>,
    ) -> HubResult<Option<String>> {
        let Some(name) = provider.or(self.default_provider.as_deref()) else {
            return Ok(None);
        };
        let Some(provider) = self.find(name) else {
            warn!("Authentication provider not found: {name}");
            return Ok(None);
        };
        provider.generate_token(profile).map(Some)
    }

    /// Resolve a token, trying every provider when none is named.
    #[must_use]
    pub fn validate_token(&self, token: &str, provider: Option<&str>) -> Option<UserProfile> {
        if let Some(name) = provider {
            return self.find(name)?.validate_token(token);
        }
        self.providers
            .iter()
            .find_map(|provider| provider.validate_token(token))
    }

    /// Revoke a token, trying every provider when none is named.
    pub fn revoke_token(&self, token: &str, provider: Option<&str>) -> bool {
        if let Some(name) = provider {
            return self.find(name).is_some_and(|p| p.revoke_token(token));
        }
        self.providers
            .iter()
            .any(|provider| provider.revoke_token(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn password_provider(lifetime: u64) -> (PasswordProvider, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let provider = PasswordProvider::new(
            dir.path().join("users.json"),
            dir.path().join("bearer_tokens.json"),
            lifetime,
        )
        .unwrap();
        (provider, dir)
    }

    #[test]
    fn hash_round_trip() {
        let hash = PasswordHash::create("s3cret");
        assert!(hash.verify("s3cret"));
        assert!(!hash.verify("S3cret"));
        // Salt is 16 bytes, base64-encoded.
        assert_eq!(BASE64.decode(&hash.salt).unwrap().len(), 16);
    }

    #[test]
    fn authenticate_is_uniform_on_failure() {
        let (provider, _dir) = password_provider(3600);
        provider.add_user("alice", "wonder", None, None).unwrap();

        let unknown = provider.authenticate(&Credentials::Password {
            username: "bob".to_string(),
            password: "wonder".to_string(),
        });
        let wrong = provider.authenticate(&Credentials::Password {
            username: "alice".to_string(),
            password: "nope".to_string(),
        });
        assert_eq!(unknown, None);
        assert_eq!(wrong, None);

        let ok = provider
            .authenticate(&Credentials::Password {
                username: "alice".to_string(),
                password: "wonder".to_string(),
            })
            .unwrap();
        assert_eq!(ok.username, "alice");
    }

    #[test]
    fn token_lifecycle() {
        let (provider, _dir) = password_provider(3600);
        let profile = UserProfile::new("alice");

        let token = provider.generate_token(&profile).unwrap();
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));

        let resolved = provider.validate_token(&token).unwrap();
        assert_eq!(resolved.username, "alice");

        assert!(provider.revoke_token(&token));
        assert_eq!(provider.validate_token(&token), None);
        assert!(!provider.revoke_token(&token));
    }

    #[test]
    fn expired_tokens_are_evicted_on_validation() {
        let (provider, _dir) = password_provider(0);
        let token = provider.generate_token(&UserProfile::new("alice")).unwrap();

        // Zero lifetime: expired as soon as the clock moves.
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(provider.validate_token(&token), None);
        // Eviction happened; revoking again reports absence.
        assert!(!provider.revoke_token(&token));
    }

    #[test]
    fn api_keys_have_the_prefix_and_no_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ApiKeyProvider::new(dir.path().join("tokens.json")).unwrap();

        let key = provider.generate_token(&UserProfile::new("svc")).unwrap();
        assert!(key.starts_with(API_KEY_PREFIX));
        assert_eq!(key.len(), API_KEY_PREFIX.len() + 32);

        let resolved = provider
            .authenticate(&Credentials::ApiKey {
                api_key: key.clone(),
            })
            .unwrap();
        assert_eq!(resolved.username, "svc");
    }

    #[test]
    fn api_keys_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let key = {
            let provider = ApiKeyProvider::new(path.clone()).unwrap();
            provider.generate_token(&UserProfile::new("svc")).unwrap()
        };

        let provider = ApiKeyProvider::new(path).unwrap();
        assert_eq!(provider.validate_token(&key).unwrap().username, "svc");
    }

    #[test]
    fn manager_tries_all_providers_for_validation() {
        let dir = tempfile::tempdir().unwrap();
        let password = Arc::new(
            PasswordProvider::new(
                dir.path().join("users.json"),
                dir.path().join("bearer.json"),
                3600,
            )
            .unwrap(),
        );
        let api_keys = Arc::new(ApiKeyProvider::new(dir.path().join("keys.json")).unwrap());

        let mut manager = AuthManager::new();
        manager.register_provider(password.clone());
        manager.register_provider(api_keys.clone());

        let bearer = password.generate_token(&UserProfile::new("alice")).unwrap();
        let key = api_keys.generate_token(&UserProfile::new("svc")).unwrap();

        assert_eq!(manager.validate_token(&bearer, None).unwrap().username, "alice");
        assert_eq!(manager.validate_token(&key, None).unwrap().username, "svc");
        assert_eq!(manager.validate_token("bogus", None), None);

        // Named provider restricts the search.
        assert_eq!(manager.validate_token(&key, Some("password")), None);
        assert!(manager.revoke_token(&key, None));
        assert_eq!(manager.validate_token(&key, None), None);
    }
}
