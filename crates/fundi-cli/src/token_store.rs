//! Keychain-backed token persistence for the CLI.

#[cfg(test)]
use std::collections::HashMap;
#[cfg(test)]
use std::sync::{Mutex, OnceLock};

#[cfg(not(test))]
use keyring::Entry;

use fundi_core::auth::{TokenPair, TokenStore};
use fundi_core::{ApiError, ApiResult};

#[cfg(not(test))]
const KEYRING_SERVICE_NAME: &str = "fundi-cli";

/// Stores the serialized token pair as a single keychain credential, so the
/// four fields are always written and read together.
#[derive(Clone)]
pub struct KeyringTokenStore {
    username: String,
}

impl KeyringTokenStore {
    pub fn new(profile_name: &str) -> Self {
        Self {
            username: format!("token_pair:{profile_name}"),
        }
    }

    #[cfg(test)]
    fn test_store() -> &'static Mutex<HashMap<String, String>> {
        static STORE: OnceLock<Mutex<HashMap<String, String>>> = OnceLock::new();
        STORE.get_or_init(|| Mutex::new(HashMap::new()))
    }

    #[cfg(not(test))]
    fn entry(&self) -> ApiResult<Entry> {
        Entry::new(KEYRING_SERVICE_NAME, &self.username)
            .map_err(|error| ApiError::Storage(error.to_string()))
    }
}

impl TokenStore for KeyringTokenStore {
    #[cfg(not(test))]
    fn load(&self) -> ApiResult<Option<TokenPair>> {
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(ApiError::Storage(error.to_string())),
        }
    }

    #[cfg(test)]
    fn load(&self) -> ApiResult<Option<TokenPair>> {
        let guard = Self::test_store()
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        match guard.get(&self.username) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    #[cfg(not(test))]
    fn save(&self, pair: &TokenPair) -> ApiResult<()> {
        let raw = serde_json::to_string(pair)?;
        self.entry()?
            .set_password(&raw)
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        Ok(())
    }

    #[cfg(test)]
    fn save(&self, pair: &TokenPair) -> ApiResult<()> {
        let raw = serde_json::to_string(pair)?;
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        guard.insert(self.username.clone(), raw);
        Ok(())
    }

    #[cfg(not(test))]
    fn clear(&self) -> ApiResult<()> {
        let entry = self.entry()?;
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(ApiError::Storage(error.to_string())),
        }
    }

    #[cfg(test)]
    fn clear(&self) -> ApiResult<()> {
        let mut guard = Self::test_store()
            .lock()
            .map_err(|error| ApiError::Storage(error.to_string()))?;
        guard.remove(&self.username);
        Ok(())
    }
}
