//! Session credentials for the CMS client
//!
//! Owns the access/refresh token pair, the refresh endpoint contract, and
//! the single-flight coordinator that keeps concurrent callers from
//! refreshing the same session twice. This crate has no knowledge of
//! business requests; the request pipeline consults it before and after
//! each call.
//!
//! Session flow:
//! 1. Login/registration stores a pair via `CredentialStore::set()`
//! 2. The pipeline checks `CredentialStore::is_near_expiry()` before sending
//! 3. Near expiry or a 401 calls `RefreshCoordinator::ensure_fresh()`
//! 4. The flight calls `Refresher::refresh()` once and rotates the pair
//! 5. Any refresh failure clears the store; the session is over

pub mod constants;
pub mod credentials;
pub mod error;
pub mod refresh;
pub mod token;

pub use constants::*;
pub use credentials::{
    CredentialPersistence, CredentialSet, CredentialStore, FilePersistence, Freshness,
    MemoryPersistence, now_millis,
};
pub use error::{Error, Result};
pub use refresh::RefreshCoordinator;
pub use token::{HttpRefresher, Refresher, TokenResponse, parse_token_response};
