//! User accounts and bearer-token sessions.
//!
//! Passwords are stored as salted, iterated SHA-256 digests; sessions are
//! random URL-safe tokens stored server-side, presented as
//! `Authorization: Bearer <token>` and checked on every identify call.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::clog;
use crate::store::{SqliteStore, StoreError, UserRow};

const SALT_BYTES: usize = 16;
const TOKEN_BYTES: usize = 32;
const HASH_ITERATIONS: u32 = 100_000;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum AuthError {
    /// Unknown user, wrong password, or unknown/expired token.
    InvalidCredentials,
    UsernameTaken(String),
    Store(StoreError),
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "invalid credentials"),
            AuthError::UsernameTaken(name) => write!(f, "username already taken: {name}"),
            AuthError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        AuthError::Store(e)
    }
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

fn hash_password(password: &str, salt: &[u8]) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt)
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..HASH_ITERATIONS {
        digest = Sha256::digest(digest);
    }
    URL_SAFE_NO_PAD.encode(digest)
}

fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_BYTES];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

/// Register a new user. Returns the new user id.
pub fn signup(store: &SqliteStore, username: &str, password: &str) -> Result<i64, AuthError> {
    if store.get_user(username)?.is_some() {
        return Err(AuthError::UsernameTaken(username.to_string()));
    }
    let salt = generate_salt();
    let hash = hash_password(password, &salt);
    let user_id = store.insert_user(username, &URL_SAFE_NO_PAD.encode(&salt), &hash)?;
    clog!("auth: registered user {username} (id {user_id})");
    Ok(user_id)
}

/// Verify credentials and mint a session token.
pub fn signin(store: &SqliteStore, username: &str, password: &str) -> Result<String, AuthError> {
    let Some(user) = store.get_user(username)? else {
        clog!("auth: signin rejected for unknown user {username}");
        return Err(AuthError::InvalidCredentials);
    };
    let salt = URL_SAFE_NO_PAD
        .decode(&user.password_salt)
        .map_err(|_| AuthError::InvalidCredentials)?;
    if hash_password(password, &salt) != user.password_hash {
        clog!("auth: signin rejected for {username}: wrong password");
        return Err(AuthError::InvalidCredentials);
    }
    let token = generate_token();
    store.insert_session(&token, user.id)?;
    clog!("auth: user {username} signed in");
    Ok(token)
}

/// Resolve a bearer token to its user.
pub fn authenticate(store: &SqliteStore, token: &str) -> Result<UserRow, AuthError> {
    let Some(session) = store.get_session(token)? else {
        return Err(AuthError::InvalidCredentials);
    };
    store
        .get_user_by_id(session.user_id)?
        .ok_or(AuthError::InvalidCredentials)
}

/// Revoke a session token. Succeeds whether or not the token existed.
pub fn logout(store: &SqliteStore, token: &str) -> Result<(), AuthError> {
    store.delete_session(token)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    #[test]
    fn test_hash_is_salted() {
        let salt_a = generate_salt();
        let salt_b = generate_salt();
        assert_ne!(hash_password("hunter22", &salt_a), hash_password("hunter22", &salt_b));
        assert_eq!(hash_password("hunter22", &salt_a), hash_password("hunter22", &salt_a));
    }

    #[test]
    fn test_signup_signin_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        signup(&store, "doc", "hunter22hunter22").unwrap();
        let token = signin(&store, "doc", "hunter22hunter22").unwrap();
        let user = authenticate(&store, &token).unwrap();
        assert_eq!(user.username, "doc");
    }

    #[test]
    fn test_signin_wrong_password_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        signup(&store, "doc", "hunter22hunter22").unwrap();
        assert!(matches!(
            signin(&store, "doc", "wrong-password"),
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[test]
    fn test_duplicate_signup_rejected() {
        let store = SqliteStore::open_in_memory().unwrap();
        signup(&store, "doc", "hunter22hunter22").unwrap();
        assert!(matches!(
            signup(&store, "doc", "other-password"),
            Err(AuthError::UsernameTaken(_))
        ));
    }

    #[test]
    fn test_logout_revokes_token() {
        let store = SqliteStore::open_in_memory().unwrap();
        signup(&store, "doc", "hunter22hunter22").unwrap();
        let token = signin(&store, "doc", "hunter22hunter22").unwrap();
        logout(&store, &token).unwrap();
        assert!(matches!(
            authenticate(&store, &token),
            Err(AuthError::InvalidCredentials)
        ));
    }
}
