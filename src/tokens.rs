use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::config::write_json_atomic;

const TOKENS_FILE: &str = "tokens.json";
const TOKEN_BYTES: usize = 32;
const SALT_BYTES: usize = 16;
const HASH_BYTES: usize = 32;

/// Cost parameters for the at-rest hash: N=2^15, r=8, p=1.
fn scrypt_params() -> scrypt::Params {
    scrypt::Params::new(15, 8, 1, HASH_BYTES).expect("static scrypt params are valid")
}

/// One record per origin. The plaintext token is never stored; only the
/// salted scrypt hash is at rest.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenRecord {
    pub origin: String,
    pub token_hash: String,
    pub salt: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    entries: Vec<TokenRecord>,
}

/// Persistent per-origin bearer token store backed by `tokens.json`.
pub struct TokenStore {
    path: PathBuf,
    inner: Mutex<TokenFile>,
}

impl TokenStore {
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let path = dir.join(TOKENS_FILE);
        let file = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parsing {}", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => TokenFile::default(),
            Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
        };
        Ok(Self {
            path,
            inner: Mutex::new(file),
        })
    }

    /// Issue a fresh token for `origin`, replacing any prior record. The
    /// record is persisted before the plaintext is returned; the plaintext
    /// is returned exactly once.
    pub fn issue(&self, origin: &str, ttl_days: i64) -> anyhow::Result<(String, DateTime<Utc>)> {
        let mut token_bytes = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut token_bytes);
        let plaintext = URL_SAFE_NO_PAD.encode(token_bytes);

        let mut salt = [0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);
        let hash = derive_hash(plaintext.as_bytes(), &salt)?;

        let now = Utc::now();
        let expires_at = now + Duration::days(ttl_days);
        let record = TokenRecord {
            origin: origin.to_string(),
            token_hash: URL_SAFE_NO_PAD.encode(hash),
            salt: URL_SAFE_NO_PAD.encode(salt),
            created_at: now,
            expires_at,
        };

        let mut file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        file.entries.retain(|entry| entry.origin != origin);
        file.entries.push(record);
        write_json_atomic(&self.path, &*file)?;

        Ok((plaintext, expires_at))
    }

    /// Constant-time verification of a presented token. Failure never
    /// distinguishes a wrong token from a missing or expired one.
    pub fn verify(&self, origin: &str, presented: &str) -> bool {
        let record = match self.get_active(origin) {
            Some(record) => record,
            None => return false,
        };

        let Ok(salt) = URL_SAFE_NO_PAD.decode(&record.salt) else {
            return false;
        };
        let Ok(stored) = URL_SAFE_NO_PAD.decode(&record.token_hash) else {
            return false;
        };
        let Ok(derived) = derive_hash(presented.as_bytes(), &salt) else {
            return false;
        };
        if stored.len() != derived.len() {
            return false;
        }

        stored.ct_eq(&derived).into()
    }

    /// Current unexpired record for `origin`, pruning expired entries.
    pub fn get_active(&self, origin: &str) -> Option<TokenRecord> {
        let mut file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        file.entries.retain(|entry| entry.expires_at > now);
        file.entries
            .iter()
            .find(|entry| entry.origin == origin)
            .cloned()
    }

    pub fn revoke(&self, origin: &str) -> anyhow::Result<bool> {
        let mut file = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let before = file.entries.len();
        file.entries.retain(|entry| entry.origin != origin);
        let removed = file.entries.len() != before;
        if removed {
            write_json_atomic(&self.path, &*file)?;
        }
        Ok(removed)
    }
}

fn derive_hash(token: &[u8], salt: &[u8]) -> anyhow::Result<[u8; HASH_BYTES]> {
    let mut out = [0u8; HASH_BYTES];
    scrypt::scrypt(token, salt, &scrypt_params(), &mut out)
        .map_err(|err| anyhow::anyhow!("deriving token hash: {err}"))?;
    Ok(out)
}
