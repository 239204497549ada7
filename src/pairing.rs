use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Serialize;

/// Pairing code TTL.
const CODE_TTL_MINUTES: i64 = 10;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingChallenge {
    pub code: String,
    pub expires_at: DateTime<Utc>,
    pub instructions: String,
}

#[derive(Debug)]
struct PendingCode {
    code: String,
    expires_at: DateTime<Utc>,
}

/// Volatile origin → code map. Codes are single use and consumed only by a
/// successful confirm; expired entries are ignored and swept on access.
#[derive(Default)]
pub struct PairingManager {
    pending: Mutex<HashMap<String, PendingCode>>,
}

impl PairingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin pairing for `origin`, replacing any outstanding code.
    pub fn start(&self, origin: &str) -> PairingChallenge {
        let mut bytes = [0u8; 4];
        OsRng.fill_bytes(&mut bytes);
        let code = hex::encode(bytes);
        let expires_at = Utc::now() + Duration::minutes(CODE_TTL_MINUTES);

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(
            origin.to_string(),
            PendingCode {
                code: code.clone(),
                expires_at,
            },
        );

        PairingChallenge {
            code,
            expires_at,
            instructions: "Enter this code in the application that requested pairing.".to_string(),
        }
    }

    /// Consume the code for `origin`. Returns false when the code is
    /// absent, expired, or does not match; the code survives a mismatch
    /// and is deleted on success.
    pub fn confirm(&self, origin: &str, code: &str) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        pending.retain(|_, entry| entry.expires_at > now);

        match pending.get(origin) {
            Some(entry) if entry.code == code => {
                pending.remove(origin);
                true
            }
            _ => false,
        }
    }
}
