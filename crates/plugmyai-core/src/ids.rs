//! Random tokens and identifiers.

use rand::RngCore;
use rand::rngs::OsRng;

pub const APP_TOKEN_PREFIX: &str = "pma_";
pub const ADMIN_TOKEN_PREFIX: &str = "pma_admin_";

const TOKEN_BYTES: usize = 24;
const SHORT_ID_BYTES: usize = 8;

fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// `prefix` followed by 24 random bytes, hex encoded.
pub fn generate_token(prefix: &str) -> String {
    format!("{prefix}{}", random_hex(TOKEN_BYTES))
}

pub fn app_token() -> String {
    generate_token(APP_TOKEN_PREFIX)
}

pub fn admin_token() -> String {
    generate_token(ADMIN_TOKEN_PREFIX)
}

/// 16 hex characters; used for apps, history entries and connect requests.
pub fn short_id() -> String {
    random_hex(SHORT_ID_BYTES)
}
