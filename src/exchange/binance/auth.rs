//! Request signing for the Binance signed endpoints
//!
//! Binance expects an HMAC-SHA256 of the full query string, keyed with the API
//! secret and hex encoded, appended as the `signature` parameter. The API key
//! travels in the `X-MBX-APIKEY` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "X-MBX-APIKEY";

/// Hex HMAC-SHA256 of `query` keyed with `secret`
pub fn sign_query(query: &str, secret: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// API credentials container
#[derive(Clone)]
pub struct Credentials {
    api_key: String,
    api_secret: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"***")
            .field("api_secret", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }

    /// Looks for `BINANCE_API_KEY` and `BINANCE_API_SECRET`
    pub fn from_env() -> Result<Self, std::env::VarError> {
        let api_key = std::env::var("BINANCE_API_KEY")?;
        let api_secret = std::env::var("BINANCE_API_SECRET")?;
        Ok(Self::new(api_key, api_secret))
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Append `signature=` to an already-encoded query string
    pub fn signed_query(&self, query: &str) -> String {
        format!("{}&signature={}", query, sign_query(query, &self.api_secret))
    }
}
