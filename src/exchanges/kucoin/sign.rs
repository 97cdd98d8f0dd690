use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::KucoinCredentials;

type HmacSha256 = Hmac<Sha256>;

const KEY_VERSION: &str = "3";

/// Signs KuCoin REST requests.
///
/// The passphrase KuCoin expects in the header is not the configured one but
/// its HMAC-SHA256 under the API secret, and the request signature covers
/// `timestamp + method + path`.
pub struct KcSigner {
    api_key: String,
    api_secret: String,
    signed_passphrase: String,
}

impl KcSigner {
    pub fn new(credentials: &KucoinCredentials) -> Self {
        let signed_passphrase = sign(
            credentials.api_passphrase.as_bytes(),
            credentials.api_secret.as_bytes(),
        );

        KcSigner {
            api_key: credentials.api_key.clone(),
            api_secret: credentials.api_secret.clone(),
            signed_passphrase,
        }
    }

    /// Signature headers for `plain`, the concatenation of the HTTP method
    /// and the request path including its query string.
    pub fn headers(&self, plain: &str) -> Vec<(&'static str, String)> {
        self.headers_at(current_millis(), plain)
    }

    fn headers_at(&self, timestamp_ms: u128, plain: &str) -> Vec<(&'static str, String)> {
        let timestamp = timestamp_ms.to_string();
        let signature = sign(
            format!("{timestamp}{plain}").as_bytes(),
            self.api_secret.as_bytes(),
        );

        vec![
            ("KC-API-KEY", self.api_key.clone()),
            ("KC-API-PASSPHRASE", self.signed_passphrase.clone()),
            ("KC-API-TIMESTAMP", timestamp),
            ("KC-API-SIGN", signature),
            ("KC-API-KEY-VERSION", KEY_VERSION.to_owned()),
        ]
    }
}

fn sign(plain: &[u8], key: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(plain);
    BASE64.encode(mac.finalize().into_bytes())
}

fn current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}
