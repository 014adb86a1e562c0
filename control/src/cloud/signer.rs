//! TC3-HMAC-SHA256 request signing
//!
//! Tencent Cloud API v3 signature: a canonical request is hashed into a
//! string-to-sign, which is signed with a key derived from the secret key,
//! the UTC date and the service name.

use ring::{digest, hmac};

pub const ALGORITHM: &str = "TC3-HMAC-SHA256";
pub const CONTENT_TYPE: &str = "application/json; charset=utf-8";
const SIGNED_HEADERS: &str = "content-type;host";

/// API credential (secret id + secret key)
#[derive(Clone)]
pub struct Credential {
    pub secret_id: String,
    secret_key: String,
}

impl Credential {
    pub fn new(secret_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
        }
    }
}

// Keep the secret key out of debug logs
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Inputs for signing one POST request
#[derive(Debug, Clone, Copy)]
pub struct SigningRequest<'a> {
    pub service: &'a str,
    pub host: &'a str,
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// UTC date of `timestamp`, formatted `YYYY-MM-DD`
    pub date: &'a str,
    pub payload: &'a str,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA256, data))
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let key = hmac::Key::new(hmac::HMAC_SHA256, key);
    hmac::sign(&key, data).as_ref().to_vec()
}

fn canonical_request(req: &SigningRequest<'_>) -> String {
    format!(
        "POST\n/\n\ncontent-type:{}\nhost:{}\n\n{}\n{}",
        CONTENT_TYPE,
        req.host,
        SIGNED_HEADERS,
        sha256_hex(req.payload.as_bytes())
    )
}

fn credential_scope(req: &SigningRequest<'_>) -> String {
    format!("{}/{}/tc3_request", req.date, req.service)
}

fn string_to_sign(req: &SigningRequest<'_>) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        req.timestamp,
        credential_scope(req),
        sha256_hex(canonical_request(req).as_bytes())
    )
}

/// Hex signature of `req`
pub fn signature(credential: &Credential, req: &SigningRequest<'_>) -> String {
    let secret_date = hmac_sha256(
        format!("TC3{}", credential.secret_key).as_bytes(),
        req.date.as_bytes(),
    );
    let secret_service = hmac_sha256(&secret_date, req.service.as_bytes());
    let secret_signing = hmac_sha256(&secret_service, b"tc3_request");

    hex::encode(hmac_sha256(&secret_signing, string_to_sign(req).as_bytes()))
}

/// Value of the `Authorization` header for `req`
pub fn authorization(credential: &Credential, req: &SigningRequest<'_>) -> String {
    format!(
        "{} Credential={}/{}, SignedHeaders={}, Signature={}",
        ALGORITHM,
        credential.secret_id,
        credential_scope(req),
        SIGNED_HEADERS,
        signature(credential, req)
    )
}
