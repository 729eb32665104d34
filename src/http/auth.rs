// Bearer-session tokens (spec §6). A token is a base64url payload and an
// HMAC-SHA256 tag over it, keyed by the process-wide token secret — no
// server-side session store to clean up.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

const CLOCK_SKEW_TOLERANCE_S: i64 = 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub subject: String,
    pub verified: bool,
    pub device_id: String,
    pub expires_at: i64,
}

pub fn issue(secret: &[u8; 32], claims: &TokenClaims) -> String {
    let payload = serde_json::to_vec(claims).expect("claims always serialize");
    let encoded_payload = URL_SAFE_NO_PAD.encode(&payload);
    let tag = sign(secret, encoded_payload.as_bytes());
    format!("{encoded_payload}.{tag}")
}

pub fn verify(secret: &[u8; 32], token: &str) -> Result<TokenClaims, AppError> {
    let (encoded_payload, tag) = token.split_once('.').ok_or(AppError::Unauthorized)?;
    if sign(secret, encoded_payload.as_bytes()) != tag {
        return Err(AppError::Unauthorized);
    }
    let payload = URL_SAFE_NO_PAD.decode(encoded_payload).map_err(|_| AppError::Unauthorized)?;
    let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| AppError::Unauthorized)?;
    if Utc::now().timestamp() > claims.expires_at + CLOCK_SKEW_TOLERANCE_S {
        return Err(AppError::Unauthorized);
    }
    Ok(claims)
}

fn sign(secret: &[u8; 32], message: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("hmac key accepts any length");
    mac.update(message);
    crate::digest::hex_encode(&mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(expires_at: i64) -> TokenClaims {
        TokenClaims { subject: "0xabc".into(), verified: true, device_id: "d1".into(), expires_at }
    }

    #[test]
    fn issued_token_verifies() {
        let secret = [7u8; 32];
        let token = issue(&secret, &claims(Utc::now().timestamp() + 3600));
        let verified = verify(&secret, &token).expect("should verify");
        assert_eq!(verified.subject, "0xabc");
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let secret = [7u8; 32];
        let token = issue(&secret, &claims(Utc::now().timestamp() + 3600));
        let (_, tag) = token.split_once('.').unwrap();
        let forged = format!("{}.{tag}", URL_SAFE_NO_PAD.encode(b"{\"subject\":\"0xevil\"}"));
        assert!(verify(&secret, &forged).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let secret = [7u8; 32];
        let token = issue(&secret, &claims(Utc::now().timestamp() - 3600));
        assert!(verify(&secret, &token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let token = issue(&[7u8; 32], &claims(Utc::now().timestamp() + 3600));
        assert!(verify(&[8u8; 32], &token).is_err());
    }
}
