//! Bearer token identity.
//!
//! Tokens are `base64url(claims JSON) "." base64url(HMAC-SHA512(claims part))`,
//! keyed by `token_key`. Login and registration live outside this service;
//! the `issue-token` binary mints tokens for operators and tests.

use hmac::Mac;
use log::debug;
use serde::{Deserialize, Serialize};

type HmacSha512 = hmac::Hmac<sha2::Sha512>;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Claims {
    pub sub: uuid::Uuid,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: uuid::Uuid,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
    #[error("invalid token key")]
    Key,
}

impl Claims {
    pub fn new(user_id: uuid::Uuid, email: String, name: Option<String>, ttl: chrono::Duration) -> Self {
        Self {
            sub: user_id,
            email,
            name,
            exp: (chrono::Utc::now() + ttl).timestamp(),
        }
    }
}

impl User {
    /// Name shown to signers in notifications, falling back to the email address.
    pub fn display_name(&self) -> &str {
        self.name.as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(&self.email)
    }
}

impl From<Claims> for User {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.sub,
            email: claims.email,
            name: claims.name,
        }
    }
}

fn mac_for(key: &[u8], payload: &str) -> Result<HmacSha512, TokenError> {
    let mut mac = HmacSha512::new_from_slice(key).map_err(|_| TokenError::Key)?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

pub fn issue_token(claims: &Claims, key: &[u8]) -> Result<String, TokenError> {
    let claims_json = serde_json::to_vec(claims).map_err(|_| TokenError::Malformed)?;
    let payload = base64::encode_config(claims_json, base64::URL_SAFE_NO_PAD);
    let mac = mac_for(key, &payload)?;
    let code_bytes = base64::encode_config(mac.finalize().into_bytes(), base64::URL_SAFE_NO_PAD);

    Ok(format!("{}.{}", payload, code_bytes))
}

pub fn verify_token(token: &str, key: &[u8]) -> Result<Claims, TokenError> {
    let (payload, code) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let code_bytes = match base64::decode_config(code, base64::URL_SAFE_NO_PAD) {
        Ok(c) => c,
        Err(_) => return Err(TokenError::Malformed)
    };

    if mac_for(key, payload)?.verify_slice(&code_bytes).is_err() {
        return Err(TokenError::BadSignature);
    }

    let claims_json = match base64::decode_config(payload, base64::URL_SAFE_NO_PAD) {
        Ok(c) => c,
        Err(_) => return Err(TokenError::Malformed)
    };
    let claims: Claims = match serde_json::from_slice(&claims_json) {
        Ok(c) => c,
        Err(_) => return Err(TokenError::Malformed)
    };

    if claims.exp < chrono::Utc::now().timestamp() {
        return Err(TokenError::Expired);
    }

    Ok(claims)
}

#[rocket::async_trait]
impl<'r> rocket::request::FromRequest<'r> for User {
    type Error = TokenError;

    async fn from_request(request: &'r rocket::Request<'_>) -> rocket::request::Outcome<Self, Self::Error> {
        let config = match request.guard::<&rocket::State<crate::Config>>().await {
            rocket::request::Outcome::Success(c) => c,
            rocket::request::Outcome::Forward(f) => return rocket::request::Outcome::Forward(f),
            rocket::request::Outcome::Error(_) => return rocket::request::Outcome::Error((rocket::http::Status::InternalServerError, TokenError::Key)),
        };

        let token = match request.headers().get_one("Authorization").and_then(|h| h.strip_prefix("Bearer ")) {
            Some(t) => t.trim(),
            None => return rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, TokenError::Missing))
        };

        match verify_token(token, &config.token_key) {
            Ok(claims) => rocket::request::Outcome::Success(claims.into()),
            Err(err) => {
                debug!("Rejecting bearer token: {}", err);
                rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, err))
            }
        }
    }
}
