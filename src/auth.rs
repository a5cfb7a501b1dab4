use anyhow::Result;
use axum::http::{header, HeaderMap};
use cookie::Cookie;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::RelayError;
use crate::rooms;

/// Name of the handshake cookie carrying the session token.
const SESSION_COOKIE: &str = "jwt";

/// Claims stored within issued session tokens.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// Issue a JWT for a given user id valid for the provided duration.
pub fn issue_jwt(secret: &[u8], user_id: &str, valid_for: Duration) -> Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: user_id.into(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret),
    )?;
    Ok(token)
}

/// Verify a JWT and return its claims if valid.
pub fn verify_jwt(secret: &[u8], token: &str) -> Result<Claims> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)?;
    if data.claims.exp < OffsetDateTime::now_utc().unix_timestamp() as usize {
        anyhow::bail!("expired");
    }
    Ok(data.claims)
}

/// Extract the session token from a raw `Cookie` header value.
pub fn token_from_cookie_header(raw: &str) -> Option<String> {
    Cookie::split_parse(raw)
        .filter_map(|c| c.ok())
        .find(|c| c.name() == SESSION_COOKIE)
        .map(|c| c.value().to_string())
}

/// Resolve the handshake headers of an inbound connection to a user id.
///
/// The socket is only upgraded after this succeeds; a failure turns the
/// upgrade request away with 401 so no event handler is ever reachable
/// for an unauthenticated peer.
pub fn authenticate_handshake(
    conn: &Connection,
    secret: &[u8],
    headers: &HeaderMap,
) -> Result<String, RelayError> {
    let raw = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .ok_or(RelayError::Unauthorized)?;
    let token = token_from_cookie_header(raw).ok_or(RelayError::Unauthorized)?;
    let claims = verify_jwt(secret, &token).map_err(|_| RelayError::Unauthorized)?;
    if !rooms::user_exists(conn, &claims.sub)? {
        return Err(RelayError::Unauthorized);
    }
    Ok(claims.sub)
}
