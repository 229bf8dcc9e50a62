use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Deserialize;

use rozet_core::ApiError;

use crate::config::AuthConfig;

/// Authenticated caller identity, attached to the request as an extension.
#[derive(Clone, Debug)]
pub struct Principal {
    pub subject: String,
    pub issuer: Option<String>,
}

#[derive(Deserialize)]
struct Claims {
    iss: Option<String>,
    aud: Option<AudClaim>,
    sub: Option<String>,
    email: Option<String>,
}

/// `aud` may be a single string or an array per RFC 7519.
#[derive(Deserialize)]
#[serde(untagged)]
enum AudClaim {
    One(String),
    Many(Vec<String>),
}

impl AudClaim {
    fn contains(&self, expected: &str) -> bool {
        match self {
            AudClaim::One(a) => a == expected,
            AudClaim::Many(list) => list.iter().any(|a| a == expected),
        }
    }
}

/// Validate the `Authorization` header and produce a principal.
///
/// The token payload is base64-decoded without signature verification: the
/// gateway in front of this service has already verified the signature, and
/// this layer only checks claim shape and issuer/audience pinning.
pub fn authenticate(config: &AuthConfig, header: Option<&str>) -> Result<Principal, ApiError> {
    if config.disabled {
        return Ok(Principal {
            subject: "dev".into(),
            issuer: None,
        });
    }

    let header = header.ok_or_else(|| {
        ApiError::Authentication("missing Authorization header".into())
    })?;
    let token = header
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Authentication("expected Bearer scheme".into()))?;

    let claims = decode_claims(token)?;

    let issuer = claims
        .iss
        .ok_or_else(|| ApiError::Authentication("token missing iss claim".into()))?;
    let aud = claims
        .aud
        .ok_or_else(|| ApiError::Authentication("token missing aud claim".into()))?;

    if let Some(expected) = &config.issuer {
        if &issuer != expected {
            return Err(ApiError::Authentication("issuer mismatch".into()));
        }
    }
    if let Some(expected) = &config.audience {
        if !aud.contains(expected) {
            return Err(ApiError::Authentication("audience mismatch".into()));
        }
    }

    let subject = claims
        .sub
        .or(claims.email)
        .ok_or_else(|| ApiError::Authentication("token missing sub and email claims".into()))?;

    Ok(Principal {
        subject,
        issuer: Some(issuer),
    })
}

fn decode_claims(token: &str) -> Result<Claims, ApiError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ApiError::Authentication("malformed token".into()));
    };
    if parts.next().is_some() {
        return Err(ApiError::Authentication("malformed token".into()));
    }

    let raw = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| ApiError::Authentication("token payload is not base64".into()))?;
    serde_json::from_slice(&raw)
        .map_err(|_| ApiError::Authentication("token payload is not valid JSON".into()))
}
