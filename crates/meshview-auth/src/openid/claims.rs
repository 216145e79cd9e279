//! ID token claim checks

use chrono::{DateTime, Duration, TimeZone, Utc};
use jsonwebtoken::jwk::Jwk;
use jsonwebtoken::{decode, DecodingKey, Header, Validation};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::jwt::{claim_as_string, Claims};

/// Username used when the configured claim is absent
pub const DEFAULT_OPENID_USERNAME: &str = "OpenId User";

/// Largest tolerated clock skew for `iat`
pub const MAX_IAT_SKEW_SECONDS: i64 = 60;

fn rejected(detail: impl std::fmt::Display) -> Error {
    Error::auth_failure(
        axum::http::StatusCode::UNAUTHORIZED,
        "the OpenID token was rejected",
        detail,
    )
}

fn numeric_time(claims: &Claims, name: &str) -> Result<DateTime<Utc>> {
    let value = claims
        .get(name)
        .ok_or_else(|| rejected(format!("the OpenID token has no {name} claim")))?;
    let seconds = match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        _ => None,
    }
    .ok_or_else(|| rejected(format!("the {name} claim of the OpenID token is not numeric")))?;

    Utc.timestamp_opt(seconds, 0)
        .single()
        .ok_or_else(|| rejected(format!("the {name} claim of the OpenID token is out of range")))
}

/// Expiration of the token; `exp` must be present and numeric
pub fn expiration(claims: &Claims) -> Result<DateTime<Utc>> {
    numeric_time(claims, "exp")
}

/// Value of the configured username claim
pub fn username(claims: &Claims, username_claim: &str) -> String {
    claims
        .get(username_claim)
        .and_then(claim_as_string)
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| DEFAULT_OPENID_USERNAME.to_string())
}

/// The `aud` claim must name `client_id`, either alone or within an array
pub fn check_audience(claims: &Claims, client_id: &str) -> Result<()> {
    let aud = claims
        .get("aud")
        .ok_or_else(|| rejected("the OpenID token has no aud claim"))?;

    match aud {
        Value::Array(values) => {
            if values.is_empty() {
                return Err(rejected("the OpenID token has an empty audience list"));
            }
            let audiences: Vec<String> = values.iter().filter_map(claim_as_string).collect();
            if audiences.iter().any(|a| a == client_id) {
                Ok(())
            } else {
                Err(rejected(format!(
                    "client id [{client_id}] not found in audiences [{}]",
                    audiences.join(", ")
                )))
            }
        }
        single => match claim_as_string(single) {
            Some(a) if a == client_id => Ok(()),
            Some(a) => Err(rejected(format!(
                "the OpenID token was issued for another client: got aud [{a}]"
            ))),
            None => Err(rejected("the aud claim of the OpenID token is not a string")),
        },
    }
}

/// The `nonce` claim must echo the hashed nonce of the login in progress
pub fn check_nonce(claims: &Claims, expected: &str) -> Result<()> {
    match claims.get("nonce").and_then(Value::as_str) {
        Some(nonce) if nonce == expected => Ok(()),
        Some(_) => Err(rejected("nonce mismatch, restart the login")),
        None => Err(rejected("the OpenID token has no nonce claim")),
    }
}

/// Domain of the user, from `hd` or else the e-mail address
pub fn user_domain(claims: &Claims) -> Option<String> {
    if let Some(hd) = claims.get("hd").and_then(Value::as_str) {
        return Some(hd.to_string());
    }
    claims
        .get("email")
        .and_then(Value::as_str)
        .and_then(|email| email.rsplit_once('@'))
        .map(|(_, domain)| domain.to_string())
}

/// Reject users outside `allowed` when the list is non-empty
pub fn check_allowed_domains(claims: &Claims, allowed: &[String]) -> Result<()> {
    if allowed.is_empty() {
        return Ok(());
    }
    match user_domain(claims) {
        Some(domain) if allowed.iter().any(|a| a.eq_ignore_ascii_case(&domain)) => Ok(()),
        Some(domain) => Err(Error::auth_failure(
            axum::http::StatusCode::FORBIDDEN,
            "the user domain is not allowed to log in",
            format!("domain [{domain}] is not in the allowed list"),
        )),
        None => Err(Error::auth_failure(
            axum::http::StatusCode::FORBIDDEN,
            "the user domain is not allowed to log in",
            "the OpenID token has neither an hd nor an email claim",
        )),
    }
}

/// Claim checks done by the server itself when cluster RBAC is not used
///
/// Covers issuer, audience, `iat` and `exp`. The signature is checked
/// separately with [`verify_signature`].
pub fn check_registered_claims(
    claims: &Claims,
    issuer: &str,
    client_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    match claims.get("iss").and_then(Value::as_str) {
        Some(iss) if iss == issuer => {}
        Some(iss) => {
            return Err(rejected(format!(
                "issuer [{iss}] does not match the configured issuer"
            )))
        }
        None => return Err(rejected("the OpenID token has no iss claim")),
    }

    check_audience(claims, client_id)?;

    let issued_at = numeric_time(claims, "iat")?;
    if issued_at > now + Duration::seconds(MAX_IAT_SKEW_SECONDS) {
        return Err(rejected("the OpenID token was issued in the future"));
    }

    if expiration(claims)? <= now {
        return Err(rejected("the OpenID token has expired"));
    }
    Ok(())
}

/// Verify the token signature with a key from the provider's JWKS
pub fn verify_signature(token: &str, header: &Header, jwk: &Jwk) -> Result<()> {
    let key = DecodingKey::from_jwk(jwk)
        .map_err(|e| rejected(format!("unusable signing key: {e}")))?;

    let mut validation = Validation::new(header.alg);
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<Claims>(token, &key, &validation)
        .map(|_| ())
        .map_err(|e| rejected(format!("signature verification failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Claims {
        match value {
            Value::Object(map) => map,
            _ => panic!("claims must be an object"),
        }
    }

    #[test]
    fn test_audience_single_or_array_in_any_position() {
        let accepted = [
            json!({ "aud": "meshview" }),
            json!({ "aud": ["meshview"] }),
            json!({ "aud": ["meshview", "other"] }),
            json!({ "aud": ["other", "meshview"] }),
            json!({ "aud": ["a", "b", "meshview", "c"] }),
        ];
        for c in accepted {
            assert!(check_audience(&claims(c.clone()), "meshview").is_ok(), "{c}");
        }
    }

    #[test]
    fn test_audience_rejection_names_offending_values() {
        let err = check_audience(&claims(json!({ "aud": "other" })), "meshview").unwrap_err();
        assert!(err.to_string().contains("got aud [other]"));

        let err =
            check_audience(&claims(json!({ "aud": ["x", "y"] })), "meshview").unwrap_err();
        assert!(err.to_string().contains("not found in audiences [x, y]"));

        let err = check_audience(&claims(json!({ "aud": [] })), "meshview").unwrap_err();
        assert!(err.to_string().contains("empty audience list"));

        let err = check_audience(&claims(json!({})), "meshview").unwrap_err();
        assert!(err.to_string().contains("has no aud claim"));
    }

    #[test]
    fn test_numeric_audience_is_coerced() {
        assert!(check_audience(&claims(json!({ "aud": 1234 })), "1234").is_ok());
        assert!(check_audience(&claims(json!({ "aud": ["x", 1234] })), "1234").is_ok());
    }

    #[test]
    fn test_expiration_must_be_numeric() {
        let exp = expiration(&claims(json!({ "exp": 1638316800 }))).unwrap();
        assert_eq!(exp.timestamp(), 1638316800);
        assert!(expiration(&claims(json!({ "exp": 1638316800.5 }))).is_ok());
        assert!(expiration(&claims(json!({ "exp": "tomorrow" }))).is_err());
        assert!(expiration(&claims(json!({}))).is_err());
    }

    #[test]
    fn test_username_claim_with_default() {
        let c = claims(json!({ "sub": "123", "email": "a@example.com" }));
        assert_eq!(username(&c, "email"), "a@example.com");
        assert_eq!(username(&c, "preferred_username"), DEFAULT_OPENID_USERNAME);
    }

    #[test]
    fn test_nonce_check() {
        let c = claims(json!({ "nonce": "abc" }));
        assert!(check_nonce(&c, "abc").is_ok());
        assert!(check_nonce(&c, "abd").is_err());
        assert!(check_nonce(&claims(json!({})), "abc").is_err());
    }

    #[test]
    fn test_allowed_domains() {
        let allowed = vec!["example.com".to_string()];
        assert!(check_allowed_domains(&claims(json!({})), &[]).is_ok());
        assert!(
            check_allowed_domains(&claims(json!({ "hd": "example.com" })), &allowed).is_ok()
        );
        assert!(check_allowed_domains(
            &claims(json!({ "email": "bob@Example.com" })),
            &allowed
        )
        .is_ok());

        let err = check_allowed_domains(&claims(json!({ "email": "eve@evil.io" })), &allowed)
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::FORBIDDEN);
        assert!(check_allowed_domains(&claims(json!({ "sub": "x" })), &allowed).is_err());
    }

    #[test]
    fn test_registered_claims() {
        let now = Utc.with_ymd_and_hms(2021, 12, 1, 0, 0, 0).unwrap();
        let ts = now.timestamp();
        let good = json!({
            "iss": "https://idp.example.com",
            "aud": "meshview",
            "iat": ts,
            "exp": ts + 300,
        });
        let check = |c: Value| {
            check_registered_claims(&claims(c), "https://idp.example.com", "meshview", now)
        };
        assert!(check(good.clone()).is_ok());

        let mut bad = good.clone();
        bad["iss"] = json!("https://other.example.com");
        assert!(check(bad).is_err());

        let mut skewed = good.clone();
        skewed["iat"] = json!(ts + MAX_IAT_SKEW_SECONDS);
        assert!(check(skewed.clone()).is_ok());
        skewed["iat"] = json!(ts + MAX_IAT_SKEW_SECONDS + 1);
        assert!(check(skewed).is_err());

        let mut expired = good;
        expired["exp"] = json!(ts);
        assert!(check(expired).unwrap_err().to_string().contains("expired"));
    }
}
