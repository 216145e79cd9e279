//! Reading JWT claims before (or without) verifying them

use std::collections::HashSet;

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde_json::Value;

use meshview_common::strip_service_account_prefix;

use crate::error::{Error, Result};

/// Raw claim set of a token
pub type Claims = serde_json::Map<String, Value>;

/// Username used for bearer tokens that carry no readable subject
pub const DEFAULT_TOKEN_USERNAME: &str = "token";

/// Decode the claims of `token` without checking its signature or any claim
pub fn unverified_claims(token: &str) -> Result<Claims> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims = HashSet::new();

    let data = decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| Error::unauthorized(format!("cannot parse token claims: {e}")))?;
    Ok(data.claims)
}

/// Claim value as text
///
/// Numbers are rendered as text too, so `"aud": 1234` compares equal to a
/// configured `"1234"`. Some providers emit numeric client ids.
pub fn claim_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Human readable name for a bearer token
///
/// The unverified `sub` claim with the ServiceAccount prefix removed, or
/// [`DEFAULT_TOKEN_USERNAME`] when the token is not a JWT.
pub fn username_from_token(token: &str) -> String {
    unverified_claims(token)
        .ok()
        .and_then(|claims| claims.get("sub").and_then(claim_as_string))
        .filter(|sub| !sub.is_empty())
        .map(|sub| strip_service_account_prefix(&sub).to_string())
        .unwrap_or_else(|| DEFAULT_TOKEN_USERNAME.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    /// HS256 token over `claims`, signed with `secret`
    pub(crate) fn mint(claims: &Value, secret: &[u8], kid: Option<&str>) -> String {
        let mut header = Header::default();
        header.kid = kid.map(str::to_string);
        encode(&header, claims, &EncodingKey::from_secret(secret)).unwrap()
    }

    #[test]
    fn test_unverified_claims_ignores_signature_and_expiry() {
        let token = mint(&json!({ "sub": "alice", "exp": 1 }), b"whatever", None);
        let claims = unverified_claims(&token).unwrap();
        assert_eq!(claims["sub"], "alice");
        assert_eq!(claims["exp"], 1);
    }

    #[test]
    fn test_unverified_claims_rejects_garbage() {
        assert!(unverified_claims("not-a-jwt").is_err());
    }

    #[test]
    fn test_username_from_service_account_token() {
        let token = mint(
            &json!({ "sub": "system:serviceaccount:k8s_user" }),
            b"k",
            None,
        );
        assert_eq!(username_from_token(&token), "k8s_user");
    }

    #[test]
    fn test_username_from_opaque_token() {
        assert_eq!(username_from_token("sha256~opaque"), DEFAULT_TOKEN_USERNAME);
        let token = mint(&json!({ "iss": "x" }), b"k", None);
        assert_eq!(username_from_token(&token), DEFAULT_TOKEN_USERNAME);
    }

    #[test]
    fn test_claim_as_string_coerces_numbers() {
        assert_eq!(claim_as_string(&json!("a")).as_deref(), Some("a"));
        assert_eq!(claim_as_string(&json!(1234)).as_deref(), Some("1234"));
        assert_eq!(claim_as_string(&json!(true)), None);
        assert_eq!(claim_as_string(&json!(["a"])), None);
    }
}
