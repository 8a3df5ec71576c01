//! JWT claim shapes. Two Rust types for type safety between access and
//! refresh tokens, but both serialize with an explicit `typ` discriminant so
//! the wire shape is exactly `{sub, typ, iat, exp, jti}`.

use serde::{Deserialize, Serialize};

use crate::core::now_s;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub sub: String,
    pub typ: TokenType,
    pub iat: u64,
    pub exp: u64,
    pub jti: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshTokenClaims {
    pub sub: String,
    pub typ: TokenType,
    pub iat: u64,
    pub exp: u64,
    pub jti: String,
    pub remember_me: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl AccessTokenClaims {
    /// `exp` is the closed boundary: a token exactly at `exp` is expired.
    pub fn is_expired(&self) -> bool {
        now_s() >= self.exp
    }
}

impl RefreshTokenClaims {
    pub fn is_expired(&self) -> bool {
        now_s() >= self.exp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_claims_serialize_with_typ_tag() {
        let claims = AccessTokenClaims {
            sub: "u_alice".into(),
            typ: TokenType::Access,
            iat: 1000,
            exp: 2000,
            jti: "jti-1".into(),
        };
        let v = serde_json::to_value(&claims).unwrap();
        assert_eq!(v["typ"], "access");
        assert_eq!(v["sub"], "u_alice");
    }

    #[test]
    fn exp_boundary_is_closed_in_the_past() {
        let mut claims = AccessTokenClaims {
            sub: "u".into(),
            typ: TokenType::Access,
            iat: 0,
            exp: now_s(),
            jti: "j".into(),
        };
        assert!(claims.is_expired());
        claims.exp = now_s() + 10;
        assert!(!claims.is_expired());
    }
}
