//! Token service (component C5): issue/verify/refresh/revoke JWT pairs and
//! own the in-memory revocation set.
//!
//! Grounded on the issue/verify/refresh shape of a Diesel+Redis backed JWT
//! service, reworked to keep no state outside process memory: the
//! revocation set is a concurrent map swept on a timer, the way a
//! write-behind revocation cache elsewhere in this lineage keeps its fast
//! read path but drops the persistence leg.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::claims::{AccessTokenClaims, RefreshTokenClaims, TokenType};
use crate::core::{id_string, now_s};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JwtError {
    #[error("token expired")]
    Expired,
    #[error("token malformed")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("token revoked")]
    Revoked,
    #[error("wrong token type")]
    WrongType,
}

impl From<jsonwebtoken::errors::Error> for JwtError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;
        match e.kind() {
            ErrorKind::ExpiredSignature => JwtError::Expired,
            ErrorKind::InvalidSignature => JwtError::BadSignature,
            _ => JwtError::Malformed,
        }
    }
}

#[derive(Clone)]
pub struct JwtConfig {
    pub signing_key: Vec<u8>,
    pub access_ttl_s: u64,
    pub refresh_ttl_s: u64,
    pub remember_me_ttl_s: u64,
}

impl JwtConfig {
    pub fn from_app_config(cfg: &crate::config::AppConfig) -> Self {
        Self {
            signing_key: cfg.jwt_signing_key.as_bytes().to_vec(),
            access_ttl_s: cfg.access_token_ttl_s,
            refresh_ttl_s: cfg.refresh_token_ttl_s,
            remember_me_ttl_s: cfg.remember_me_ttl_s,
        }
    }
}

/// Either claims kind, returned by `verify` when the caller doesn't know in
/// advance which type they're looking at.
#[derive(Debug, Clone)]
pub enum AnyClaims {
    Access(AccessTokenClaims),
    Refresh(RefreshTokenClaims),
}

impl AnyClaims {
    pub fn sub(&self) -> &str {
        match self {
            AnyClaims::Access(c) => &c.sub,
            AnyClaims::Refresh(c) => &c.sub,
        }
    }

    pub fn jti(&self) -> &str {
        match self {
            AnyClaims::Access(c) => &c.jti,
            AnyClaims::Refresh(c) => &c.jti,
        }
    }

    pub fn exp(&self) -> u64 {
        match self {
            AnyClaims::Access(c) => c.exp,
            AnyClaims::Refresh(c) => c.exp,
        }
    }
}

/// Only used to sniff `typ` before picking which concrete struct to decode into.
#[derive(Deserialize)]
struct TypeProbe {
    typ: TokenType,
}

pub struct IssuedPair {
    pub access_token: String,
    pub refresh_token: String,
    pub claims: AccessTokenClaims,
    pub expires_in_s: u64,
}

pub struct TokenService {
    config: JwtConfig,
    /// jti -> exp (seconds since epoch); an entry present means revoked until exp passes.
    revoked: DashMap<String, u64>,
}

impl TokenService {
    pub fn new(config: JwtConfig) -> Self {
        Self {
            config,
            revoked: DashMap::new(),
        }
    }

    fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_secret(&self.config.signing_key)
    }

    fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_secret(&self.config.signing_key)
    }

    fn validation(&self) -> Validation {
        let mut v = Validation::new(jsonwebtoken::Algorithm::HS256);
        v.validate_exp = true;
        v.leeway = 0;
        v.required_spec_claims.clear();
        v
    }

    /// Issue a fresh access+refresh pair. Records no state beyond the process.
    pub fn issue_pair(&self, user_id: &str, remember: bool) -> IssuedPair {
        let iat = now_s();
        let access_claims = AccessTokenClaims {
            sub: user_id.to_string(),
            typ: TokenType::Access,
            iat,
            exp: iat + self.config.access_ttl_s,
            jti: id_string(),
        };
        let refresh_ttl = if remember {
            self.config.remember_me_ttl_s
        } else {
            self.config.refresh_ttl_s
        };
        let refresh_claims = RefreshTokenClaims {
            sub: user_id.to_string(),
            typ: TokenType::Refresh,
            iat,
            exp: iat + refresh_ttl,
            jti: id_string(),
            remember_me: remember,
        };

        let access_token = encode(&Header::default(), &access_claims, &self.encoding_key())
            .expect("encoding access token with a valid key cannot fail");
        let refresh_token = encode(&Header::default(), &refresh_claims, &self.encoding_key())
            .expect("encoding refresh token with a valid key cannot fail");

        IssuedPair {
            access_token,
            refresh_token,
            expires_in_s: self.config.access_ttl_s,
            claims: access_claims,
        }
    }

    fn is_revoked(&self, jti: &str) -> bool {
        match self.revoked.get(jti) {
            Some(exp) => now_s() < *exp,
            None => false,
        }
    }

    /// Decode and validate a token of either kind, checking the revocation set.
    pub fn verify(&self, token: &str) -> Result<AnyClaims, JwtError> {
        let probe = decode::<TypeProbe>(token, &self.decoding_key(), &self.validation())?;
        let claims = match probe.claims.typ {
            TokenType::Access => {
                let data = decode::<AccessTokenClaims>(token, &self.decoding_key(), &self.validation())?;
                AnyClaims::Access(data.claims)
            }
            TokenType::Refresh => {
                let data = decode::<RefreshTokenClaims>(token, &self.decoding_key(), &self.validation())?;
                AnyClaims::Refresh(data.claims)
            }
        };

        if self.is_revoked(claims.jti()) {
            return Err(JwtError::Revoked);
        }
        Ok(claims)
    }

    /// Verify specifically an access token, rejecting refresh tokens with `WrongType`.
    pub fn verify_access(&self, token: &str) -> Result<AccessTokenClaims, JwtError> {
        match self.verify(token)? {
            AnyClaims::Access(c) => Ok(c),
            AnyClaims::Refresh(_) => Err(JwtError::WrongType),
        }
    }

    /// Refresh: requires `typ=refresh`, not revoked; issues a new pair and
    /// atomically revokes the old refresh jti. On a race between two
    /// concurrent refreshes of the same token, the first writer to claim the
    /// jti wins; the other observes `Revoked`.
    pub fn refresh(&self, refresh_token: &str) -> Result<IssuedPair, JwtError> {
        let claims = match self.verify(refresh_token)? {
            AnyClaims::Refresh(c) => c,
            AnyClaims::Access(_) => return Err(JwtError::WrongType),
        };

        match self.revoked.entry(claims.jti.clone()) {
            Entry::Occupied(_) => Err(JwtError::Revoked),
            Entry::Vacant(e) => {
                e.insert(claims.exp);
                Ok(self.issue_pair(&claims.sub, claims.remember_me))
            }
        }
    }

    /// Insert `jti` into the revocation set with expiry = the token's `exp`.
    pub fn revoke(&self, token: &str) -> Result<(), JwtError> {
        let claims = self.verify(token)?;
        self.revoked.insert(claims.jti().to_string(), claims.exp());
        Ok(())
    }

    /// Sweep entries whose expiry has passed. Run on a timer by the caller.
    pub fn sweep(&self) {
        let now = now_s();
        self.revoked.retain(|_, exp| *exp > now);
    }

    pub fn revoked_count(&self) -> usize {
        self.revoked.len()
    }
}
