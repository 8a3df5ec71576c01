//! Password hashing and verification using Argon2id.
//!
//! The stored form is treated as opaque by every caller outside this module;
//! comparison is always through `verify_password`, never a direct string
//! comparison against `password_hash`.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PasswordError {
    #[error("failed to hash password: {0}")]
    HashingError(String),
    #[error("failed to verify password: {0}")]
    VerificationError(String),
    #[error("invalid password hash format")]
    InvalidHashFormat,
    #[error("memory cost ({0} KiB) exceeds safe limit ({1} KiB)")]
    MemoryCostTooHigh(u32, u32),
}

/// Argon2id parameters. OWASP-recommended minimums.
pub struct PasswordConfig {
    pub memory_cost: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub output_length: usize,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost: 19_456,
            time_cost: 2,
            parallelism: 1,
            output_length: 32,
        }
    }
}

impl PasswordConfig {
    fn get_safe_memory_limit() -> u32 {
        match std::fs::read_to_string("/proc/meminfo") {
            Ok(content) => {
                for line in content.lines() {
                    if let Some(rest) = line.strip_prefix("MemAvailable:") {
                        if let Some(kb_str) = rest.split_whitespace().next() {
                            if let Ok(available_kb) = kb_str.parse::<u32>() {
                                return available_kb / 4;
                            }
                        }
                    }
                }
                524_288
            }
            Err(_) => 524_288,
        }
    }

    fn validate_memory_cost(&self) -> Result<(), PasswordError> {
        let safe_limit = Self::get_safe_memory_limit();
        if self.memory_cost > safe_limit {
            return Err(PasswordError::MemoryCostTooHigh(self.memory_cost, safe_limit));
        }
        Ok(())
    }

    fn build_hasher(&self) -> Result<Argon2<'static>, PasswordError> {
        self.validate_memory_cost()?;
        let params = Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            Some(self.output_length),
        )
        .map_err(|e| PasswordError::HashingError(e.to_string()))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

pub fn hash_password(password: &str) -> Result<String, PasswordError> {
    hash_password_with_config(password, &PasswordConfig::default())
}

pub fn hash_password_with_config(
    password: &str,
    config: &PasswordConfig,
) -> Result<String, PasswordError> {
    let argon2 = config.build_hasher()?;
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| PasswordError::HashingError(e.to_string()))?;
    Ok(password_hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|_| PasswordError::InvalidHashFormat)?;
    let argon2 = Argon2::default();
    match argon2.verify_password(password.as_bytes(), &parsed_hash) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(PasswordError::VerificationError(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let password = "MySecureP@ssw0rd123!";
        let hash = hash_password(password).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_password(password, &hash).unwrap());
        assert!(!verify_password("WrongPassword", &hash).unwrap());
    }

    #[test]
    fn same_password_hashes_differently() {
        let password = "TestPassword123!";
        let h1 = hash_password(password).unwrap();
        let h2 = hash_password(password).unwrap();
        assert_ne!(h1, h2);
        assert!(verify_password(password, &h1).unwrap());
        assert!(verify_password(password, &h2).unwrap());
    }

    #[test]
    fn invalid_hash_format_is_reported() {
        let result = verify_password("password", "not-a-valid-hash");
        assert!(matches!(result, Err(PasswordError::InvalidHashFormat)));
    }

    #[test]
    fn excessive_memory_cost_is_rejected() {
        let config = PasswordConfig {
            memory_cost: u32::MAX,
            time_cost: 2,
            parallelism: 1,
            output_length: 32,
        };
        let result = hash_password_with_config("x", &config);
        assert!(matches!(result, Err(PasswordError::MemoryCostTooHigh(_, _))));
    }
}
