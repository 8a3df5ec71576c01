pub mod claims;
pub mod password;
pub mod token_service;

pub use claims::{AccessTokenClaims, RefreshTokenClaims, TokenType};
pub use password::{hash_password, verify_password, PasswordError};
pub use token_service::{AnyClaims, IssuedPair, JwtConfig, JwtError, TokenService};
