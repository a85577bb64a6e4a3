pub mod api_key;
pub mod jwt;
pub mod lockout;
pub mod password;
pub mod permissions;

pub use jwt::{TokenIssuer, TokenKind, TokenPair, VerifiedToken};
pub use lockout::LoginAttemptGuard;
pub use password::{PasswordHasher, PasswordPolicy, PasswordPolicyError};
