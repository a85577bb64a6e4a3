//! Password policy and Argon2id hashing.

use argon2::password_hash::{self, PasswordHash, PasswordHasher as _, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;
use thiserror::Error;

use crate::config::SecurityConfig;

/// Upper bound on accepted input so hashing cost stays bounded.
pub const MAX_PASSWORD_LENGTH: usize = 128;

const ARGON2_ITERATIONS: u32 = 3;
const ARGON2_LANES: u32 = 1;

/// Character classes a complex password must draw from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharClass {
    Uppercase,
    Lowercase,
    Digit,
    Symbol,
}

impl CharClass {
    const ALL: [CharClass; 4] = [Self::Uppercase, Self::Lowercase, Self::Digit, Self::Symbol];

    fn matches(self, c: char) -> bool {
        match self {
            Self::Uppercase => c.is_uppercase(),
            Self::Lowercase => c.is_lowercase(),
            Self::Digit => c.is_ascii_digit(),
            Self::Symbol => !c.is_alphanumeric(),
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            Self::Uppercase => "an uppercase letter",
            Self::Lowercase => "a lowercase letter",
            Self::Digit => "a digit",
            Self::Symbol => "a symbol",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PasswordPolicyError {
    #[error("password needs at least {min} characters")]
    TooShort { min: usize },
    #[error("password may not exceed {max} characters")]
    TooLong { max: usize },
    #[error("password must include {}", .0.describe())]
    Missing(CharClass),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub required_classes: Vec<CharClass>,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            required_classes: Vec::new(),
        }
    }
}

impl PasswordPolicy {
    pub fn from_config(security: &SecurityConfig) -> Self {
        Self {
            min_length: security.min_password_length,
            required_classes: if security.require_password_complexity {
                CharClass::ALL.to_vec()
            } else {
                Vec::new()
            },
        }
    }

    /// Reports the first rule the password breaks.
    pub fn validate(&self, password: &str) -> Result<(), PasswordPolicyError> {
        let length = password.chars().count();
        if length < self.min_length {
            return Err(PasswordPolicyError::TooShort {
                min: self.min_length,
            });
        }
        if length > MAX_PASSWORD_LENGTH {
            return Err(PasswordPolicyError::TooLong {
                max: MAX_PASSWORD_LENGTH,
            });
        }

        match self
            .required_classes
            .iter()
            .find(|class| !password.chars().any(|c| class.matches(c)))
        {
            Some(class) => Err(PasswordPolicyError::Missing(*class)),
            None => Ok(()),
        }
    }
}

/// Argon2id hasher. Memory usage is `2^memory_cost_log2` KiB, so 4 suits
/// tests and 16 (64 MiB) suits production.
#[derive(Debug, Clone, Copy)]
pub struct PasswordHasher {
    memory_cost_log2: u32,
}

impl PasswordHasher {
    pub fn new(memory_cost_log2: u32) -> Self {
        Self { memory_cost_log2 }
    }

    fn argon2(&self) -> Result<Argon2<'static>, password_hash::Error> {
        // Argon2 wants at least 8 KiB per lane.
        let memory_kib = 1u32 << self.memory_cost_log2.clamp(3, 22);
        let params = Params::new(memory_kib, ARGON2_ITERATIONS, ARGON2_LANES, None)
            .map_err(|_| password_hash::Error::ParamsMaxExceeded)?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    /// PHC string with embedded salt and parameters.
    pub fn hash(&self, password: &str) -> Result<String, password_hash::Error> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(self
            .argon2()?
            .hash_password(password.as_bytes(), &salt)?
            .to_string())
    }

    /// Parameters come from the stored hash, so hashes made under an older
    /// cost keep verifying. A mismatch is `Ok(false)`, a corrupt hash an error.
    pub fn verify(&self, password: &str, stored: &str) -> Result<bool, password_hash::Error> {
        let parsed = PasswordHash::new(stored)?;
        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
