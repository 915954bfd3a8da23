//! Capability credential for the advanced-tier unlock: an argon2-hashed
//! secret phrase plus a TOTP second factor.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use signal_core::config::ModeConfig;
use signal_core::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::totp::{unix_now, SecondFactor};

/// Why an unlock credential check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialFailure {
    /// No phrase hash or TOTP secret configured; the tier cannot be unlocked.
    NotConfigured,
    InvalidCredentials,
    /// The code's time step already unlocked the tier once.
    ReplayedCode,
}

impl std::fmt::Display for CredentialFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CredentialFailure::NotConfigured => f.write_str("unlock credential not configured"),
            CredentialFailure::InvalidCredentials => f.write_str("invalid credentials"),
            CredentialFailure::ReplayedCode => f.write_str("second-factor code already used"),
        }
    }
}

/// Hash a phrase into an argon2 PHC string for `mode.secret_phrase_hash`.
pub fn hash_phrase(phrase: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(phrase.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| Error::config(format!("phrase hashing failed: {}", e)))
}

/// A verified credential, holding the time step of its second-factor code
/// until the unlock is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedCode {
    step: u64,
}

pub struct UnlockCredential {
    phrase_hash: Option<String>,
    second_factor: SecondFactor,
    last_used_step: AtomicU64,
}

impl UnlockCredential {
    pub fn new(phrase_hash: &str, totp_secret: &str) -> Result<Self> {
        let phrase_hash = if phrase_hash.is_empty() {
            None
        } else {
            // Fail at startup rather than on the first unlock attempt.
            PasswordHash::new(phrase_hash)
                .map_err(|e| Error::config(format!("invalid mode.secret_phrase_hash: {}", e)))?;
            Some(phrase_hash.to_string())
        };

        Ok(Self {
            phrase_hash,
            second_factor: SecondFactor::new(totp_secret)?,
            last_used_step: AtomicU64::new(0),
        })
    }

    pub fn from_config(config: &ModeConfig) -> Result<Self> {
        Self::new(&config.secret_phrase_hash, &config.totp_secret)
    }

    pub fn is_configured(&self) -> bool {
        self.phrase_hash.is_some() && self.second_factor.is_configured()
    }

    pub fn verify(&self, phrase: &str, code: &str) -> std::result::Result<AcceptedCode, CredentialFailure> {
        self.verify_at(phrase, code, unix_now())
    }

    /// Both factors are always evaluated so timing does not reveal which failed.
    /// A code whose step was already consumed is refused.
    pub fn verify_at(
        &self,
        phrase: &str,
        code: &str,
        unix_secs: u64,
    ) -> std::result::Result<AcceptedCode, CredentialFailure> {
        let Some(ref stored) = self.phrase_hash else {
            return Err(CredentialFailure::NotConfigured);
        };
        if !self.second_factor.is_configured() {
            return Err(CredentialFailure::NotConfigured);
        }

        let phrase_ok = PasswordHash::new(stored)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(phrase.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false);
        let step = self.second_factor.matching_step_at(code, unix_secs);

        match step {
            Some(step) if phrase_ok => {
                if step <= self.last_used_step.load(Ordering::SeqCst) {
                    Err(CredentialFailure::ReplayedCode)
                } else {
                    Ok(AcceptedCode { step })
                }
            }
            _ => Err(CredentialFailure::InvalidCredentials),
        }
    }

    /// Burn the accepted code's time step (and every earlier one).
    pub fn consume(&self, accepted: AcceptedCode) {
        self.last_used_step.fetch_max(accepted.step, Ordering::SeqCst);
    }

    pub fn second_factor(&self) -> &SecondFactor {
        &self.second_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::totp::generate_secret;

    fn credential() -> UnlockCredential {
        let hash = hash_phrase("correct horse battery staple").unwrap();
        UnlockCredential::new(&hash, &generate_secret()).unwrap()
    }

    fn current_code(cred: &UnlockCredential) -> String {
        cred.second_factor()
            .generate_at(chrono::Utc::now().timestamp() as u64)
            .unwrap()
    }

    #[test]
    fn test_valid_credentials() {
        let cred = credential();
        let code = current_code(&cred);
        assert!(cred.is_configured());
        assert!(cred.verify("correct horse battery staple", &code).is_ok());
    }

    #[test]
    fn test_consumed_code_cannot_be_replayed() {
        let cred = credential();
        let now = 1_750_000_020;
        let code = cred.second_factor().generate_at(now).unwrap();

        let accepted = cred
            .verify_at("correct horse battery staple", &code, now)
            .unwrap();
        // Verifying alone does not burn the code.
        assert!(cred.verify_at("correct horse battery staple", &code, now).is_ok());

        cred.consume(accepted);
        assert_eq!(
            cred.verify_at("correct horse battery staple", &code, now + 5),
            Err(CredentialFailure::ReplayedCode)
        );

        let next_now = now + 30;
        let next = cred.second_factor().generate_at(next_now).unwrap();
        assert!(cred
            .verify_at("correct horse battery staple", &next, next_now)
            .is_ok());
    }

    #[test]
    fn test_wrong_phrase_or_code() {
        let cred = credential();
        let code = current_code(&cred);
        assert_eq!(
            cred.verify("wrong phrase", &code),
            Err(CredentialFailure::InvalidCredentials)
        );
        assert_eq!(
            cred.verify("correct horse battery staple", "000000x"),
            Err(CredentialFailure::InvalidCredentials)
        );
    }

    #[test]
    fn test_unconfigured_never_unlocks() {
        let cred = UnlockCredential::new("", "").unwrap();
        assert!(!cred.is_configured());
        assert_eq!(cred.verify("", ""), Err(CredentialFailure::NotConfigured));
    }

    #[test]
    fn test_garbage_hash_rejected_at_startup() {
        assert!(UnlockCredential::new("plaintext-phrase", "").is_err());
    }
}
