//! TOTP second factor for the advanced-tier unlock.
//!
//! SHA1, 6 digits, 30-second step, one step of clock-drift tolerance.

use signal_core::{Error, Result};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::secret::SharedSecret;

const TOTP_ALGORITHM: Algorithm = Algorithm::SHA1;
const TOTP_DIGITS: usize = 6;
const TOTP_STEP: u64 = 30;
const TOTP_SKEW: u8 = 1;
const ISSUER: &str = "SignalGate";
const ACCOUNT: &str = "operator";

/// Generate a new random base32 secret for `mode.totp_secret`.
pub fn generate_secret() -> String {
    Secret::generate_secret().to_encoded().to_string()
}

/// Verifies second-factor codes against the configured secret.
pub struct SecondFactor {
    totp: Option<TOTP>,
}

impl SecondFactor {
    /// An empty secret yields a verifier that rejects every code.
    pub fn new(base32_secret: &str) -> Result<Self> {
        if base32_secret.is_empty() {
            return Ok(Self { totp: None });
        }
        Ok(Self {
            totp: Some(build(base32_secret)?),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.totp.is_some()
    }

    pub fn verify(&self, code: &str) -> bool {
        self.verify_at(code, unix_now())
    }

    pub fn verify_at(&self, code: &str, unix_secs: u64) -> bool {
        self.matching_step_at(code, unix_secs).is_some()
    }

    /// Time step (`unix_secs / 30`) whose code equals `code`, searching one
    /// step either side of `unix_secs`. The newest match wins.
    pub fn matching_step_at(&self, code: &str, unix_secs: u64) -> Option<u64> {
        let totp = self.totp.as_ref()?;
        if code.len() != TOTP_DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }

        let current = unix_secs / TOTP_STEP;
        let skew = u64::from(TOTP_SKEW);
        let mut matched = None;
        // Every candidate is compared so timing does not reveal which one matched.
        for step in current.saturating_sub(skew)..=current + skew {
            if SharedSecret::new(&totp.generate(step * TOTP_STEP)).verify(code) {
                matched = Some(step);
            }
        }
        matched
    }

    /// Current code, for operator tooling and tests.
    pub fn generate_at(&self, unix_secs: u64) -> Option<String> {
        self.totp.as_ref().map(|t| t.generate(unix_secs))
    }

    /// `otpauth://` URI for enrolling an authenticator app.
    pub fn provisioning_uri(&self) -> Option<String> {
        self.totp.as_ref().map(|t| t.get_url())
    }
}

fn build(base32_secret: &str) -> Result<TOTP> {
    let bytes = Secret::Encoded(base32_secret.to_string())
        .to_bytes()
        .map_err(|e| Error::config(format!("invalid mode.totp_secret: {}", e)))?;

    TOTP::new(
        TOTP_ALGORITHM,
        TOTP_DIGITS,
        TOTP_SKEW,
        TOTP_STEP,
        bytes,
        Some(ISSUER.to_string()),
        ACCOUNT.to_string(),
    )
    .map_err(|e| Error::config(format!("invalid mode.totp_secret: {}", e)))
}

pub(crate) fn unix_now() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
