//! JWT authentication for operator commands.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use signal_core::{Error, Result};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Operator roles, ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OperatorRole {
    /// Read-only access to state, orders and the audit log.
    #[default]
    Viewer,
    /// Pause/resume, force conservative, cancel orders, manual signals.
    Operator,
    /// Everything, including unlocking the advanced tier and going live.
    Admin,
}

impl OperatorRole {
    pub fn can_operate(&self) -> bool {
        *self >= OperatorRole::Operator
    }

    pub fn is_admin(&self) -> bool {
        *self == OperatorRole::Admin
    }
}

impl fmt::Display for OperatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorRole::Viewer => f.write_str("viewer"),
            OperatorRole::Operator => f.write_str("operator"),
            OperatorRole::Admin => f.write_str("admin"),
        }
    }
}

impl FromStr for OperatorRole {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.to_ascii_lowercase().as_str() {
            "viewer" => Ok(OperatorRole::Viewer),
            "operator" => Ok(OperatorRole::Operator),
            "admin" => Ok(OperatorRole::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// JWT claims payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (operator id). Recorded as the actor in the audit log.
    pub sub: String,
    pub role: OperatorRole,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// JWT ID (unique identifier for this token).
    pub jti: String,
}

impl Claims {
    pub fn new(
        operator_id: impl Into<String>,
        role: OperatorRole,
        issuer: impl Into<String>,
        expiry_hours: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            sub: operator_id.into(),
            role,
            iss: issuer.into(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(expiry_hours)).timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }
}

/// Configuration for JWT authentication.
#[derive(Clone)]
pub struct JwtConfig {
    pub secret: String,
    pub expiry_hours: i64,
    pub issuer: String,
}

impl JwtConfig {
    pub fn from_admin(config: &signal_core::config::AdminConfig) -> Self {
        Self {
            secret: config.jwt_secret.clone(),
            expiry_hours: config.token_expiry_hours,
            issuer: config.jwt_issuer.clone(),
        }
    }
}

/// JWT authentication handler.
pub struct JwtAuth {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    config: JwtConfig,
    validation: Validation,
}

impl JwtAuth {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::default();
        validation.set_issuer(&[&config.issuer]);

        Self {
            encoding_key,
            decoding_key,
            config,
            validation,
        }
    }

    /// Mint a token for an operator.
    pub fn create_token(&self, operator_id: &str, role: OperatorRole) -> Result<String> {
        let claims = Claims::new(
            operator_id,
            role,
            self.config.issuer.clone(),
            self.config.expiry_hours,
        );
        encode(&Header::default(), &claims, &self.encoding_key).map_err(|e| Error::Auth {
            message: format!("failed to sign token: {}", e),
        })
    }

    /// Validate and decode a token.
    pub fn validate_token(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Auth {
                message: format!("invalid token: {}", e),
            })
    }
}
