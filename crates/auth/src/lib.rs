//! Authentication and Audit
//!
//! Append-only audit log, operator JWTs, shared-secret verification, and the
//! advanced-tier unlock credential with failed-attempt lockout.

pub mod audit;
pub mod audit_storage_pg;
pub mod jwt;
pub mod lockout;
pub mod secret;
pub mod totp;
pub mod unlock;

pub use audit::{
    AuditAction, AuditEntry, AuditFilter, AuditLogger, AuditStorage, Decision,
    MemoryAuditStorage, SYSTEM_ACTOR,
};
pub use audit_storage_pg::PostgresAuditStorage;
pub use jwt::{Claims, JwtAuth, JwtConfig, OperatorRole};
pub use lockout::{AttemptStatus, FailedAttemptTracker};
pub use secret::SharedSecret;
pub use totp::SecondFactor;
pub use unlock::{hash_phrase, AcceptedCode, CredentialFailure, UnlockCredential};
