pub mod audit_event;
pub mod identity;
pub mod records;
pub mod role;

pub use audit_event::{AuditAction, AuditEvent, AuditOutcome};
pub use identity::{Principal, SecurityContext, SessionIdentity};
pub use records::{
    AccountRecord, AccountRefRecord, KeySpace, MarkerRecord, MfaChallengeRecord,
    OAuthStateRecord, RecordError, RevocationReason, RevocationRecord, SessionRecord,
    VersionedRecord,
};
pub use role::{Permission, Role, RoleResolution};
