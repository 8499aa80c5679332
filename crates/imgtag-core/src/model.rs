use std::time::Instant;

use serde::{Deserialize, Serialize};

/// A single (tag, confidence) pair returned by a processor. Unordered in
/// transport; callers that care about order preserve whatever order the
/// processor emitted for a given job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub name: String,
    pub score: f32,
}

/// Lifecycle status of a job record. See the module-level invariants on
/// `Info` for the allowed transitions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Status {
    Pending,
    Processing,
    Done,
    Failed,
}

/// Wire/persisted error taxonomy. `OK` is never actually
/// set on a terminal `Failed` record; it exists so the wire representation
/// has a zero value distinct from "absent".
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(i8)]
pub enum ErrorCode {
    Ok = 0,
    Canceled = 1,
    NotFound = 2,
    Invalid = 3,
    Terminated = 4,
    Timeout = 5,
    InternalError = 6,
}

/// A job record as tracked by `Storage`. `id` is assigned on `Push` and is
/// monotonically increasing; everything else mutates in place as the job
/// moves through its lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Info {
    pub id: i64,
    pub url: String,
    pub status: Status,
    pub priority: i32,
    #[serde(skip, default = "Instant::now")]
    pub last_activity: Instant,
    pub tags: Vec<Tag>,
    pub error_code: ErrorCode,
    pub error_reason: String,
}

impl Info {
    pub fn new(id: i64, url: String, priority: i32) -> Self {
        Self {
            id,
            url,
            status: Status::Pending,
            priority,
            last_activity: Instant::now(),
            tags: Vec::new(),
            error_code: ErrorCode::Ok,
            error_reason: String::new(),
        }
    }
}

/// Worker-local bookkeeping for one in-flight job. Exclusively owned by the
/// `Worker`; never shared with `Storage` or `Bus`.
pub struct JobContext {
    pub id: i64,
    pub cancel: tokio_util::sync::CancellationToken,
    pub deadline: Instant,
}

/// Access level resolved by an `Authorizer` from opaque credentials. Encoded
/// on the wire as the same numeric `int8` iota the authorizer's original
/// implementation uses, not as a string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde_repr::Serialize_repr, serde_repr::Deserialize_repr)]
#[repr(i8)]
pub enum AccessLevel {
    Anonymous = 0,
    User = 1,
    PowerUser = 2,
    Mod = 3,
    Admin = 4,
}

/// Resolved caller identity.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Auth {
    pub id: String,
    pub name: String,
    pub level: AccessLevel,
}

impl Auth {
    /// The well-known sentinel identity for unauthenticated/failed lookups.
    pub fn anonymous() -> Self {
        Self {
            id: String::new(),
            name: "anonymous".to_string(),
            level: AccessLevel::Anonymous,
        }
    }
}
