//! Command structs for engine operations.
//!
//! These types group parameters for write operations, keeping call sites
//! readable and avoiding long argument lists.

use uuid::Uuid;

use crate::EntrySource;

/// The authenticated caller, used for audit attribution only.
///
/// Authorization happens outside the engine; by the time an `Actor` reaches
/// an operation the caller is already allowed to perform it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub uid: String,
    pub role: Option<String>,
}

impl Actor {
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            role: None,
        }
    }

    #[must_use]
    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }
}

/// Create a debit (due) or credit (payment) entry.
#[derive(Clone, Debug)]
pub struct PostEntryCmd {
    pub management_id: String,
    pub unit_id: String,
    pub amount_minor: i64,
    pub source: EntrySource,
    pub idempotency_key: Option<String>,
    /// Credits only: due to serve before the oldest-first sweep.
    pub related_due_id: Option<Uuid>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
}

impl PostEntryCmd {
    #[must_use]
    pub fn new(
        management_id: impl Into<String>,
        unit_id: impl Into<String>,
        amount_minor: i64,
        source: EntrySource,
    ) -> Self {
        Self {
            management_id: management_id.into(),
            unit_id: unit_id.into(),
            amount_minor,
            source,
            idempotency_key: None,
            related_due_id: None,
            description: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn related_due_id(mut self, due_id: Uuid) -> Self {
        self.related_due_id = Some(due_id);
        self
    }

    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}
