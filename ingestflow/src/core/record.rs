//! Record shapes flowing between fetch, validation and persistence.

use serde::{Deserialize, Serialize};

/// Untyped data returned by a fetch: an object or an array of objects.
pub type RawPayload = serde_json::Value;

/// A validated entity ready for upsert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    /// Primary key in the target relation.
    pub id: i64,
    /// Record title.
    pub title: String,
    /// Record body.
    pub body: String,
    /// Owning user, persisted as `user_id`.
    pub owner_id: Option<i64>,
}

impl NormalizedRecord {
    /// Creates a record without an owner.
    #[must_use]
    pub fn new(id: i64, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            owner_id: None,
        }
    }

    /// Sets the owner.
    #[must_use]
    pub fn with_owner(mut self, owner_id: i64) -> Self {
        self.owner_id = Some(owner_id);
        self
    }
}
