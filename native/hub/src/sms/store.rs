use async_trait::async_trait;
use derive_more::Display;

use crate::models::MessageRecord;

/// Why the system message store refused a record.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum InsertError {
    /// This app does not hold the role required to write messages.
    #[display("write capability denied: {_0}")]
    CapabilityDenied(String),
    /// The store (or the path to it) rejected this one record.
    #[display("record rejected: {_0}")]
    Rejected(String),
}

impl std::error::Error for InsertError {}

/// The platform's SMS database.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn insert(&self, record: &MessageRecord) -> Result<(), InsertError>;
}
