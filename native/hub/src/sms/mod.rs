pub mod capability;
pub mod handler;
pub mod parser;
pub mod restore;
pub mod store;

pub use capability::{CapabilityGate, CapabilityRequester};
pub use handler::SmsRestoreHandler;
pub use restore::{RestoreCoordinator, RestoreOutcome, RestoreScope};
pub use store::{InsertError, MessageStore};
