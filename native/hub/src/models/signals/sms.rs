use rinf::{DartSignal, RustSignal, SignalPiece};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, SignalPiece)]
pub struct SmsBackupEntry {
    pub name: String,
    /// Path relative to the linked folder, passed back in [`SmsRestoreRequest`]
    pub document: String,
    pub size: u64,
    /// Milliseconds since Unix epoch
    pub modified: u64,
    /// `yyyy-MM-dd HH:mm` in local time
    pub modified_display: String,
}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct ListSmsBackupsRequest {}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct ListSmsBackupsResponse {
    pub folder_linked: bool,
    pub entries: Vec<SmsBackupEntry>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, DartSignal)]
pub struct SmsRestoreRequest {
    pub document: String,
    /// Both bounds `None` restores everything
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, SignalPiece)]
pub enum RestoreOutcomeKind {
    Completed,
    CapabilityRequired,
    ParseError,
    DocumentUnavailable,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct SmsRestoreResponse {
    pub document: String,
    /// `None` when the request was rejected before an attempt started
    pub outcome: Option<RestoreOutcomeKind>,
    pub inserted: u32,
    pub skipped: u32,
    /// Short status line for the UI
    pub message: String,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct SmsCapabilityRequested {
    pub request_id: String,
    pub message: String,
}

/// Reported by the UI once the system role dialog returns
#[derive(Serialize, Deserialize, DartSignal)]
pub struct SmsCapabilityResult {
    pub request_id: String,
    pub granted: bool,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct SmsCapabilityStatus {
    pub granted: bool,
    pub message: String,
}
