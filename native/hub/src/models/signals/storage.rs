use rinf::{DartSignal, RustSignal};
use serde::{Deserialize, Serialize};

/// Sent after the user picked a folder with the system folder picker
#[derive(Serialize, Deserialize, DartSignal)]
pub struct LinkFolderRequest {
    pub path: String,
    pub label: Option<String>,
}

#[derive(Serialize, Deserialize, RustSignal)]
pub struct LinkFolderResponse {
    pub path: String,
    pub error: Option<String>,
}
