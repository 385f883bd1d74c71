use std::path::PathBuf;

use rinf::SignalPiece;
use serde::{Deserialize, Serialize};

pub const DEFAULT_FOLDER_LABEL: &str = "Backup Folder";

/// Motion timings shared by every screen transition and press animation.
///
/// Passed to the UI as a value; there is no mutable global copy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, SignalPiece)]
pub struct MotionConfig {
    pub screen_duration_ms: u32,
    pub fade_duration_ms: u32,
    pub slide_px: u32,
    pub pressed_scale: f32,
    pub press_duration_ms: u32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            screen_duration_ms: 260,
            fade_duration_ms: 180,
            slide_px: 60,
            pressed_scale: 0.96,
            press_duration_ms: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Linked backup folder, `None` until the user picks one
    #[serde(default)]
    pub backup_folder: Option<String>,
    #[serde(default = "default_folder_label")]
    pub backup_folder_label: String,
    pub adb_path: String,
    /// Target device serial, `None` to use the only connected device
    #[serde(default)]
    pub device_serial: Option<String>,
    /// Package that must hold the SMS role on the phone for restores to be accepted
    pub sms_package: String,
    #[serde(default)]
    pub motion: MotionConfig,
}

// Written by hand: the `SignalPiece` derive cannot parse `#[serde(default = "...")]`.
impl SignalPiece for Settings {
    fn be_signal_piece(&self) {
        SignalPiece::be_signal_piece(&self.backup_folder);
        SignalPiece::be_signal_piece(&self.backup_folder_label);
        SignalPiece::be_signal_piece(&self.adb_path);
        SignalPiece::be_signal_piece(&self.device_serial);
        SignalPiece::be_signal_piece(&self.sms_package);
        SignalPiece::be_signal_piece(&self.motion);
    }
}

impl Settings {
    pub fn backup_folder(&self) -> Option<PathBuf> {
        self.backup_folder.as_deref().filter(|s| !s.is_empty()).map(PathBuf::from)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backup_folder: None,
            backup_folder_label: default_folder_label(),
            adb_path: "adb".to_string(),
            device_serial: None,
            sms_package: "com.example.cloudbackupapp".to_string(),
            motion: MotionConfig::default(),
        }
    }
}

fn default_folder_label() -> String {
    DEFAULT_FOLDER_LABEL.to_string()
}
