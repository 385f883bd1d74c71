use std::{
    error::Error,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, ensure};
use rinf::{DartSignal, RustSignal};
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, instrument, trace, warn};

use crate::{
    models::{
        DEFAULT_FOLDER_LABEL, Settings,
        signals::{settings::*, storage::*},
    },
    storage::ensure_app_folders,
};

/// Handles application settings and the linked backup folder
#[derive(Debug, Clone)]
pub struct SettingsHandler {
    settings_file_path: PathBuf,
    watch_tx: watch::Sender<Settings>,
}

impl SettingsHandler {
    #[instrument(skip(app_dir))]
    pub fn new(app_dir: PathBuf) -> Arc<Self> {
        let watch_tx = watch::Sender::<Settings>::new(Settings::default());
        let handler =
            Arc::new(Self { settings_file_path: app_dir.join("settings.json"), watch_tx });

        let settings = match read_settings_file(&handler.settings_file_path) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = e.as_ref() as &dyn Error, "Failed to load settings, using defaults.");
                Settings::default()
            }
        };
        handler.on_settings_change(settings, None);

        // Start receiving settings requests
        tokio::spawn({
            let handler = handler.clone();
            async move {
                handler.receive_settings_requests().await;
            }
            .instrument(info_span!("task_settings_handler"))
        });

        handler
    }

    async fn receive_settings_requests(&self) {
        let load_receiver = LoadSettingsRequest::get_dart_signal_receiver();
        let save_receiver = SaveSettingsRequest::get_dart_signal_receiver();
        let reset_receiver = ResetSettingsToDefaultsRequest::get_dart_signal_receiver();
        let link_receiver = LinkFolderRequest::get_dart_signal_receiver();

        info!("Starting to listen for settings requests");

        loop {
            tokio::select! {
                Some(_) = load_receiver.recv() => {
                    info!("Received LoadSettingsRequest");
                    match read_settings_file(&self.settings_file_path) {
                        Ok(settings) => self.on_settings_change(settings, None),
                        Err(e) => {
                            error!(error = e.as_ref() as &dyn Error, "Failed to load settings, using defaults");
                            self.on_settings_change(
                                Settings::default(),
                                Some(format!("Failed to load settings: {e:#}")),
                            );
                        }
                    }
                },
                Some(signal_pack) = save_receiver.recv() => {
                    info!("Received SaveSettingsRequest");
                    let settings = signal_pack.message.settings;
                    let result = self.save_settings(&settings);
                    if let Err(e) = &result {
                        error!(error = e.as_ref() as &dyn Error, "Failed to save settings");
                    }
                    SettingsSavedEvent { error: result.err().map(|e| format!("Failed to save settings: {e:#}")) }
                        .send_signal_to_dart();
                },
                Some(_) = reset_receiver.recv() => {
                    info!("Received ResetSettingsToDefaultsRequest");
                    // The linked folder is user data, keep it across a reset
                    let current = self.watch_tx.borrow().clone();
                    let settings = Settings {
                        backup_folder: current.backup_folder,
                        backup_folder_label: current.backup_folder_label,
                        ..Settings::default()
                    };
                    let result = self.save_settings(&settings);
                    if let Err(e) = &result {
                        error!(error = e.as_ref() as &dyn Error, "Failed to reset settings");
                    }
                    SettingsSavedEvent { error: result.err().map(|e| format!("Failed to reset settings: {e:#}")) }
                        .send_signal_to_dart();
                },
                Some(signal_pack) = link_receiver.recv() => {
                    let LinkFolderRequest { path, label } = signal_pack.message;
                    info!(%path, "Received LinkFolderRequest");
                    let error = self.link_folder(&path, label).await.err().map(|e| {
                        error!(%path, error = %format!("{e:#}"), "Failed to link backup folder");
                        format!("{e:#}")
                    });
                    LinkFolderResponse { path, error }.send_signal_to_dart();
                },
                else => {
                    error!("All settings request channels closed");
                    break;
                }
            }
        }
        panic!("Settings request receiver loop ended");
    }

    /// Handle settings change
    ///
    /// # Arguments
    ///
    /// * `settings` - The new settings
    /// * `error` - An optional error message for the UI
    #[instrument(skip(self, settings, error))]
    fn on_settings_change(&self, settings: Settings, error: Option<String>) {
        trace!("on_settings_change called");
        self.watch_tx.send_if_modified(|s| {
            if s != &settings {
                debug!(settings = ?settings, "Active settings changed");
                *s = settings.clone();
                SettingsChangedEvent { settings, error }.send_signal_to_dart();
                true
            } else {
                trace!("Settings unchanged, not sending event");
                false
            }
        });
    }

    /// Create a receiver for settings changes
    pub fn subscribe(&self) -> watch::Receiver<Settings> {
        self.watch_tx.subscribe()
    }

    /// Persist settings and publish them to subscribers
    #[instrument(skip(self, settings))]
    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        write_settings_file(&self.settings_file_path, settings)?;
        self.on_settings_change(settings.clone(), None);
        Ok(())
    }

    /// Links a folder picked by the user and prepares its category folders
    #[instrument(skip(self, label), err)]
    async fn link_folder(&self, path: &str, label: Option<String>) -> Result<()> {
        let root = Path::new(path);
        ensure!(root.is_dir(), "Not a folder: {path}");
        ensure_app_folders(root).await?;

        let label = label
            .filter(|l| !l.trim().is_empty())
            .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| DEFAULT_FOLDER_LABEL.to_string());
        let settings = Settings {
            backup_folder: Some(path.to_string()),
            backup_folder_label: label,
            ..self.watch_tx.borrow().clone()
        };
        self.save_settings(&settings)?;
        info!(%path, "Backup folder linked");
        Ok(())
    }
}

/// Load settings from file or return defaults if file doesn't exist
#[instrument(skip_all, fields(path = %path.display()))]
fn read_settings_file(path: &Path) -> Result<Settings> {
    if !path.exists() {
        info!("Settings file doesn't exist, using defaults");
        return Ok(Settings::default());
    }

    info!("Loading settings from file");
    let file_content = fs_err::read_to_string(path).context("Failed to read settings file")?;
    let settings: Settings =
        serde_json::from_str(&file_content).context("Failed to parse settings file")?;

    debug!("Loaded application settings successfully");
    Ok(settings)
}

/// Save settings to file
#[instrument(skip_all, fields(path = %path.display()))]
fn write_settings_file(path: &Path, settings: &Settings) -> Result<()> {
    info!("Saving settings to file");
    let settings_json =
        serde_json::to_string_pretty(settings).context("Failed to serialize settings")?;

    // Ensure parent directory exists
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        info!(path = %parent.display(), "Creating settings directory");
        fs_err::create_dir_all(parent).context("Failed to create settings directory")?;
    }

    fs_err::write(path, settings_json).context("Failed to write settings file")?;

    info!("Saved application settings successfully");
    Ok(())
}
