//! This `hub` crate is the
//! entry point of the Rust logic.

use std::path::PathBuf;

use anyhow::{Context, Result};
use mimalloc::MiMalloc;
use models::signals::system::RustPanic;
use rinf::RustSignal;
use settings::SettingsHandler;
use sms::SmsRestoreHandler;
use tokio_stream::wrappers::WatchStream;
use tracing::{error, info};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

rinf::write_interface!();

pub mod adb;
pub mod logging;
pub mod models;
pub mod settings;
pub mod sms;
pub mod storage;

const APP_DIR_NAME: &str = "BackupVault";

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let original_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::force_capture();
        let message = format!("{panic_info}\n{backtrace}");
        error!(message, "Rust panic");
        RustPanic { message }.send_signal_to_dart();
        original_hook(panic_info);
    }));

    let app_dir = match prepare_app_dir() {
        Ok(dir) => dir,
        Err(e) => {
            rinf::debug_print!("Failed to prepare app directory: {:#}", e);
            return;
        }
    };

    let _guard = logging::setup_logging(&app_dir.join("logs"));
    if let Err(e) = &_guard {
        rinf::debug_print!("Failed to setup logging: {:#}", e);
    }

    info!(app_dir = %app_dir.display(), "Starting backup vault backend");

    let settings_handler = SettingsHandler::new(app_dir);
    let _sms_handler = SmsRestoreHandler::start(WatchStream::new(settings_handler.subscribe()));

    // Keep the main function running until Dart shutdown.
    rinf::dart_shutdown().await;
}

/// Creates the app's data directory and makes it the working directory
fn prepare_app_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("Failed to get data directory")?;
    let app_dir = if cfg!(target_os = "macos") {
        data_dir.join("com.example.BackupVault")
    } else {
        data_dir.join(APP_DIR_NAME)
    };
    fs_err::create_dir_all(&app_dir).context("Failed to create app directory")?;
    std::env::set_current_dir(&app_dir).context("Failed to set current working directory")?;
    Ok(app_dir)
}
