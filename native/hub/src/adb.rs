//! Access to the phone's SMS store over ADB.
//!
//! Rows are written with the `content` shell tool against `content://sms`. The platform only
//! accepts those writes while [`Settings::sms_package`](crate::models::Settings) holds the
//! default SMS role, so the role is checked and requested here as well.

use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow, bail, ensure};
use async_trait::async_trait;
use derive_more::Debug;
use lazy_regex::{Lazy, Regex, lazy_regex};
use tokio::{process::Command, time::timeout};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::{
    models::MessageRecord,
    sms::{CapabilityRequester, InsertError, MessageStore},
};

pub static PACKAGE_NAME_REGEX: Lazy<Regex> = lazy_regex!(r"^(?:[A-Za-z]{1}[\w]*\.)+[A-Za-z][\w]*$");
static CAPABILITY_DENIED_REGEX: Lazy<Regex> =
    lazy_regex!(r"SecurityException|Permission Denial|not allowed to (?:write|insert)");
static SHELL_ERROR_REGEX: Lazy<Regex> = lazy_regex!(r"(?m)^Error|Exception");

const SMS_URI: &str = "content://sms";
const SMS_ROLE: &str = "android.app.role.SMS";
/// First SDK level where the SMS role replaced `ACTION_CHANGE_DEFAULT`
const ROLE_MANAGER_SDK: u32 = 29;

/// Validates a package name and returns an error if invalid
pub fn ensure_valid_package(package_name: &str) -> Result<()> {
    ensure!(PACKAGE_NAME_REGEX.is_match(package_name), "Invalid package name: '{}'", package_name);
    Ok(())
}

/// Finds the adb binary: either an explicit path or a name looked up on `PATH`
#[instrument(level = "debug", ret, err)]
pub fn resolve_adb_path(adb_path: &str) -> Result<PathBuf> {
    let adb_path = if adb_path.is_empty() { "adb" } else { adb_path };
    which::which(adb_path).with_context(|| format!("ADB binary not found: {adb_path}"))
}

/// Runs shell commands on one device through the adb client binary
#[derive(Debug, Clone)]
pub struct AdbShell {
    adb_path: PathBuf,
    serial: Option<String>,
    command_timeout: Duration,
}

impl AdbShell {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new(adb_path: PathBuf, serial: Option<String>) -> Self {
        Self { adb_path, serial, command_timeout: Self::DEFAULT_TIMEOUT }
    }

    /// Executes a shell command on the device and returns stdout followed by stderr
    #[instrument(level = "debug", skip(self), err, ret)]
    pub async fn shell(&self, command: &str) -> Result<String> {
        let mut cmd = Command::new(&self.adb_path);
        if let Some(serial) = &self.serial {
            cmd.arg("-s").arg(serial);
        }
        cmd.arg("shell").arg(command);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        #[cfg(target_os = "windows")]
        // CREATE_NO_WINDOW
        cmd.creation_flags(0x08000000);

        let output = timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| anyhow!("Timed out after {:?}: {command}", self.command_timeout))?
            .context("Failed to run adb")?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        trace!(status = ?output.status, "Shell command executed");
        if !output.status.success() && text.trim().is_empty() {
            bail!("adb exited with {}", output.status);
        }
        Ok(text)
    }

    /// Executes a shell command and fails if exit code is non-zero.
    /// Appends `; printf '\n%s' $?` and parses the final line as the exit status.
    #[instrument(level = "debug", skip(self), err, ret)]
    pub async fn shell_checked(&self, command: &str) -> Result<String> {
        let shell_output = self
            .shell(&format!("{command} ; printf '\\n%s' $?"))
            .await
            .with_context(|| format!("Failed to execute checked shell command: {command}"))?;
        let (output, exit_code) = split_exit_code(&shell_output)?;
        if exit_code != "0" {
            error!(exit_code, output, "Shell command returned non-zero exit code");
            bail!("Command {command} failed with exit code {exit_code}. Output: {output}");
        }
        Ok(output.to_string())
    }

    /// Android SDK level of the device
    pub async fn sdk_level(&self) -> Result<u32> {
        let output = self.shell_checked("getprop ro.build.version.sdk").await?;
        output.trim().parse().with_context(|| format!("Unexpected SDK level: {output:?}"))
    }
}

fn split_exit_code(shell_output: &str) -> Result<(&str, &str)> {
    match shell_output.rsplit_once('\n') {
        Some((output, code)) => Ok((output, code.trim())),
        None => {
            let trimmed = shell_output.trim();
            if !trimmed.is_empty() && trimmed.chars().all(|c| c.is_ascii_digit()) {
                Ok(("", trimmed))
            } else {
                Err(anyhow!("Failed to extract exit code"))
            }
        }
    }
}

/// Quotes a value for the device's `sh`
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Builds the `content insert` command for one record. Absent optional columns are left out so
/// the provider applies its own defaults.
pub fn insert_command(record: &MessageRecord) -> String {
    let mut binds: Vec<String> = Vec::with_capacity(7);
    if let Some(address) = &record.address {
        binds.push(format!("address:s:{address}"));
    }
    if let Some(body) = &record.body {
        binds.push(format!("body:s:{body}"));
    }
    binds.push(format!("date:l:{}", record.date));
    if let Some(date_sent) = record.date_sent {
        binds.push(format!("date_sent:l:{date_sent}"));
    }
    if let Some(message_type) = record.message_type {
        binds.push(format!("type:i:{message_type}"));
    }
    if let Some(read) = record.read {
        binds.push(format!("read:i:{read}"));
    }
    if let Some(seen) = record.seen {
        binds.push(format!("seen:i:{seen}"));
    }

    let mut command = format!("content insert --uri {SMS_URI}");
    for bind in binds {
        command.push_str(" --bind ");
        command.push_str(&shell_quote(&bind));
    }
    command
}

/// Maps `content insert` output to the store's error taxonomy
fn classify_insert_output(output: &str) -> Result<(), InsertError> {
    let output = output.trim();
    if CAPABILITY_DENIED_REGEX.is_match(output) {
        Err(InsertError::CapabilityDenied(first_line(output)))
    } else if SHELL_ERROR_REGEX.is_match(output) {
        Err(InsertError::Rejected(first_line(output)))
    } else {
        Ok(())
    }
}

fn first_line(output: &str) -> String {
    output.lines().next().unwrap_or_default().to_string()
}

/// Parses `cmd role get-role-holders` output (one package per line)
fn role_holders(output: &str) -> Vec<&str> {
    output.lines().map(str::trim).filter(|l| PACKAGE_NAME_REGEX.is_match(l)).collect()
}

/// The phone's `content://sms` provider
#[derive(Debug, Clone)]
pub struct AdbMessageStore {
    shell: Arc<AdbShell>,
}

impl AdbMessageStore {
    pub fn new(shell: Arc<AdbShell>) -> Self {
        Self { shell }
    }
}

#[async_trait]
impl MessageStore for AdbMessageStore {
    #[instrument(level = "trace", skip_all, fields(date = record.date))]
    async fn insert(&self, record: &MessageRecord) -> Result<(), InsertError> {
        let output = self.shell.shell(&insert_command(record)).await.map_err(|e| {
            warn!(error = %format!("{e:#}"), "content insert did not run");
            InsertError::Rejected(format!("{e:#}"))
        })?;
        classify_insert_output(&output)
    }
}

/// Checks and requests the default SMS role for a package on the phone
#[derive(Debug, Clone)]
pub struct AdbRoleRequester {
    #[debug(skip)]
    shell: Arc<AdbShell>,
    package: String,
}

impl AdbRoleRequester {
    pub fn new(shell: Arc<AdbShell>, package: String) -> Result<Self> {
        ensure_valid_package(&package)?;
        Ok(Self { shell, package })
    }

    /// Intent that prompts the user to make `package` the default SMS app.
    /// Newer releases only allow the app itself to ask for the role, so those get the default
    /// apps screen instead.
    fn prompt_command(&self, sdk_level: u32) -> String {
        if sdk_level >= ROLE_MANAGER_SDK {
            "am start -a android.settings.MANAGE_DEFAULT_APPS_SETTINGS".to_string()
        } else {
            format!(
                "am start -a android.provider.Telephony.ACTION_CHANGE_DEFAULT --es package {}",
                self.package
            )
        }
    }
}

#[async_trait]
impl CapabilityRequester for AdbRoleRequester {
    #[instrument(level = "debug", skip(self), fields(package = %self.package), ret, err)]
    async fn is_granted(&self) -> Result<bool> {
        let output = self
            .shell
            .shell_checked(&format!("cmd role get-role-holders {SMS_ROLE}"))
            .await
            .context("Failed to query SMS role holders")?;
        Ok(role_holders(&output).contains(&self.package.as_str()))
    }

    #[instrument(level = "debug", skip(self), fields(package = %self.package), err)]
    async fn request(&self) -> Result<()> {
        let sdk_level = self.shell.sdk_level().await.unwrap_or_else(|e| {
            debug!(error = %format!("{e:#}"), "Could not read SDK level, assuming recent device");
            ROLE_MANAGER_SDK
        });
        let output = self.shell.shell_checked(&self.prompt_command(sdk_level)).await?;
        if SHELL_ERROR_REGEX.is_match(&output) {
            bail!("Failed to show default SMS prompt: {}", first_line(output.trim()));
        }
        info!(sdk_level, "Default SMS prompt shown on device");
        Ok(())
    }
}
