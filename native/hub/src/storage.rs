use std::{
    io,
    path::{Component, Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use derive_more::Display;
use time::{OffsetDateTime, UtcOffset, macros::format_description};
use tokio::fs;
use tracing::{debug, instrument, trace};

use crate::models::signals::sms::SmsBackupEntry;

/// Category folders created inside a freshly linked backup folder
pub const APP_FOLDERS: [&str; 5] = ["Photos", "Videos", "SMS", "CallLogs", "Contacts"];
pub const SMS_FOLDER: &str = "SMS";

/// Opaque reference to a document inside the linked folder.
///
/// Always relative to the folder root, with `/` separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Display)]
pub struct DocumentRef(String);

impl DocumentRef {
    pub fn new(relative: impl Into<String>) -> Self {
        Self(relative.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Display)]
pub enum DocumentError {
    #[display("document not found: {_0}")]
    NotFound(DocumentRef),
    #[display("access denied: {_0}")]
    Denied(DocumentRef),
    #[display("failed to read document: {_0}")]
    Io(io::Error),
}

impl std::error::Error for DocumentError {}

/// Read access to documents by reference, without the caller knowing where they live.
#[async_trait]
pub trait DocumentAccess: Send + Sync {
    /// Reads the whole document. The underlying handle is closed before this returns.
    async fn read(&self, document: &DocumentRef) -> Result<Vec<u8>, DocumentError>;
}

/// Documents stored in a local (or provider-synced) folder picked by the user
#[derive(Debug, Clone)]
pub struct FolderDocumentAccess {
    root: PathBuf,
}

impl FolderDocumentAccess {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Maps a reference to a path, refusing anything that would leave the root.
    async fn resolve(&self, document: &DocumentRef) -> Result<PathBuf, DocumentError> {
        let relative = Path::new(document.as_str());
        let lexically_inside = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !lexically_inside || document.as_str().is_empty() {
            return Err(DocumentError::Denied(document.clone()));
        }

        let canon_root = fs::canonicalize(&self.root).await.map_err(|e| map_io(document, e))?;
        let canon_path = fs::canonicalize(self.root.join(relative))
            .await
            .map_err(|e| map_io(document, e))?;
        trace!(root = %canon_root.display(), path = %canon_path.display(), "Resolved document");

        // symlinks may still point outside
        if !canon_path.starts_with(&canon_root) {
            return Err(DocumentError::Denied(document.clone()));
        }
        Ok(canon_path)
    }
}

#[async_trait]
impl DocumentAccess for FolderDocumentAccess {
    #[instrument(level = "debug", skip_all, fields(document = %document), err)]
    async fn read(&self, document: &DocumentRef) -> Result<Vec<u8>, DocumentError> {
        let path = self.resolve(document).await?;
        let bytes = fs_err::tokio::read(&path).await.map_err(|e| map_io(document, e))?;
        debug!(len = bytes.len(), "Read document");
        Ok(bytes)
    }
}

fn map_io(document: &DocumentRef, error: io::Error) -> DocumentError {
    match error.kind() {
        io::ErrorKind::NotFound => DocumentError::NotFound(document.clone()),
        io::ErrorKind::PermissionDenied => DocumentError::Denied(document.clone()),
        _ => DocumentError::Io(error),
    }
}

/// Creates the category folders the app expects, leaving existing ones alone
#[instrument(skip_all, fields(root = %root.display()), err)]
pub async fn ensure_app_folders(root: &Path) -> Result<()> {
    ensure!(root.is_dir(), "Backup folder is not a directory: {}", root.display());
    for name in APP_FOLDERS {
        let dir = root.join(name);
        if !dir.is_dir() {
            debug!(path = %dir.display(), "Creating app folder");
            fs_err::tokio::create_dir_all(&dir).await?;
        }
    }
    Ok(())
}

/// Lists SMS backup files in the linked folder, newest first.
/// A folder without an `SMS` subfolder simply has no backups.
#[instrument(skip_all, fields(root = %root.display()), err)]
pub async fn list_sms_backups(root: &Path) -> Result<Vec<SmsBackupEntry>> {
    ensure!(root.is_dir(), "Backup folder does not exist: {}", root.display());
    let sms_dir = root.join(SMS_FOLDER);
    if !sms_dir.is_dir() {
        debug!("No SMS folder in linked folder");
        return Ok(Vec::new());
    }

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let mut entries = Vec::new();
    let mut rd = fs::read_dir(&sms_dir).await.context("Failed to read SMS folder")?;
    while let Some(entry) = rd.next_entry().await? {
        let meta = match entry.metadata().await {
            Ok(m) => m,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !meta.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let modified = meta.modified().ok();
        entries.push(SmsBackupEntry {
            document: format!("{SMS_FOLDER}/{name}"),
            name,
            size: meta.len(),
            modified: modified.map(system_time_to_millis).unwrap_or(0),
            modified_display: modified.map(|t| format_modified(t, offset)).unwrap_or_default(),
        });
    }

    entries.sort_by(|a, b| b.modified.cmp(&a.modified));
    debug!(count = entries.len(), "Listed SMS backups");
    Ok(entries)
}

fn system_time_to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

fn format_modified(time: SystemTime, offset: UtcOffset) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");
    OffsetDateTime::from(time).to_offset(offset).format(&fmt).unwrap_or_default()
}
