use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use rinf::{DartSignal, RustSignal};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};
use uuid::Uuid;

use super::{
    CapabilityGate, CapabilityRequester, RestoreCoordinator, RestoreOutcome, RestoreScope,
    restore::load_records,
};
use crate::{
    adb::{AdbMessageStore, AdbRoleRequester, AdbShell, resolve_adb_path},
    models::{
        DateWindow, Settings,
        signals::{sms::*, system::Toast},
    },
    storage::{DocumentRef, FolderDocumentAccess, list_sms_backups},
};

const NO_FOLDER_MESSAGE: &str = "No backup folder linked. Pick one in Settings.";
const BUSY_MESSAGE: &str = "A restore is already running.";
const GRANT_TIMEOUT: Duration = Duration::from_secs(120);
const GRANT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Handles SMS backup listing and restore requests from the UI
#[derive(Debug)]
pub struct SmsRestoreHandler {
    settings: RwLock<Settings>,
    /// Held for the whole duration of a restore attempt
    restore_lock: Arc<Mutex<()>>,
    gate: CapabilityGate,
}

impl SmsRestoreHandler {
    pub fn start(mut settings_stream: WatchStream<Settings>) -> Arc<Self> {
        let initial_settings = futures::executor::block_on(settings_stream.next())
            .expect("Settings stream closed on SMS restore handler init");

        let handler = Arc::new(Self::new(initial_settings));

        // Watch settings updates
        {
            let handler = handler.clone();
            tokio::spawn(async move {
                while let Some(settings) = settings_stream.next().await {
                    debug!(folder = ?settings.backup_folder, "Settings updated for SMS restore");
                    *handler.settings.write().await = settings;
                }
                panic!("Settings stream closed for SmsRestoreHandler");
            });
        }

        // Start signal receivers
        {
            let handler = handler.clone();
            tokio::spawn(
                async move { handler.receive_signals().await }
                    .instrument(info_span!("task_sms_restore_handler")),
            );
        }

        handler
    }

    fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            restore_lock: Arc::new(Mutex::new(())),
            gate: CapabilityGate::new(),
        }
    }

    async fn receive_signals(self: Arc<Self>) {
        let list_receiver = ListSmsBackupsRequest::get_dart_signal_receiver();
        let restore_receiver = SmsRestoreRequest::get_dart_signal_receiver();
        let capability_receiver = SmsCapabilityResult::get_dart_signal_receiver();

        info!("Starting to listen for SMS restore requests");

        loop {
            tokio::select! {
                signal = list_receiver.recv() => {
                    if signal.is_some() {
                        debug!("Received ListSmsBackupsRequest");
                        self.list_backups().await.send_signal_to_dart();
                    } else {
                        panic!("ListSmsBackupsRequest receiver ended");
                    }
                }

                request = restore_receiver.recv() => {
                    if let Some(request) = request {
                        let request = request.message;
                        debug!(document = %request.document, "Received SmsRestoreRequest");
                        self.clone().handle_restore_request(request).await;
                    } else {
                        panic!("SmsRestoreRequest receiver ended");
                    }
                }

                result = capability_receiver.recv() => {
                    if let Some(result) = result {
                        let SmsCapabilityResult { request_id, granted } = result.message;
                        debug!(%request_id, granted, "Received SmsCapabilityResult");
                        match Uuid::parse_str(&request_id) {
                            Ok(id) => {
                                if let Some(status) = self.gate.on_capability_result(id, granted).await {
                                    send_capability_status(status.is_granted(), status.message());
                                }
                            }
                            Err(e) => warn!(%request_id, error = %e, "Malformed capability request id"),
                        }
                    } else {
                        panic!("SmsCapabilityResult receiver ended");
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn list_backups(&self) -> ListSmsBackupsResponse {
        let Some(folder) = self.settings.read().await.backup_folder() else {
            return ListSmsBackupsResponse { folder_linked: false, entries: vec![], error: None };
        };
        match list_sms_backups(&folder).await {
            Ok(entries) => ListSmsBackupsResponse { folder_linked: true, entries, error: None },
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to list SMS backups");
                ListSmsBackupsResponse {
                    folder_linked: true,
                    entries: vec![],
                    error: Some(format!("{e:#}")),
                }
            }
        }
    }

    /// Rejects the request right away if it cannot start, otherwise runs the attempt in its own
    /// task so the receiver loop stays responsive.
    async fn handle_restore_request(self: Arc<Self>, request: SmsRestoreRequest) {
        let settings = self.settings.read().await.clone();
        if settings.backup_folder().is_none() {
            info!("Restore requested without a linked folder");
            rejected_response(request.document, NO_FOLDER_MESSAGE).send_signal_to_dart();
            return;
        }
        let Some(guard) = self.try_begin_restore() else {
            info!(document = %request.document, "Restore requested while another is running");
            rejected_response(request.document, BUSY_MESSAGE).send_signal_to_dart();
            return;
        };

        tokio::spawn(async move {
            let document = request.document.clone();
            let response = match self.run_restore(&settings, request).await {
                Ok(response) => response,
                Err(e) => {
                    error!(error = %format!("{e:#}"), "Restore could not start");
                    rejected_response(document, &format!("Restore could not start: {e:#}"))
                }
            };
            drop(guard);
            response.send_signal_to_dart();
        });
    }

    fn try_begin_restore(&self) -> Option<OwnedMutexGuard<()>> {
        self.restore_lock.clone().try_lock_owned().ok()
    }

    #[instrument(skip_all, fields(document = %request.document), err)]
    async fn run_restore(
        self: &Arc<Self>,
        settings: &Settings,
        request: SmsRestoreRequest,
    ) -> Result<SmsRestoreResponse> {
        let folder = settings.backup_folder().context("No backup folder linked")?;
        let window = DateWindow::from_bounds(request.start_ms, request.end_ms);
        let scope = RestoreScope::of(window.as_ref());
        let document = DocumentRef::new(request.document);
        let documents = FolderDocumentAccess::new(folder);

        let adb_path = match resolve_adb_path(&settings.adb_path) {
            Ok(path) => path,
            Err(e) => {
                // problems with the backup itself are reported ahead of a missing adb
                if let Err(outcome) = load_records(&documents, &document, window.as_ref()).await {
                    return Ok(restore_response(document.to_string(), &outcome, scope));
                }
                return Err(e);
            }
        };
        let shell = Arc::new(AdbShell::new(adb_path, settings.device_serial.clone()));
        let coordinator = RestoreCoordinator::new(documents, AdbMessageStore::new(shell.clone()));

        let outcome = coordinator.attempt_restore(&document, window).await;
        if matches!(outcome, RestoreOutcome::CapabilityRequired { .. }) {
            self.clone().start_capability_flow(shell, settings.sms_package.clone());
        }
        Ok(restore_response(document.to_string(), &outcome, scope))
    }

    /// Shows the grant prompt and watches the device for the answer. The restore is never
    /// retried from here; the user starts it again.
    fn start_capability_flow(self: Arc<Self>, shell: Arc<AdbShell>, package: String) {
        tokio::spawn(
            async move {
                let requester = match AdbRoleRequester::new(shell, package) {
                    Ok(requester) => requester,
                    Err(e) => return report_prompt_failure(&e),
                };
                let request = match self.gate.request_capability(&requester).await {
                    Ok(request) => request,
                    Err(e) => return report_prompt_failure(&e),
                };
                SmsCapabilityRequested {
                    request_id: request.id.to_string(),
                    message: "Confirm this app as the default SMS app on the phone.".to_string(),
                }
                .send_signal_to_dart();

                let requester: &dyn CapabilityRequester = &requester;
                if let Some(status) = self
                    .gate
                    .watch_for_grant(requester, &request, GRANT_TIMEOUT, GRANT_POLL_INTERVAL)
                    .await
                {
                    send_capability_status(status.is_granted(), status.message());
                }
            }
            .instrument(info_span!("task_sms_capability")),
        );
    }
}

fn report_prompt_failure(e: &anyhow::Error) {
    error!(error = %format!("{e:#}"), "Failed to request default SMS role");
    Toast::send(
        "Default SMS".to_string(),
        format!("Could not open the default SMS prompt: {e:#}"),
        true,
        None,
    );
}

fn send_capability_status(granted: bool, message: &str) {
    SmsCapabilityStatus { granted, message: message.to_string() }.send_signal_to_dart();
}

fn restore_response(
    document: String,
    outcome: &RestoreOutcome,
    scope: RestoreScope,
) -> SmsRestoreResponse {
    SmsRestoreResponse {
        document,
        outcome: Some(outcome.kind()),
        inserted: signal_count(outcome.inserted()),
        skipped: signal_count(outcome.skipped()),
        message: outcome.status_message(scope),
    }
}

fn signal_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

fn rejected_response(document: String, message: &str) -> SmsRestoreResponse {
    SmsRestoreResponse { document, outcome: None, inserted: 0, skipped: 0, message: message.into() }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn response_carries_outcome_counts_and_message() {
        let outcome = RestoreOutcome::Completed { inserted: 4, skipped: 1 };
        let response = restore_response("SMS/a.xml".into(), &outcome, RestoreScope::Range);
        assert_eq!(response.outcome, Some(RestoreOutcomeKind::Completed));
        assert_eq!(response.inserted, 4);
        assert_eq!(response.skipped, 1);
        assert_eq!(response.message, "Restore completed (range): 4 messages restored, 1 skipped.");

        let outcome = RestoreOutcome::CapabilityRequired { inserted: 2 };
        let response = restore_response("SMS/a.xml".into(), &outcome, RestoreScope::All);
        assert_eq!(response.outcome, Some(RestoreOutcomeKind::CapabilityRequired));
        assert_eq!(response.inserted, 2);
    }

    #[test]
    fn counts_saturate_instead_of_wrapping() {
        assert_eq!(signal_count(7), 7);
        assert_eq!(signal_count(u32::MAX as usize), u32::MAX);
        assert_eq!(signal_count(usize::MAX), u32::MAX);
    }

    fn settings_without_adb(folder: &std::path::Path) -> Settings {
        Settings {
            backup_folder: Some(folder.to_string_lossy().into_owned()),
            adb_path: "/nonexistent/adb".into(),
            sms_package: "not a package".into(),
            ..Settings::default()
        }
    }

    fn restore_request(document: &str) -> SmsRestoreRequest {
        SmsRestoreRequest { document: document.into(), start_ms: None, end_ms: None }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn backup_problems_are_reported_without_adb() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("SMS")).unwrap();
        std::fs::write(dir.path().join("SMS/broken.xml"), b"not a backup").unwrap();
        let settings = settings_without_adb(dir.path());
        let handler = Arc::new(SmsRestoreHandler::new(settings.clone()));

        let response =
            handler.run_restore(&settings, restore_request("SMS/missing.xml")).await.unwrap();
        assert_eq!(response.outcome, Some(RestoreOutcomeKind::DocumentUnavailable));

        let response =
            handler.run_restore(&settings, restore_request("SMS/broken.xml")).await.unwrap();
        assert_eq!(response.outcome, Some(RestoreOutcomeKind::ParseError));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_adb_fails_a_readable_backup() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("SMS")).unwrap();
        std::fs::write(dir.path().join("SMS/ok.xml"), br#"<smses><sms date="1" /></smses>"#)
            .unwrap();
        let settings = settings_without_adb(dir.path());
        let handler = Arc::new(SmsRestoreHandler::new(settings.clone()));

        let Err(err) = handler.run_restore(&settings, restore_request("SMS/ok.xml")).await else {
            panic!("restore should not start without adb");
        };
        assert!(format!("{err:#}").contains("ADB binary not found"), "{err:#}");
    }

    #[test]
    fn rejected_response_has_no_outcome() {
        let response = rejected_response("SMS/a.xml".into(), BUSY_MESSAGE);
        assert_eq!(response.outcome, None);
        assert_eq!(response.message, BUSY_MESSAGE);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_one_restore_runs_at_a_time() {
        let handler = SmsRestoreHandler::new(Settings::default());
        let guard = handler.try_begin_restore().expect("first restore should start");
        assert!(handler.try_begin_restore().is_none());
        drop(guard);
        assert!(handler.try_begin_restore().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listing_without_linked_folder_reports_unlinked() {
        let handler = SmsRestoreHandler::new(Settings::default());
        let response = handler.list_backups().await;
        assert!(!response.folder_linked);
        assert!(response.entries.is_empty());
        assert!(response.error.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listing_reads_linked_folder() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("SMS")).unwrap();
        std::fs::write(dir.path().join("SMS/sms-1.xml"), b"<smses/>").unwrap();
        let settings = Settings {
            backup_folder: Some(dir.path().to_string_lossy().into_owned()),
            ..Settings::default()
        };

        let response = SmsRestoreHandler::new(settings).list_backups().await;
        assert!(response.folder_linked);
        assert_eq!(response.entries.len(), 1);
        assert_eq!(response.entries[0].document, "SMS/sms-1.xml");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn listing_missing_folder_reports_error() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            backup_folder: Some(dir.path().join("gone").to_string_lossy().into_owned()),
            ..Settings::default()
        };
        let response = SmsRestoreHandler::new(settings).list_backups().await;
        assert!(response.folder_linked);
        assert!(response.error.is_some());
    }
}
