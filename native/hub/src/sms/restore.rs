use derive_more::Display;
use tracing::{debug, info, instrument, warn};

use super::{
    parser::parse_backup,
    store::{InsertError, MessageStore},
};
use crate::{
    models::{DateWindow, MessageRecord, signals::sms::RestoreOutcomeKind},
    storage::{DocumentAccess, DocumentRef},
};

/// How a restore attempt ended. Every failure inside an attempt ends up here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// All selected records were offered to the store. `skipped` records were rejected
    /// individually and are not in the store.
    Completed { inserted: usize, skipped: usize },
    /// The store refused writes for lack of the default SMS role. The `inserted` records that
    /// went in before the refusal stay there; nothing is rolled back.
    CapabilityRequired { inserted: usize },
    /// The backup is not well-formed. Nothing was written.
    ParseError(String),
    /// The backup could not be opened. Nothing was written.
    DocumentUnavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RestoreScope {
    #[display("all")]
    All,
    #[display("range")]
    Range,
}

impl RestoreScope {
    pub fn of(window: Option<&DateWindow>) -> Self {
        if window.is_some() { Self::Range } else { Self::All }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
enum RestorePhase {
    #[display("opening")]
    Opening,
    #[display("parsing")]
    Parsing,
    #[display("filtering")]
    Filtering,
    #[display("writing")]
    Writing,
}

impl RestoreOutcome {
    pub fn kind(&self) -> RestoreOutcomeKind {
        match self {
            Self::Completed { .. } => RestoreOutcomeKind::Completed,
            Self::CapabilityRequired { .. } => RestoreOutcomeKind::CapabilityRequired,
            Self::ParseError(_) => RestoreOutcomeKind::ParseError,
            Self::DocumentUnavailable(_) => RestoreOutcomeKind::DocumentUnavailable,
        }
    }

    pub fn inserted(&self) -> usize {
        match self {
            Self::Completed { inserted, .. } | Self::CapabilityRequired { inserted } => *inserted,
            Self::ParseError(_) | Self::DocumentUnavailable(_) => 0,
        }
    }

    pub fn skipped(&self) -> usize {
        match self {
            Self::Completed { skipped, .. } => *skipped,
            _ => 0,
        }
    }

    /// One-line status for the UI
    pub fn status_message(&self, scope: RestoreScope) -> String {
        match self {
            Self::Completed { inserted, skipped: 0 } => {
                format!("Restore completed ({scope}): {inserted} messages restored.")
            }
            Self::Completed { inserted, skipped } => format!(
                "Restore completed ({scope}): {inserted} messages restored, {skipped} skipped."
            ),
            Self::CapabilityRequired { inserted: 0 } => {
                "Set this app as the default SMS app to restore messages.".to_string()
            }
            Self::CapabilityRequired { inserted } => format!(
                "Set this app as the default SMS app to finish the restore ({inserted} messages \
                 were already restored)."
            ),
            Self::ParseError(e) => format!("Backup file could not be read: {e}"),
            Self::DocumentUnavailable(e) => format!("Backup file could not be opened: {e}"),
        }
    }
}

/// Keeps records inside `window`, preserving their order.
pub fn filter_records(
    records: Vec<MessageRecord>,
    window: Option<&DateWindow>,
) -> Vec<MessageRecord> {
    match window {
        Some(window) => records.into_iter().filter(|r| window.contains(r.date)).collect(),
        None => records,
    }
}

/// Opens, parses and filters a backup. Nothing is written; a failure comes back as the outcome
/// the attempt ends with.
pub async fn load_records<D: DocumentAccess + ?Sized>(
    documents: &D,
    document: &DocumentRef,
    window: Option<&DateWindow>,
) -> Result<Vec<MessageRecord>, RestoreOutcome> {
    debug!(phase = %RestorePhase::Opening, "Restore phase");
    let bytes = documents.read(document).await.map_err(|e| {
        warn!(error = %e, "Backup document unavailable");
        RestoreOutcome::DocumentUnavailable(e.to_string())
    })?;

    debug!(phase = %RestorePhase::Parsing, len = bytes.len(), "Restore phase");
    let records = match tokio::task::spawn_blocking(move || parse_backup(&bytes)).await {
        Ok(Ok(records)) => records,
        Ok(Err(e)) => {
            warn!(error = %e, "Backup document is malformed");
            return Err(RestoreOutcome::ParseError(e.to_string()));
        }
        Err(e) => {
            warn!(error = %e, "Parser task failed");
            return Err(RestoreOutcome::ParseError(format!("parser task failed: {e}")));
        }
    };

    debug!(phase = %RestorePhase::Filtering, parsed = records.len(), ?window, "Restore phase");
    Ok(filter_records(records, window))
}

/// Runs restore attempts against a document source and a message store.
///
/// Holds no state between attempts: a retry after a capability grant starts over from the
/// beginning of the document. Two attempts running at once are not coordinated here.
#[derive(Debug)]
pub struct RestoreCoordinator<D, S> {
    documents: D,
    store: S,
}

impl<D: DocumentAccess, S: MessageStore> RestoreCoordinator<D, S> {
    pub fn new(documents: D, store: S) -> Self {
        Self { documents, store }
    }

    #[instrument(skip(self, document), fields(document = %document))]
    pub async fn attempt_restore(
        &self,
        document: &DocumentRef,
        window: Option<DateWindow>,
    ) -> RestoreOutcome {
        let records = match load_records(&self.documents, document, window.as_ref()).await {
            Ok(records) => records,
            Err(outcome) => return outcome,
        };

        debug!(phase = %RestorePhase::Writing, selected = records.len(), "Restore phase");
        let outcome = self.write_all(&records).await;
        info!(?outcome, "Restore attempt finished");
        outcome
    }

    /// Inserts records one at a time, in order. Stops at the first capability denial.
    async fn write_all(&self, records: &[MessageRecord]) -> RestoreOutcome {
        let mut inserted = 0;
        let mut skipped = 0;
        for (index, record) in records.iter().enumerate() {
            match self.store.insert(record).await {
                Ok(()) => inserted += 1,
                Err(InsertError::CapabilityDenied(reason)) => {
                    warn!(index, inserted, %reason, "Message store denied write capability");
                    return RestoreOutcome::CapabilityRequired { inserted };
                }
                Err(InsertError::Rejected(reason)) => {
                    warn!(index, date = record.date, %reason, "Skipping rejected record");
                    skipped += 1;
                }
            }
        }
        RestoreOutcome::Completed { inserted, skipped }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::storage::DocumentError;

    struct MemoryDocuments(HashMap<String, Vec<u8>>);

    impl MemoryDocuments {
        fn with(name: &str, content: &str) -> Self {
            Self(HashMap::from([(name.to_string(), content.as_bytes().to_vec())]))
        }
    }

    #[async_trait]
    impl DocumentAccess for MemoryDocuments {
        async fn read(&self, document: &DocumentRef) -> Result<Vec<u8>, DocumentError> {
            self.0
                .get(document.as_str())
                .cloned()
                .ok_or_else(|| DocumentError::NotFound(document.clone()))
        }
    }

    /// Records every accepted insert; scripted failures by 1-based attempt number.
    #[derive(Clone, Default)]
    struct RecordingStore {
        committed: Arc<Mutex<Vec<MessageRecord>>>,
        attempts: Arc<Mutex<usize>>,
        fail_on: Arc<HashMap<usize, InsertError>>,
    }

    impl RecordingStore {
        fn failing(failures: impl IntoIterator<Item = (usize, InsertError)>) -> Self {
            Self { fail_on: Arc::new(failures.into_iter().collect()), ..Default::default() }
        }

        fn committed(&self) -> Vec<MessageRecord> {
            self.committed.lock().unwrap().clone()
        }

        fn attempts(&self) -> usize {
            *self.attempts.lock().unwrap()
        }
    }

    #[async_trait]
    impl MessageStore for RecordingStore {
        async fn insert(&self, record: &MessageRecord) -> Result<(), InsertError> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                *attempts += 1;
                *attempts
            };
            if let Some(err) = self.fail_on.get(&attempt) {
                return Err(err.clone());
            }
            self.committed.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn backup(dates: &[&str]) -> String {
        let body: String = dates
            .iter()
            .enumerate()
            .map(|(i, d)| format!(r#"<sms address="+1555010{i}" body="m{i}" date="{d}" type="1" />"#))
            .collect();
        format!("<smses count=\"{}\">{body}</smses>", dates.len())
    }

    fn coordinator(
        content: &str,
        store: RecordingStore,
    ) -> RestoreCoordinator<MemoryDocuments, RecordingStore> {
        RestoreCoordinator::new(MemoryDocuments::with("SMS/backup.xml", content), store)
    }

    fn doc() -> DocumentRef {
        DocumentRef::new("SMS/backup.xml")
    }

    #[test_log::test(tokio::test(flavor = "multi_thread"))]
    async fn restores_everything_in_document_order() {
        let store = RecordingStore::default();
        let outcome = coordinator(&backup(&["300", "100", "200"]), store.clone())
            .attempt_restore(&doc(), None)
            .await;

        assert_eq!(outcome, RestoreOutcome::Completed { inserted: 3, skipped: 0 });
        let bodies: Vec<_> = store.committed().into_iter().filter_map(|r| r.body).collect();
        assert_eq!(bodies, ["m0", "m1", "m2"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unparsable_date_becomes_zero_without_failing_the_document() {
        let store = RecordingStore::default();
        let outcome = coordinator(&backup(&["10", "abc", "30"]), store.clone())
            .attempt_restore(&doc(), None)
            .await;

        assert_eq!(outcome, RestoreOutcome::Completed { inserted: 3, skipped: 0 });
        let dates: Vec<_> = store.committed().iter().map(|r| r.date).collect();
        assert_eq!(dates, [10, 0, 30]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn emoji_and_bad_references_still_restore() {
        let store = RecordingStore::default();
        let content = r#"<smses count="3">
            <sms address="1" date="5" body="hi &#55357;&#56832;" />
            <sms address="2" date="6" body="broken &#55357; &bogus;" />
            <sms address="3" date="7" body="ok" />
        </smses>"#;
        let outcome = coordinator(content, store.clone()).attempt_restore(&doc(), None).await;

        assert_eq!(outcome, RestoreOutcome::Completed { inserted: 3, skipped: 0 });
        let bodies: Vec<_> = store.committed().into_iter().filter_map(|r| r.body).collect();
        assert_eq!(bodies, ["hi \u{1F600}", "broken &#55357; &bogus;", "ok"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn only_records_inside_window_are_written() {
        let store = RecordingStore::default();
        let outcome = coordinator(&backup(&["500", "1500", "2500"]), store.clone())
            .attempt_restore(&doc(), Some(DateWindow::new(Some(1000), Some(2000))))
            .await;

        assert_eq!(outcome, RestoreOutcome::Completed { inserted: 1, skipped: 0 });
        assert_eq!(store.committed()[0].date, 1500);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capability_denial_stops_without_rollback() {
        let store = RecordingStore::failing([(2, InsertError::CapabilityDenied("no role".into()))]);
        let outcome = coordinator(&backup(&["1", "2", "3", "4"]), store.clone())
            .attempt_restore(&doc(), None)
            .await;

        assert_eq!(outcome, RestoreOutcome::CapabilityRequired { inserted: 1 });
        assert_eq!(store.committed().len(), 1);
        assert_eq!(store.committed()[0].date, 1);
        // nothing after the denial is attempted
        assert_eq!(store.attempts(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn denial_counts_only_filtered_records() {
        let store = RecordingStore::failing([(3, InsertError::CapabilityDenied("no role".into()))]);
        let outcome = coordinator(&backup(&["5", "10", "20", "30", "40", "50"]), store.clone())
            .attempt_restore(&doc(), Some(DateWindow::new(Some(10), None)))
            .await;

        assert_eq!(outcome, RestoreOutcome::CapabilityRequired { inserted: 2 });
        let dates: Vec<_> = store.committed().iter().map(|r| r.date).collect();
        assert_eq!(dates, [10, 20]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejected_records_are_skipped_and_counted() {
        let store = RecordingStore::failing([
            (1, InsertError::Rejected("bad row".into())),
            (3, InsertError::Rejected("bad row".into())),
        ]);
        let outcome = coordinator(&backup(&["1", "2", "3", "4"]), store.clone())
            .attempt_restore(&doc(), None)
            .await;

        assert_eq!(outcome, RestoreOutcome::Completed { inserted: 2, skipped: 2 });
        let dates: Vec<_> = store.committed().iter().map(|r| r.date).collect();
        assert_eq!(dates, [2, 4]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_backup_writes_nothing() {
        let store = RecordingStore::default();
        let outcome = coordinator("definitely <not xml", store.clone())
            .attempt_restore(&doc(), None)
            .await;

        assert!(matches!(outcome, RestoreOutcome::ParseError(_)), "{outcome:?}");
        assert_eq!(store.attempts(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn truncated_backup_writes_nothing() {
        let store = RecordingStore::default();
        let truncated = backup(&["1", "2"]).replace("</smses>", "");
        let outcome = coordinator(&truncated, store.clone()).attempt_restore(&doc(), None).await;

        assert!(matches!(outcome, RestoreOutcome::ParseError(_)), "{outcome:?}");
        assert_eq!(store.attempts(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_document_is_unavailable() {
        let store = RecordingStore::default();
        let outcome = coordinator(&backup(&["1"]), store.clone())
            .attempt_restore(&DocumentRef::new("SMS/other.xml"), None)
            .await;

        assert!(matches!(outcome, RestoreOutcome::DocumentUnavailable(_)), "{outcome:?}");
        assert_eq!(store.attempts(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_selection_is_a_successful_zero() {
        let store = RecordingStore::default();
        let outcome = coordinator(&backup(&["1", "2"]), store.clone())
            .attempt_restore(&doc(), Some(DateWindow::new(Some(100), None)))
            .await;

        assert_eq!(outcome, RestoreOutcome::Completed { inserted: 0, skipped: 0 });
        assert_eq!(outcome.kind(), RestoreOutcomeKind::Completed);
    }

    #[test]
    fn status_messages_name_scope_and_counts() {
        let done = RestoreOutcome::Completed { inserted: 3, skipped: 0 };
        assert_eq!(
            done.status_message(RestoreScope::All),
            "Restore completed (all): 3 messages restored."
        );
        let partial = RestoreOutcome::Completed { inserted: 2, skipped: 1 };
        assert!(partial.status_message(RestoreScope::Range).contains("(range)"));
        assert!(partial.status_message(RestoreScope::Range).contains("1 skipped"));

        let denied = RestoreOutcome::CapabilityRequired { inserted: 1 };
        assert!(denied.status_message(RestoreScope::All).contains("default SMS app"));
        assert_eq!(denied.inserted(), 1);
        assert_eq!(denied.skipped(), 0);
    }

    #[test]
    fn filtering_preserves_order() {
        let records: Vec<_> = [30, 10, 20, 40]
            .into_iter()
            .map(|date| MessageRecord {
                address: None,
                body: None,
                date,
                date_sent: None,
                message_type: None,
                read: None,
                seen: None,
            })
            .collect();
        let window = DateWindow::new(Some(15), Some(35));
        let kept: Vec<_> =
            filter_records(records, Some(&window)).into_iter().map(|r| r.date).collect();
        assert_eq!(kept, [30, 20]);
    }
}
