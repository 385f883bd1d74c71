use serde::{Deserialize, Serialize};

/// One message entry read from an SMS backup document.
///
/// Everything except `date` is passed through exactly as found in the backup;
/// values are never validated or normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Phone number/address of the other party
    pub address: Option<String>,
    /// Message body
    pub body: Option<String>,
    /// Timestamp (milliseconds since epoch), `0` when missing or unparsable
    pub date: i64,
    /// Send timestamp (milliseconds since epoch)
    pub date_sent: Option<i64>,
    /// Message box (1 = inbox, 2 = sent, 3 = draft, ...)
    pub message_type: Option<i32>,
    /// Read status (0 = unread, 1 = read)
    pub read: Option<i32>,
    /// Seen status (0 = unseen, 1 = seen)
    pub seen: Option<i32>,
}

/// Inclusive date range used to select which records get restored.
/// Either bound may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start_ms: Option<i64>,
    pub end_ms: Option<i64>,
}

impl DateWindow {
    pub fn new(start_ms: Option<i64>, end_ms: Option<i64>) -> Self {
        Self { start_ms, end_ms }
    }

    /// Returns `None` when both bounds are open, so callers can skip filtering entirely.
    pub fn from_bounds(start_ms: Option<i64>, end_ms: Option<i64>) -> Option<Self> {
        if start_ms.is_none() && end_ms.is_none() {
            None
        } else {
            Some(Self { start_ms, end_ms })
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start_ms.is_none_or(|start| timestamp >= start)
            && self.end_ms.is_none_or(|end| timestamp <= end)
    }
}
