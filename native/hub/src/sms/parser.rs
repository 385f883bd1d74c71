//! Reader for the "SMS Backup & Restore" XML format.
//!
//! ```xml
//! <smses count="2">
//!   <sms address="+15550100" body="hi" date="1700000000000" date_sent="1700000000000"
//!        type="1" read="1" seen="1" />
//!   ...
//! </smses>
//! ```
//!
//! Only `<sms>` elements are read. Any other element or attribute is skipped, so newer backups
//! with extra metadata (`<mms>`, `contact_name`, ...) still parse.
//!
//! Characters outside the BMP (emoji) are written by the backup app as two character references,
//! one per UTF-16 surrogate (`&#55357;&#56832;`). Those pairs are joined before unescaping.

use std::{borrow::Cow, str::FromStr};

use derive_more::Display;
use lazy_regex::{Lazy, Regex, lazy_regex};
use quick_xml::{
    Reader,
    escape::unescape,
    events::{BytesStart, Event, attributes::Attribute},
};
use tracing::{debug, instrument, trace};

use crate::models::MessageRecord;

const RECORD_ELEMENT: &[u8] = b"sms";

static CHAR_REF_REGEX: Lazy<Regex> = lazy_regex!(r"&#(x[0-9A-Fa-f]+|[0-9]+);");
const HIGH_SURROGATES: std::ops::RangeInclusive<u32> = 0xD800..=0xDBFF;
const LOW_SURROGATES: std::ops::RangeInclusive<u32> = 0xDC00..=0xDFFF;

/// The backup is not well-formed markup. No records from it should be used.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
#[display("malformed backup at byte {position}: {message}")]
pub struct ParseError {
    pub position: u64,
    pub message: String,
}

impl std::error::Error for ParseError {}

/// Parses a whole backup document into records, in document order.
#[instrument(level = "debug", skip(bytes), fields(len = bytes.len()), err)]
pub fn parse_backup(bytes: &[u8]) -> Result<Vec<MessageRecord>, ParseError> {
    let mut reader = Reader::from_reader(bytes);
    reader.config_mut().trim_text(true);

    let mut records = Vec::new();
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut seen_root = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| error_at(&reader, e.to_string()))?;
        match event {
            Event::Start(ref element) | Event::Empty(ref element) => {
                if depth == 0 {
                    if seen_root {
                        return Err(error_at(&reader, "more than one root element"));
                    }
                    seen_root = true;
                }
                if element.name().as_ref() == RECORD_ELEMENT {
                    let record = read_record(&reader, element)?;
                    trace!(date = record.date, "Read message record");
                    records.push(record);
                }
                if matches!(event, Event::Start(_)) {
                    depth += 1;
                }
            }
            Event::End(_) => depth = depth.saturating_sub(1),
            Event::Text(_) | Event::CData(_) if depth == 0 => {
                return Err(error_at(&reader, "content outside of the root element"));
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if depth != 0 {
        return Err(error_at(&reader, "unexpected end of document"));
    }
    if !seen_root {
        return Err(error_at(&reader, "no root element"));
    }

    debug!(count = records.len(), "Parsed backup");
    Ok(records)
}

fn read_record(
    reader: &Reader<&[u8]>,
    element: &BytesStart<'_>,
) -> Result<MessageRecord, ParseError> {
    let mut address = None;
    let mut body = None;
    let mut date = None;
    let mut date_sent = None;
    let mut message_type = None;
    let mut read = None;
    let mut seen = None;

    for attr in element.attributes() {
        let attr = attr.map_err(|e| error_at(reader, e.to_string()))?;
        let value = attribute_value(reader, &attr);
        match attr.key.as_ref() {
            b"address" => address = Some(value),
            b"body" => body = Some(value),
            b"date" => date = parse_number(&value),
            b"date_sent" => date_sent = parse_number(&value),
            b"type" => message_type = parse_number(&value),
            b"read" => read = parse_number(&value),
            b"seen" => seen = parse_number(&value),
            _ => {}
        }
    }

    Ok(MessageRecord {
        address,
        body,
        date: date.unwrap_or(0),
        date_sent,
        message_type,
        read,
        seen,
    })
}

/// Decodes and unescapes an attribute value. A value that cannot be unescaped is kept as raw
/// text rather than failing the document.
fn attribute_value(reader: &Reader<&[u8]>, attr: &Attribute<'_>) -> String {
    let raw = match reader.decoder().decode(&attr.value) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "Attribute is not valid text, decoding lossily");
            String::from_utf8_lossy(&attr.value)
        }
    };
    let joined = join_surrogate_pairs(&raw);
    let unescaped = unescape(&joined).map(Cow::into_owned);
    match unescaped {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "Keeping attribute value unescaped");
            joined.into_owned()
        }
    }
}

/// Replaces adjacent high/low surrogate character references with the character they encode.
/// Unpaired surrogates are left alone.
fn join_surrogate_pairs(raw: &str) -> Cow<'_, str> {
    if !raw.contains("&#") {
        return Cow::Borrowed(raw);
    }

    let mut refs = CHAR_REF_REGEX
        .captures_iter(raw)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((whole.start(), whole.end(), char_ref_value(&caps[1])?))
        })
        .peekable();
    let mut joined = String::with_capacity(raw.len());
    let mut copied_up_to = 0;
    while let Some((start, end, high)) = refs.next() {
        if !HIGH_SURROGATES.contains(&high) {
            continue;
        }
        let Some(&(next_start, next_end, low)) = refs.peek() else { break };
        if next_start != end || !LOW_SURROGATES.contains(&low) {
            continue;
        }
        refs.next();
        if let Some(c) = char::from_u32(0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00)) {
            joined.push_str(&raw[copied_up_to..start]);
            joined.push(c);
            copied_up_to = next_end;
        }
    }

    if copied_up_to == 0 {
        return Cow::Borrowed(raw);
    }
    joined.push_str(&raw[copied_up_to..]);
    Cow::Owned(joined)
}

fn char_ref_value(digits: &str) -> Option<u32> {
    match digits.strip_prefix('x') {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => digits.parse().ok(),
    }
}

fn parse_number<T: FromStr>(value: &str) -> Option<T> {
    value.parse().ok()
}

fn error_at(reader: &Reader<&[u8]>, message: impl Into<String>) -> ParseError {
    ParseError { position: reader.buffer_position() as u64, message: message.into() }
}
