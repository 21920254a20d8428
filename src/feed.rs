//! Feed codec: the only module that touches raw calendar text.
//!
//! Decoding turns an iCalendar payload into normalized `(uid, date range)`
//! drafts, converting each source's end-date convention to our inclusive
//! whole-day ranges. Encoding publishes a vehicle's reservations back out
//! using the exclusive-end convention generic subscribers expect.

use chrono::NaiveDate;
use icalendar::parser::{read_calendar, unfold};

use crate::limits::MAX_FEED_BYTES;
use crate::model::{next_day, prev_day, DateRange, Reservation};

/// How a source encodes the end of an all-day span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndConvention {
    /// `DTEND` is the first free day (RFC 5545 all-day semantics).
    ExclusiveNextDay,
    /// `DTEND` is the last blocked day.
    InclusiveLastDay,
}

/// Sources known to use inclusive end-of-stay dates. Everything else —
/// including the generic default — follows the dominant exclusive convention.
const INCLUSIVE_END_SOURCES: &[&str] = &["wheelbase", "camperdays"];

pub fn end_convention(source_label: &str) -> EndConvention {
    if INCLUSIVE_END_SOURCES.contains(&source_label.to_ascii_lowercase().as_str()) {
        EndConvention::InclusiveLastDay
    } else {
        EndConvention::ExclusiveNextDay
    }
}

/// A decoded event before it is tagged with a link id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDraft {
    pub uid: String,
    pub range: DateRange,
}

/// One skipped event block. Non-fatal; decoding continued without it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseWarning {
    /// Position of the VEVENT block within the feed.
    pub index: usize,
    pub uid: Option<String>,
    pub message: String,
}

/// Whole-payload decode failure. Individual bad blocks are warnings instead.
#[derive(Debug)]
pub enum FeedError {
    Format(String),
    TooLarge(usize),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::Format(msg) => write!(f, "not a calendar feed: {msg}"),
            FeedError::TooLarge(n) => write!(f, "feed too large: {n} bytes"),
        }
    }
}

impl std::error::Error for FeedError {}

/// Decode a raw feed payload into event drafts plus warnings for any
/// skipped blocks. Duplicate UIDs within one payload: last occurrence wins.
pub fn decode(raw: &[u8], convention: EndConvention) -> Result<(Vec<EventDraft>, Vec<ParseWarning>), FeedError> {
    if raw.len() > MAX_FEED_BYTES {
        return Err(FeedError::TooLarge(raw.len()));
    }
    let text = String::from_utf8_lossy(raw);
    let unfolded = unfold(&text);
    let calendar = read_calendar(&unfolded).map_err(|e| FeedError::Format(e.to_string()))?;

    let mut drafts: Vec<EventDraft> = Vec::new();
    let mut warnings = Vec::new();

    for (index, block) in calendar
        .components
        .iter()
        .filter(|c| c.name == "VEVENT")
        .enumerate()
    {
        let uid = block
            .find_prop("UID")
            .map(|p| p.val.to_string())
            .filter(|u| !u.is_empty());

        if block
            .find_prop("STATUS")
            .is_some_and(|p| p.val.as_ref() == "CANCELLED")
        {
            continue;
        }

        let Some(start_prop) = block.find_prop("DTSTART") else {
            warnings.push(ParseWarning {
                index,
                uid,
                message: "missing DTSTART".into(),
            });
            continue;
        };
        let start = match parse_feed_date(start_prop.val.as_ref()) {
            Some(v) => v,
            None => {
                warnings.push(ParseWarning {
                    index,
                    uid,
                    message: format!("unparsable DTSTART: {}", start_prop.val.as_ref()),
                });
                continue;
            }
        };

        let range = match block.find_prop("DTEND") {
            None => DateRange::day(start.date),
            Some(end_prop) => {
                let Some(end) = parse_feed_date(end_prop.val.as_ref()) else {
                    warnings.push(ParseWarning {
                        index,
                        uid,
                        message: format!("unparsable DTEND: {}", end_prop.val.as_ref()),
                    });
                    continue;
                };
                normalize_end(start.date, end, convention)
            }
        };

        // Feeds without stable ids get a content hash of the block text as a
        // stand-in, so re-syncing identical bytes yields identical uids.
        let uid = uid.unwrap_or_else(|| {
            let mut normalized = String::new();
            for p in &block.properties {
                normalized.push_str(p.name.as_ref());
                normalized.push(':');
                normalized.push_str(p.val.as_ref());
                normalized.push('\n');
            }
            format!("corral-{:08x}", crc32fast::hash(normalized.as_bytes()))
        });

        // Duplicate uid in the same payload: replace the earlier draft.
        if let Some(existing) = drafts.iter_mut().find(|d| d.uid == uid) {
            existing.range = range;
        } else {
            drafts.push(EventDraft { uid, range });
        }
    }

    Ok((drafts, warnings))
}

struct FeedDate {
    date: NaiveDate,
    /// True for a bare DATE value, false for a date-time we truncated.
    all_day: bool,
}

/// Parse `YYYYMMDD` or `YYYYMMDDTHHMMSS[Z]`, truncating date-times to their
/// date. Anything else is malformed.
fn parse_feed_date(raw: &str) -> Option<FeedDate> {
    let raw = raw.trim();
    let (date_part, all_day) = match raw.split_once('T') {
        Some((d, _)) => (d, false),
        None => (raw, true),
    };
    let date = NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()?;
    Some(FeedDate { date, all_day })
}

/// Apply the source's end convention. The exclusive adjustment only applies
/// to all-day DATE values; a date-time end already names a day of the stay.
fn normalize_end(start: NaiveDate, end: FeedDate, convention: EndConvention) -> DateRange {
    let inclusive_end = if end.all_day && convention == EndConvention::ExclusiveNextDay {
        prev_day(end.date)
    } else {
        end.date
    };
    // A zero-length or inverted span still blocks its start day.
    DateRange::new(start, inclusive_end).unwrap_or_else(|| DateRange::day(start))
}

/// Serialize the blocking reservations of a vehicle as an iCalendar feed.
///
/// Output is deterministic: stable ordering by reservation id, fixed PRODID,
/// no volatile properties. Ranges are re-expanded to the exclusive-end
/// convention for generic subscribers.
pub fn encode(reservations: &[Reservation]) -> String {
    let mut rows: Vec<&Reservation> = reservations.iter().filter(|r| r.status.blocks()).collect();
    rows.sort_by_key(|r| r.id);

    let mut out = String::new();
    out.push_str("BEGIN:VCALENDAR\r\n");
    out.push_str("VERSION:2.0\r\n");
    out.push_str("PRODID:-//corral//availability feed//EN\r\n");
    out.push_str("CALSCALE:GREGORIAN\r\n");
    for r in rows {
        out.push_str("BEGIN:VEVENT\r\n");
        out.push_str(&format!("UID:{}@corral\r\n", r.id));
        out.push_str(&format!(
            "DTSTART;VALUE=DATE:{}\r\n",
            r.range.start.format("%Y%m%d")
        ));
        out.push_str(&format!(
            "DTEND;VALUE=DATE:{}\r\n",
            next_day(r.range.end).format("%Y%m%d")
        ));
        out.push_str("SUMMARY:Reserved\r\n");
        out.push_str("END:VEVENT\r\n");
    }
    out.push_str("END:VCALENDAR\r\n");
    out
}
