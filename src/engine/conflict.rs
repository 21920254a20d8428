use serde::Serialize;
use ulid::Ulid;

use crate::limits::MAX_RANGE_DAYS;
use crate::model::{DateRange, Ms, VehicleCalendar};

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

pub(crate) fn validate_range(range: &DateRange) -> Result<(), EngineError> {
    if range.days() > MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("range too wide"));
    }
    Ok(())
}

/// What a requested range collided with. An expected, frequent outcome
/// (two customers racing for the same dates), so it is a result value the
/// caller branches on, never an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictSource {
    Reservation { reservation_id: Ulid },
    External { link_id: Ulid, source_label: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub source: ConflictSource,
    /// The existing blocking range, so callers can explain *why* a date
    /// is unavailable.
    pub conflicting_range: DateRange,
}

/// Find the first blocking range overlapping `range`, if any. Internal
/// reservations are checked before external events so the caller gets the
/// most actionable conflict first.
pub(crate) fn find_conflict(cal: &VehicleCalendar, range: &DateRange) -> Option<Conflict> {
    for r in cal.blocking_reservations() {
        if r.range.overlaps(range) {
            return Some(Conflict {
                source: ConflictSource::Reservation { reservation_id: r.id },
                conflicting_range: r.range,
            });
        }
    }
    for e in cal.blocking_events() {
        if e.range.overlaps(range) {
            let source_label = cal
                .link(e.link_id)
                .map(|l| l.source_label.clone())
                .unwrap_or_default();
            return Some(Conflict {
                source: ConflictSource::External {
                    link_id: e.link_id,
                    source_label,
                },
                conflicting_range: e.range,
            });
        }
    }
    None
}
