use std::collections::HashMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — used for sync timestamps only. Calendar data is whole days.
pub type Ms = i64;

/// Closed interval of whole days `[start, end]`, inclusive on both ends.
///
/// Construction enforces `start <= end`; no other module builds ranges from
/// raw date text (the feed codec owns all date parsing).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        if start <= end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Single-day range.
    pub fn day(d: NaiveDate) -> Self {
        Self { start: d, end: d }
    }

    pub fn days(&self) -> u64 {
        (self.end - self.start).num_days() as u64 + 1
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// True if the ranges overlap or share adjacent boundary days — i.e. the
    /// union is still one contiguous block of days.
    pub fn touches(&self, other: &DateRange) -> bool {
        self.start <= next_day(other.end) && other.start <= next_day(self.end)
    }

    pub fn contains_day(&self, d: NaiveDate) -> bool {
        self.start <= d && d <= self.end
    }
}

/// Day after `d`, saturating at the calendar maximum.
pub fn next_day(d: NaiveDate) -> NaiveDate {
    d.checked_add_days(Days::new(1)).unwrap_or(NaiveDate::MAX)
}

/// Day before `d`, saturating at the calendar minimum.
pub fn prev_day(d: NaiveDate) -> NaiveDate {
    d.checked_sub_days(Days::new(1)).unwrap_or(NaiveDate::MIN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Active,
    Completed,
    Cancelled,
}

impl ReservationStatus {
    /// Cancelled reservations stay on record but never block availability.
    pub fn blocks(&self) -> bool {
        !matches!(self, ReservationStatus::Cancelled)
    }
}

/// An internal reservation. Never physically deleted — cancellation is a
/// status change, so the audit trail survives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub range: DateRange,
    pub status: ReservationStatus,
    pub label: Option<String>,
}

/// A subscription to one external calendar feed, scoped to one vehicle.
/// `last_synced_at`/`last_error` are mutated only by the synchronizer;
/// `active` only by the revoke action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub id: Ulid,
    pub vehicle_id: Ulid,
    pub feed_url: String,
    pub source_label: String,
    pub active: bool,
    pub last_synced_at: Option<Ms>,
    pub last_error: Option<String>,
}

/// One cached event from an external feed. The set for a link is replaced
/// wholesale on every successful sync and owned entirely by the synchronizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalEvent {
    pub link_id: Ulid,
    pub external_uid: String,
    pub range: DateRange,
}

/// Per-vehicle calendar state: reservations, feed links, and the cached
/// events last known for each link.
#[derive(Debug, Clone)]
pub struct VehicleCalendar {
    pub id: Ulid,
    pub label: Option<String>,
    /// Sorted by `range.start`.
    pub reservations: Vec<Reservation>,
    pub links: Vec<ExternalLink>,
    /// Cached events keyed by link id, for full-replace semantics.
    pub events: HashMap<Ulid, Vec<ExternalEvent>>,
}

impl VehicleCalendar {
    pub fn new(id: Ulid, label: Option<String>) -> Self {
        Self {
            id,
            label,
            reservations: Vec::new(),
            links: Vec::new(),
            events: HashMap::new(),
        }
    }

    /// Insert a reservation maintaining sort order by range start.
    pub fn insert_reservation(&mut self, r: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&r.range.start, |x| x.range.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, r);
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn link(&self, id: Ulid) -> Option<&ExternalLink> {
        self.links.iter().find(|l| l.id == id)
    }

    pub fn link_mut(&mut self, id: Ulid) -> Option<&mut ExternalLink> {
        self.links.iter_mut().find(|l| l.id == id)
    }

    /// Reservations that currently block availability.
    pub fn blocking_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.status.blocks())
    }

    /// Cached events of active links only. A revoked link's events stop
    /// blocking immediately, without waiting for a resync.
    pub fn blocking_events(&self) -> impl Iterator<Item = &ExternalEvent> {
        self.links
            .iter()
            .filter(|l| l.active)
            .filter_map(|l| self.events.get(&l.id))
            .flatten()
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    VehicleRegistered {
        id: Ulid,
        label: Option<String>,
    },
    ReservationCreated {
        id: Ulid,
        vehicle_id: Ulid,
        range: DateRange,
        status: ReservationStatus,
        label: Option<String>,
    },
    ReservationStatusChanged {
        id: Ulid,
        vehicle_id: Ulid,
        status: ReservationStatus,
    },
    LinkRegistered {
        id: Ulid,
        vehicle_id: Ulid,
        feed_url: String,
        source_label: String,
    },
    LinkRevoked {
        id: Ulid,
        vehicle_id: Ulid,
    },
    /// Atomic swap of a link's cached events; also records the successful
    /// sync time and clears any previous error.
    LinkEventsReplaced {
        link_id: Ulid,
        vehicle_id: Ulid,
        events: Vec<ExternalEvent>,
        synced_at: Ms,
    },
    LinkErrored {
        link_id: Ulid,
        vehicle_id: Ulid,
        message: String,
    },
    /// Tenant-level: the opaque token gating the export endpoint.
    ExportTokenSet {
        token: String,
    },
}
