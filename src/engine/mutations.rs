use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::feed::EventDraft;
use crate::limits::*;
use crate::model::*;

use super::conflict::{find_conflict, validate_range, Conflict};
use super::{Engine, EngineError, WalCommand};

/// Result of a reserve call. `Conflict` is a normal outcome, not an error:
/// two customers racing for the same dates is expected traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Booked(Reservation),
    Conflict(Conflict),
}

impl Engine {
    pub async fn register_vehicle(&self, id: Ulid, label: Option<String>) -> Result<(), EngineError> {
        if self.state.len() >= MAX_VEHICLES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many vehicles"));
        }
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("vehicle label too long"));
        }
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::VehicleRegistered { id, label: label.clone() };
        self.wal_append(&event).await?;
        self.state
            .insert(id, Arc::new(RwLock::new(VehicleCalendar::new(id, label))));
        Ok(())
    }

    /// Atomic check-and-insert: the conflict check and the insert happen
    /// under one vehicle write lock, so of two concurrent overlapping
    /// reserve calls at most one can succeed.
    pub async fn reserve(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        range: DateRange,
        label: Option<String>,
    ) -> Result<ReserveOutcome, EngineError> {
        validate_range(&range)?;
        if let Some(ref l) = label
            && l.len() > MAX_LABEL_LEN
        {
            return Err(EngineError::LimitExceeded("label too long"));
        }
        if self.reservation_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let mut guard = cal.write().await;
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many reservations on vehicle"));
        }

        if let Some(conflict) = find_conflict(&guard, &range) {
            metrics::counter!(crate::observability::RESERVE_CONFLICTS_TOTAL).increment(1);
            return Ok(ReserveOutcome::Conflict(conflict));
        }

        let event = Event::ReservationCreated {
            id,
            vehicle_id,
            range,
            status: ReservationStatus::Pending,
            label,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);

        let reservation = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        Ok(ReserveOutcome::Booked(reservation))
    }

    /// Status transitions are driven by external collaborators (billing,
    /// manual edits); the engine only records them. Cancellation goes
    /// through here too — reservations are never physically deleted.
    pub async fn set_reservation_status(
        &self,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Ulid, EngineError> {
        let vehicle_id = self
            .vehicle_for_reservation(&id)
            .ok_or(EngineError::NotFound(id))?;
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let mut guard = cal.write().await;
        if guard.reservation(id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::ReservationStatusChanged { id, vehicle_id, status };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(vehicle_id)
    }

    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Ulid, EngineError> {
        self.set_reservation_status(id, ReservationStatus::Cancelled)
            .await
    }

    pub async fn register_link(
        &self,
        id: Ulid,
        vehicle_id: Ulid,
        feed_url: String,
        source_label: String,
    ) -> Result<(), EngineError> {
        if feed_url.len() > MAX_FEED_URL_LEN {
            return Err(EngineError::LimitExceeded("feed url too long"));
        }
        if source_label.len() > MAX_SOURCE_LABEL_LEN {
            return Err(EngineError::LimitExceeded("source label too long"));
        }
        if self.link_index.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let mut guard = cal.write().await;
        if guard.links.len() >= MAX_LINKS_PER_VEHICLE {
            return Err(EngineError::LimitExceeded("too many links on vehicle"));
        }

        let event = Event::LinkRegistered {
            id,
            vehicle_id,
            feed_url,
            source_label,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Revocation takes effect immediately: the link's cached events stop
    /// blocking availability without waiting for a resync.
    pub async fn revoke_link(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let (vehicle_id, cal) = self.resolve_link(&id)?;
        let mut guard = cal.write().await;
        if guard.link(id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::LinkRevoked { id, vehicle_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(vehicle_id)
    }

    /// Full replace of a link's cached event set — never an incremental
    /// merge, so repeated syncs of identical feed content cannot accumulate
    /// duplicates. Also records the sync time and clears any stored error.
    pub async fn replace_link_events(
        &self,
        link_id: Ulid,
        drafts: Vec<EventDraft>,
        synced_at: Ms,
    ) -> Result<usize, EngineError> {
        if drafts.len() > MAX_EVENTS_PER_LINK {
            return Err(EngineError::LimitExceeded("too many events on link"));
        }
        let (vehicle_id, cal) = self.resolve_link(&link_id)?;
        let mut guard = cal.write().await;
        if guard.link(link_id).is_none() {
            return Err(EngineError::NotFound(link_id));
        }

        let events: Vec<ExternalEvent> = drafts
            .into_iter()
            .map(|d| ExternalEvent {
                link_id,
                external_uid: d.uid,
                range: d.range,
            })
            .collect();
        let count = events.len();

        let event = Event::LinkEventsReplaced {
            link_id,
            vehicle_id,
            events,
            synced_at,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(count)
    }

    /// Record a failed sync. The previously cached events are left
    /// untouched — stale-but-available beats a blank calendar.
    pub async fn mark_link_error(&self, link_id: Ulid, message: String) -> Result<(), EngineError> {
        let (vehicle_id, cal) = self.resolve_link(&link_id)?;
        let mut guard = cal.write().await;
        if guard.link(link_id).is_none() {
            return Err(EngineError::NotFound(link_id));
        }

        let event = Event::LinkErrored {
            link_id,
            vehicle_id,
            message,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// The opaque token gating the export endpoint. Generated on first use
    /// and persisted, so subscriber URLs survive restarts.
    pub async fn export_token(&self) -> Result<String, EngineError> {
        // Hold the slot across the append: racing first calls would
        // otherwise each write a token event, and the WAL order (what a
        // restart replays) need not match which writer set the slot last.
        let mut slot = self.export_token.lock().await;
        if let Some(token) = slot.clone() {
            return Ok(token);
        }
        let token = Ulid::new().to_string().to_lowercase();
        let event = Event::ExportTokenSet { token: token.clone() };
        self.wal_append(&event).await?;
        *slot = Some(token.clone());
        Ok(token)
    }

    fn resolve_link(&self, link_id: &Ulid) -> Result<(Ulid, super::SharedVehicleCalendar), EngineError> {
        let vehicle_id = self
            .vehicle_for_link(link_id)
            .ok_or(EngineError::NotFound(*link_id))?;
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        Ok((vehicle_id, cal))
    }

    /// Compact the WAL by rewriting it with only the events needed to
    /// recreate current state. Cancelled reservations are kept — they are
    /// part of the audit trail.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        if let Some(token) = self.export_token.lock().await.clone() {
            events.push(Event::ExportTokenSet { token });
        }

        let vehicle_ids: Vec<Ulid> = self.state.iter().map(|e| *e.key()).collect();
        for vid in vehicle_ids {
            let cal = match self.get_vehicle(&vid) {
                Some(c) => c,
                None => continue,
            };
            let guard = cal.read().await;

            events.push(Event::VehicleRegistered {
                id: guard.id,
                label: guard.label.clone(),
            });
            for r in &guard.reservations {
                events.push(Event::ReservationCreated {
                    id: r.id,
                    vehicle_id: r.vehicle_id,
                    range: r.range,
                    status: r.status,
                    label: r.label.clone(),
                });
            }
            for l in &guard.links {
                events.push(Event::LinkRegistered {
                    id: l.id,
                    vehicle_id: l.vehicle_id,
                    feed_url: l.feed_url.clone(),
                    source_label: l.source_label.clone(),
                });
                if !l.active {
                    events.push(Event::LinkRevoked {
                        id: l.id,
                        vehicle_id: l.vehicle_id,
                    });
                }
                if let Some(synced_at) = l.last_synced_at {
                    events.push(Event::LinkEventsReplaced {
                        link_id: l.id,
                        vehicle_id: l.vehicle_id,
                        events: guard.events.get(&l.id).cloned().unwrap_or_default(),
                        synced_at,
                    });
                }
                if let Some(ref message) = l.last_error {
                    events.push(Event::LinkErrored {
                        link_id: l.id,
                        vehicle_id: l.vehicle_id,
                        message: message.clone(),
                    });
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
