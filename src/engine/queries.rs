use ulid::Ulid;

use crate::feed;
use crate::model::*;

use super::blocked::effective_blocked;
use super::conflict::validate_range;
use super::{Engine, EngineError};

impl Engine {
    /// "Is vehicle V free over [a, b]?" — no blocking reservation and no
    /// cached event of an active link overlaps the range.
    pub async fn is_available(&self, vehicle_id: Ulid, range: DateRange) -> Result<bool, EngineError> {
        validate_range(&range)?;
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = cal.read().await;

        let free = !guard.blocking_reservations().any(|r| r.range.overlaps(&range))
            && !guard.blocking_events().any(|e| e.range.overlaps(&range));
        Ok(free)
    }

    /// Compact blocked calendar for display: every blocking source merged
    /// into the smallest set of disjoint ranges.
    pub async fn blocked_ranges(&self, vehicle_id: Ulid) -> Result<Vec<DateRange>, EngineError> {
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = cal.read().await;
        Ok(effective_blocked(&guard))
    }

    pub async fn reservations(&self, vehicle_id: Ulid) -> Result<Vec<Reservation>, EngineError> {
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = cal.read().await;
        Ok(guard.reservations.clone())
    }

    pub async fn links(&self, vehicle_id: Ulid) -> Result<Vec<ExternalLink>, EngineError> {
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = cal.read().await;
        Ok(guard.links.clone())
    }

    pub async fn link_snapshot(&self, link_id: Ulid) -> Result<ExternalLink, EngineError> {
        let vehicle_id = self
            .vehicle_for_link(&link_id)
            .ok_or(EngineError::NotFound(link_id))?;
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = cal.read().await;
        guard
            .link(link_id)
            .cloned()
            .ok_or(EngineError::NotFound(link_id))
    }

    pub async fn link_events(&self, link_id: Ulid) -> Result<Vec<ExternalEvent>, EngineError> {
        let vehicle_id = self
            .vehicle_for_link(&link_id)
            .ok_or(EngineError::NotFound(link_id))?;
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = cal.read().await;
        Ok(guard.events.get(&link_id).cloned().unwrap_or_default())
    }

    /// Every active link of this tenant, across all vehicles. Batch sync
    /// input.
    pub async fn active_links(&self) -> Vec<ExternalLink> {
        let mut out = Vec::new();
        let calendars: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        for cal in calendars {
            let guard = cal.read().await;
            out.extend(guard.links.iter().filter(|l| l.active).cloned());
        }
        out
    }

    pub async fn list_vehicles(&self) -> Vec<(Ulid, Option<String>)> {
        let cals: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(cals.len());
        for cal in cals {
            let guard = cal.read().await;
            out.push((guard.id, guard.label.clone()));
        }
        out
    }

    /// The export token, if one has been issued. Read-only counterpart of
    /// `export_token()` for callers that must not mint a token.
    pub async fn current_export_token(&self) -> Option<String> {
        self.export_token.lock().await.clone()
    }

    /// Feed of this vehicle's own reservations for external subscribers.
    /// Stateless: reads the store, encodes, changes nothing.
    pub async fn export_feed(&self, vehicle_id: Ulid) -> Result<String, EngineError> {
        let cal = self
            .get_vehicle(&vehicle_id)
            .ok_or(EngineError::NotFound(vehicle_id))?;
        let guard = cal.read().await;
        Ok(feed::encode(&guard.reservations))
    }
}
