mod blocked;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use blocked::{merge_ranges, ranges_contain_day};
pub use conflict::{Conflict, ConflictSource};
pub(crate) use conflict::now_ms;
pub use error::EngineError;
pub use mutations::ReserveOutcome;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedVehicleCalendar = Arc<RwLock<VehicleCalendar>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush the pending batch before the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// One tenant's availability state: every vehicle calendar, the reverse
/// indexes, and the WAL writer handle.
pub struct Engine {
    pub state: DashMap<Ulid, SharedVehicleCalendar>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: reservation id → vehicle id.
    pub(super) reservation_index: DashMap<Ulid, Ulid>,
    /// Reverse lookup: link id → vehicle id.
    pub(super) link_index: DashMap<Ulid, Ulid>,
    /// Opaque token gating the export endpoint; set lazily, persisted.
    pub(super) export_token: Mutex<Option<String>>,
}

/// Apply an event directly to a VehicleCalendar (no locking — caller holds
/// the lock).
fn apply_to_vehicle(
    cal: &mut VehicleCalendar,
    event: &Event,
    reservation_index: &DashMap<Ulid, Ulid>,
    link_index: &DashMap<Ulid, Ulid>,
) {
    match event {
        Event::ReservationCreated {
            id,
            vehicle_id,
            range,
            status,
            label,
        } => {
            cal.insert_reservation(Reservation {
                id: *id,
                vehicle_id: *vehicle_id,
                range: *range,
                status: *status,
                label: label.clone(),
            });
            reservation_index.insert(*id, *vehicle_id);
        }
        Event::ReservationStatusChanged { id, status, .. } => {
            if let Some(r) = cal.reservation_mut(*id) {
                r.status = *status;
            }
        }
        Event::LinkRegistered {
            id,
            vehicle_id,
            feed_url,
            source_label,
        } => {
            cal.links.push(ExternalLink {
                id: *id,
                vehicle_id: *vehicle_id,
                feed_url: feed_url.clone(),
                source_label: source_label.clone(),
                active: true,
                last_synced_at: None,
                last_error: None,
            });
            link_index.insert(*id, *vehicle_id);
        }
        Event::LinkRevoked { id, .. } => {
            if let Some(l) = cal.link_mut(*id) {
                l.active = false;
            }
        }
        Event::LinkEventsReplaced {
            link_id,
            events,
            synced_at,
            ..
        } => {
            cal.events.insert(*link_id, events.clone());
            if let Some(l) = cal.link_mut(*link_id) {
                l.last_synced_at = Some(*synced_at);
                l.last_error = None;
            }
        }
        Event::LinkErrored {
            link_id, message, ..
        } => {
            if let Some(l) = cal.link_mut(*link_id) {
                l.last_error = Some(message.clone());
            }
        }
        // Handled at the engine level, not per vehicle
        Event::VehicleRegistered { .. } | Event::ExportTokenSet { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Last token event wins, matching apply order.
        let replayed_token = events.iter().rev().find_map(|e| match e {
            Event::ExportTokenSet { token } => Some(token.clone()),
            _ => None,
        });

        let engine = Self {
            state: DashMap::new(),
            wal_tx,
            reservation_index: DashMap::new(),
            link_index: DashMap::new(),
            export_token: Mutex::new(replayed_token),
        };

        // Replay — we're the sole owner of these Arcs so try_write always
        // succeeds instantly. Never use blocking_write here: replay may run
        // inside an async context (lazy tenant creation).
        for event in &events {
            match event {
                Event::VehicleRegistered { id, label } => {
                    let cal = VehicleCalendar::new(*id, label.clone());
                    engine.state.insert(*id, Arc::new(RwLock::new(cal)));
                }
                Event::ExportTokenSet { .. } => {}
                other => {
                    if let Some(vehicle_id) = event_vehicle_id(other)
                        && let Some(entry) = engine.state.get(&vehicle_id)
                    {
                        let cal_arc = entry.clone();
                        let mut guard = cal_arc.try_write().expect("replay: uncontended write");
                        apply_to_vehicle(
                            &mut guard,
                            other,
                            &engine.reservation_index,
                            &engine.link_index,
                        );
                    }
                }
            }
        }

        Ok(engine)
    }

    /// Write an event to the WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_vehicle(&self, id: &Ulid) -> Option<SharedVehicleCalendar> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn vehicle_for_reservation(&self, reservation_id: &Ulid) -> Option<Ulid> {
        self.reservation_index.get(reservation_id).map(|e| *e.value())
    }

    pub fn vehicle_for_link(&self, link_id: &Ulid) -> Option<Ulid> {
        self.link_index.get(link_id).map(|e| *e.value())
    }

    /// WAL-append + apply in one call, under the caller's write lock.
    pub(super) async fn persist_and_apply(
        &self,
        cal: &mut VehicleCalendar,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_vehicle(cal, event, &self.reservation_index, &self.link_index);
        Ok(())
    }
}

/// Extract the vehicle id from an event (for per-vehicle events).
fn event_vehicle_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::ReservationCreated { vehicle_id, .. }
        | Event::ReservationStatusChanged { vehicle_id, .. }
        | Event::LinkRegistered { vehicle_id, .. }
        | Event::LinkRevoked { vehicle_id, .. }
        | Event::LinkEventsReplaced { vehicle_id, .. }
        | Event::LinkErrored { vehicle_id, .. } => Some(*vehicle_id),
        Event::VehicleRegistered { .. } | Event::ExportTokenSet { .. } => None,
    }
}
