mod error;
mod mutations;
mod queries;
mod store;
mod validation;

pub use error::{ConflictReason, EngineError};
pub use store::apply_to_schedule;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

use store::Store;

pub type SharedScheduleState = Arc<RwLock<ScheduleState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Control(WalControl),
}

pub(super) enum WalControl {
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Every append that is already queued when the first one arrives rides the
/// same fsync. A control command ends the batch; the batch is flushed first.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            WalCommand::Control(control) => {
                handle_control(&mut wal, control);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut pending_control = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                WalCommand::Control(control) => {
                    pending_control = Some(control);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(control) = pending_control {
            handle_control(&mut wal, control);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL {}: batch of {} failed: {e}", wal.path().display(), batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after a failed append so stray buffered bytes do not
    // end up in the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_control(wal: &mut Wal, control: WalControl) {
    match control {
        WalControl::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalControl::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
    }
}

/// One tenant's reservation engine.
pub struct Engine {
    store: Store,
    wal_tx: mpsc::Sender<WalCommand>,
    /// Serializes directory writes so the size check and the insert agree.
    directory_lock: Mutex<()>,
    /// Writers hold this shared for their whole operation; compaction holds
    /// it exclusively so its snapshot matches the log it replaces.
    commit_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Store::new();
        let mut rows: HashMap<Ulid, ScheduleState> = HashMap::new();
        for event in &events {
            match event {
                Event::DoctorRegistered { .. } | Event::PatientRegistered { .. } => {
                    store.apply_directory(event);
                }
                Event::ScheduleCreated { id, doctor_id, date, start, end, capacity, price } => {
                    let rs = ScheduleState::new(*id, *doctor_id, *date, *start, *end, *capacity, *price);
                    rows.insert(*id, rs);
                }
                Event::ScheduleDeleted { id } => {
                    rows.remove(id);
                }
                other => {
                    if let Some(schedule_id) = other.schedule_id()
                        && let Some(rs) = rows.get_mut(&schedule_id)
                    {
                        apply_to_schedule(rs, other);
                    }
                }
            }
        }

        for (id, rs) in rows {
            for appointment in &rs.appointments {
                store.claim_appointment(appointment.id, id);
            }
            store.try_insert_schedule(id, Arc::new(RwLock::new(rs)));
        }

        tracing::debug!(
            "replayed {} events from {}: {} schedules",
            events.len(),
            wal_path.display(),
            store.schedule_count()
        );

        Ok(Self {
            store,
            wal_tx,
            directory_lock: Mutex::new(()),
            commit_gate: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Internal(e.to_string()))
    }

    async fn wal_control<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> WalControl,
    ) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Control(build(tx)))
            .await
            .map_err(|_| EngineError::Internal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Internal("WAL writer dropped response".into()))
    }

    /// WAL commit, then apply and index. Nothing touches `rs` unless the
    /// commit is durable.
    async fn commit(&self, rs: &mut ScheduleState, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_schedule(rs, event);
        self.store.index_event(event);
        Ok(())
    }

    /// Write-lock a schedule row. A row deleted while we waited is `NotFound`.
    async fn lock_schedule(
        &self,
        id: Ulid,
    ) -> Result<(SharedScheduleState, OwnedRwLockWriteGuard<ScheduleState>), EngineError> {
        let rs = self
            .store
            .get_schedule(&id)
            .ok_or(EngineError::schedule_not_found(id))?;
        let guard = rs.clone().write_owned().await;
        if !self.store.is_current(&id, &rs) {
            return Err(EngineError::schedule_not_found(id));
        }
        Ok((rs, guard))
    }

    /// Write-lock the schedule row that owns an appointment.
    async fn lock_appointment(
        &self,
        id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ScheduleState>, EngineError> {
        let schedule_id = self
            .store
            .schedule_for_appointment(&id)
            .ok_or(EngineError::appointment_not_found(id))?;
        let (_, guard) = self
            .lock_schedule(schedule_id)
            .await
            .map_err(|_| EngineError::appointment_not_found(id))?;
        if guard.appointment(&id).is_none() {
            return Err(EngineError::appointment_not_found(id));
        }
        Ok(guard)
    }
}
