use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use tokio::sync::RwLock;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::validation::*;
use super::{ConflictReason, Engine, EngineError, WalControl};

impl Engine {
    // ── Directory ────────────────────────────────────────────

    /// Insert or update a doctor.
    pub async fn register_doctor(
        &self,
        id: Ulid,
        name: String,
        specialization: String,
    ) -> Result<(), EngineError> {
        if name.trim().is_empty() {
            return Err(EngineError::InvalidInput("doctor name is required"));
        }
        validate_text(&name, MAX_NAME_LEN, "doctor name too long")?;
        validate_text(&specialization, MAX_NAME_LEN, "specialization too long")?;

        let _gate = self.commit_gate.read().await;
        let _directory = self.directory_lock.lock().await;
        if self.store.doctor(&id).is_none() && self.store.directory_len() >= MAX_DIRECTORY_ENTRIES {
            return Err(EngineError::LimitExceeded("too many directory entries"));
        }
        let event = Event::DoctorRegistered { id, name, specialization };
        self.wal_append(&event).await?;
        self.store.apply_directory(&event);
        debug!("doctor {id} registered");
        Ok(())
    }

    /// Insert or update a patient.
    pub async fn register_patient(
        &self,
        id: Ulid,
        first_name: String,
        second_name: String,
        phone: Option<String>,
    ) -> Result<(), EngineError> {
        if first_name.trim().is_empty() {
            return Err(EngineError::InvalidInput("patient first name is required"));
        }
        validate_text(&first_name, MAX_NAME_LEN, "first name too long")?;
        validate_text(&second_name, MAX_NAME_LEN, "second name too long")?;
        if let Some(ref p) = phone {
            validate_text(p, MAX_PHONE_LEN, "phone too long")?;
        }

        let _gate = self.commit_gate.read().await;
        let _directory = self.directory_lock.lock().await;
        if self.store.patient(&id).is_none() && self.store.directory_len() >= MAX_DIRECTORY_ENTRIES {
            return Err(EngineError::LimitExceeded("too many directory entries"));
        }
        let event = Event::PatientRegistered { id, first_name, second_name, phone };
        self.wal_append(&event).await?;
        self.store.apply_directory(&event);
        debug!("patient {id} registered");
        Ok(())
    }

    // ── Schedules ────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub async fn create_schedule(
        &self,
        id: Ulid,
        doctor_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        capacity: u32,
        price: Price,
    ) -> Result<Ulid, EngineError> {
        validate_date(date, today())?;
        validate_times(start, end)?;
        validate_capacity(capacity)?;
        validate_price(price)?;
        if self.store.doctor(&doctor_id).is_none() {
            return Err(EngineError::doctor_not_found(doctor_id));
        }

        let _gate = self.commit_gate.read().await;
        if self.store.schedule_count() >= MAX_SCHEDULES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many schedules"));
        }

        // The row is locked before it becomes visible, so nobody can book it
        // until the creation is durable.
        let rs = Arc::new(RwLock::new(ScheduleState::new(
            id, doctor_id, date, start, end, capacity, price,
        )));
        let guard = rs.clone().write_owned().await;
        if !self.store.try_insert_schedule(id, rs.clone()) {
            return Err(ConflictReason::AlreadyExists(id).into());
        }

        let event = Event::ScheduleCreated { id, doctor_id, date, start, end, capacity, price };
        if let Err(e) = self.wal_append(&event).await {
            self.store.remove_schedule_if(&id, &rs);
            return Err(e);
        }
        drop(guard);
        debug!("schedule {id} created for doctor {doctor_id} on {date}");
        Ok(id)
    }

    pub async fn update_schedule(&self, id: Ulid, patch: SchedulePatch) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (_, mut guard) = self.lock_schedule(id).await?;
        let event = resolve_patch(&guard, &patch, today())?;
        self.commit(&mut guard, &event).await?;
        debug!("schedule {id} updated: status {}, {}/{}", guard.status, guard.occupancy, guard.capacity);
        Ok(())
    }

    pub async fn set_schedule_status(&self, id: Ulid, status: ScheduleStatus) -> Result<(), EngineError> {
        let patch = SchedulePatch {
            status: Some(status),
            ..Default::default()
        };
        self.update_schedule(id, patch).await
    }

    /// Delete a schedule with no booked seats, along with its cancelled history.
    pub async fn delete_schedule(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let (rs, guard) = self.lock_schedule(id).await?;
        if guard.occupancy > 0 {
            return Err(ConflictReason::HasBookings(guard.occupancy).into());
        }

        let event = Event::ScheduleDeleted { id };
        self.wal_append(&event).await?;
        self.store.remove_schedule_if(&id, &rs);
        self.store.unindex_schedule(&guard);
        debug!("schedule {id} deleted");
        Ok(())
    }

    // ── Appointments ─────────────────────────────────────────

    /// Reserve one seat on a schedule. The seat count is checked and taken
    /// under the row's write lock, so concurrent bookings serialize here.
    pub async fn book(
        &self,
        id: Ulid,
        schedule_id: Option<Ulid>,
        doctor_id: Option<Ulid>,
        patient_id: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        let result = self.try_book(id, schedule_id, doctor_id, patient_id).await;
        let outcome = match &result {
            Ok(_) => "booked",
            Err(e) => e.kind(),
        };
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn try_book(
        &self,
        id: Ulid,
        schedule_id: Option<Ulid>,
        doctor_id: Option<Ulid>,
        patient_id: Option<Ulid>,
    ) -> Result<Ulid, EngineError> {
        let patient_id = patient_id.ok_or(EngineError::Unauthenticated)?;
        let schedule_id = schedule_id.ok_or(EngineError::InvalidInput("schedule id is required"))?;
        let doctor_id = doctor_id.ok_or(EngineError::InvalidInput("doctor id is required"))?;

        let _gate = self.commit_gate.read().await;
        let (_, mut guard) = self.lock_schedule(schedule_id).await?;
        if guard.doctor_id != doctor_id {
            return Err(EngineError::InvalidInput("doctor does not match schedule"));
        }
        check_bookable(&guard)?;

        if !self.store.claim_appointment(id, schedule_id) {
            return Err(ConflictReason::AlreadyExists(id).into());
        }
        let event = Event::AppointmentBooked {
            id,
            schedule_id,
            doctor_id,
            patient_id,
            created_at: now_ms(),
        };
        if let Err(e) = self.commit(&mut guard, &event).await {
            self.store.release_appointment(&id);
            return Err(e);
        }
        debug!(
            "appointment {id} booked on {schedule_id}: {}/{} {}",
            guard.occupancy, guard.capacity, guard.status
        );
        Ok(id)
    }

    /// Change an appointment's status, its payment status, or both, as one
    /// commit. Both fields are checked before anything is written.
    ///
    /// Setting the status it already has is a no-op; taking a seat back runs
    /// the booking checks.
    pub async fn update_appointment(
        &self,
        id: Ulid,
        status: Option<AppointmentStatus>,
        payment_status: Option<String>,
    ) -> Result<(), EngineError> {
        if let Some(ref p) = payment_status {
            if p.trim().is_empty() {
                return Err(EngineError::InvalidInput("payment status is required"));
            }
            validate_text(p, MAX_PAYMENT_STATUS_LEN, "payment status too long")?;
        }

        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_appointment(id).await?;
        let schedule_id = guard.id;
        let current = guard
            .appointment(&id)
            .map(|a| a.status)
            .ok_or(EngineError::appointment_not_found(id))?;

        let moved = match (current, status) {
            (AppointmentStatus::Booked, Some(AppointmentStatus::Cancelled)) => {
                Some(AppointmentStatus::Cancelled)
            }
            (AppointmentStatus::Cancelled, Some(AppointmentStatus::Booked)) => {
                check_bookable(&guard)?;
                Some(AppointmentStatus::Booked)
            }
            _ => None,
        };

        let event = match (moved, payment_status) {
            (None, None) => return Ok(()),
            (Some(AppointmentStatus::Cancelled), None) => Event::AppointmentCancelled { id, schedule_id },
            (Some(AppointmentStatus::Booked), None) => Event::AppointmentRebooked { id, schedule_id },
            (None, Some(payment_status)) => Event::PaymentStatusSet { id, schedule_id, payment_status },
            (Some(status), Some(payment_status)) => Event::AppointmentUpdated {
                id,
                schedule_id,
                status,
                payment_status,
            },
        };
        self.commit(&mut guard, &event).await?;
        debug!("appointment {id} updated: {}/{} {}", guard.occupancy, guard.capacity, guard.status);
        Ok(())
    }

    pub async fn set_appointment_status(&self, id: Ulid, status: AppointmentStatus) -> Result<(), EngineError> {
        self.update_appointment(id, Some(status), None).await
    }

    pub async fn cancel_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        self.set_appointment_status(id, AppointmentStatus::Cancelled).await
    }

    /// Physically remove an appointment, giving its seat back if it held one.
    pub async fn delete_appointment(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guard = self.lock_appointment(id).await?;
        let event = Event::AppointmentDeleted { id, schedule_id: guard.id };
        self.commit(&mut guard, &event).await?;
        debug!("appointment {id} deleted");
        Ok(())
    }

    /// Record the payment collaborator's status string as-is.
    pub async fn set_payment_status(&self, id: Ulid, payment_status: String) -> Result<(), EngineError> {
        self.update_appointment(id, None, Some(payment_status)).await
    }

    // ── WAL maintenance ──────────────────────────────────────

    /// Rewrite the WAL with only the events needed to rebuild current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut events = Vec::new();
        for doctor in self.store.doctors() {
            events.push(Event::DoctorRegistered {
                id: doctor.id,
                name: doctor.name,
                specialization: doctor.specialization,
            });
        }
        for patient in self.store.patients() {
            events.push(Event::PatientRegistered {
                id: patient.id,
                first_name: patient.first_name,
                second_name: patient.second_name,
                phone: patient.phone,
            });
        }

        for (_, rs) in self.store.schedule_rows() {
            let guard = rs.read().await;
            events.push(Event::ScheduleCreated {
                id: guard.id,
                doctor_id: guard.doctor_id,
                date: guard.date,
                start: guard.start,
                end: guard.end,
                capacity: guard.capacity,
                price: guard.price,
            });
            for appointment in &guard.appointments {
                events.push(Event::AppointmentBooked {
                    id: appointment.id,
                    schedule_id: guard.id,
                    doctor_id: appointment.doctor_id,
                    patient_id: appointment.patient_id,
                    created_at: appointment.created_at,
                });
                if !appointment.is_booked() {
                    events.push(Event::AppointmentCancelled {
                        id: appointment.id,
                        schedule_id: guard.id,
                    });
                }
                if appointment.payment_status != DEFAULT_PAYMENT_STATUS {
                    events.push(Event::PaymentStatusSet {
                        id: appointment.id,
                        schedule_id: guard.id,
                        payment_status: appointment.payment_status.clone(),
                    });
                }
            }
            // Pins the exact status, including staff overrides.
            events.push(Event::ScheduleUpdated {
                id: guard.id,
                date: guard.date,
                start: guard.start,
                end: guard.end,
                capacity: guard.capacity,
                price: guard.price,
                status: guard.status,
            });
        }

        let count = events.len();
        self.wal_control(|response| WalControl::Compact { events, response })
            .await?
            .map_err(|e| EngineError::Internal(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> Result<u64, EngineError> {
        self.wal_control(|response| WalControl::AppendsSinceCompact { response })
            .await
    }
}
