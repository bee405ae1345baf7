use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::model::*;

use super::SharedScheduleState;

/// The tenant's rows: schedules (each behind its own lock), the
/// appointment → schedule index, and the doctor/patient directory.
pub struct Store {
    schedules: DashMap<Ulid, SharedScheduleState>,
    appointment_index: DashMap<Ulid, Ulid>,
    doctors: DashMap<Ulid, Doctor>,
    patients: DashMap<Ulid, Patient>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            schedules: DashMap::new(),
            appointment_index: DashMap::new(),
            doctors: DashMap::new(),
            patients: DashMap::new(),
        }
    }

    // ── Schedule rows ────────────────────────────────────────

    pub fn schedule_count(&self) -> usize {
        self.schedules.len()
    }

    pub fn get_schedule(&self, id: &Ulid) -> Option<SharedScheduleState> {
        self.schedules.get(id).map(|e| e.value().clone())
    }

    /// Insert only if the id is free. Returns false when taken.
    pub fn try_insert_schedule(&self, id: Ulid, state: SharedScheduleState) -> bool {
        match self.schedules.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
        }
    }

    /// Remove the row only if it is still `expected`.
    pub fn remove_schedule_if(&self, id: &Ulid, expected: &SharedScheduleState) -> bool {
        self.schedules
            .remove_if(id, |_, current| Arc::ptr_eq(current, expected))
            .is_some()
    }

    /// True while `rs` is the row registered under `id`. A writer that waited
    /// on the lock of a since-deleted row sees false.
    pub fn is_current(&self, id: &Ulid, rs: &SharedScheduleState) -> bool {
        self.schedules
            .get(id)
            .is_some_and(|e| Arc::ptr_eq(e.value(), rs))
    }

    pub fn schedule_rows(&self) -> Vec<(Ulid, SharedScheduleState)> {
        self.schedules
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    // ── Appointment index ────────────────────────────────────

    pub fn schedule_for_appointment(&self, appointment_id: &Ulid) -> Option<Ulid> {
        self.appointment_index.get(appointment_id).map(|e| *e.value())
    }

    /// Reserve an appointment id for a schedule. False if the id is in use.
    pub fn claim_appointment(&self, appointment_id: Ulid, schedule_id: Ulid) -> bool {
        match self.appointment_index.entry(appointment_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(schedule_id);
                true
            }
        }
    }

    pub fn release_appointment(&self, appointment_id: &Ulid) {
        self.appointment_index.remove(appointment_id);
    }

    // ── Directory ────────────────────────────────────────────

    pub fn directory_len(&self) -> usize {
        self.doctors.len() + self.patients.len()
    }

    pub fn doctor(&self, id: &Ulid) -> Option<Doctor> {
        self.doctors.get(id).map(|e| e.value().clone())
    }

    pub fn patient(&self, id: &Ulid) -> Option<Patient> {
        self.patients.get(id).map(|e| e.value().clone())
    }

    pub fn doctors(&self) -> Vec<Doctor> {
        self.doctors.iter().map(|e| e.value().clone()).collect()
    }

    pub fn patients(&self) -> Vec<Patient> {
        self.patients.iter().map(|e| e.value().clone()).collect()
    }

    // ── Event application ────────────────────────────────────

    /// Apply a directory event. Row events are ignored here.
    pub fn apply_directory(&self, event: &Event) {
        match event {
            Event::DoctorRegistered { id, name, specialization } => {
                self.doctors.insert(
                    *id,
                    Doctor {
                        id: *id,
                        name: name.clone(),
                        specialization: specialization.clone(),
                    },
                );
            }
            Event::PatientRegistered { id, first_name, second_name, phone } => {
                self.patients.insert(
                    *id,
                    Patient {
                        id: *id,
                        first_name: first_name.clone(),
                        second_name: second_name.clone(),
                        phone: phone.clone(),
                    },
                );
            }
            _ => {}
        }
    }

    /// Keep the appointment index in step with a row event.
    pub fn index_event(&self, event: &Event) {
        match event {
            Event::AppointmentBooked { id, schedule_id, .. } => {
                self.appointment_index.insert(*id, *schedule_id);
            }
            Event::AppointmentDeleted { id, .. } => {
                self.appointment_index.remove(id);
            }
            _ => {}
        }
    }

    /// Forget every appointment id held by a deleted row.
    pub fn unindex_schedule(&self, rs: &ScheduleState) {
        for appointment in &rs.appointments {
            self.appointment_index.remove(&appointment.id);
        }
    }
}

/// Apply a committed row event to its schedule. This is the only place
/// occupancy and status change, for live commits and WAL replay alike.
pub fn apply_to_schedule(rs: &mut ScheduleState, event: &Event) {
    match event {
        Event::ScheduleUpdated { date, start, end, capacity, price, status, .. } => {
            rs.date = *date;
            rs.start = *start;
            rs.end = *end;
            rs.capacity = *capacity;
            rs.price = *price;
            rs.status = *status;
        }
        Event::AppointmentBooked { id, schedule_id, doctor_id, patient_id, created_at } => {
            rs.appointments.push(Appointment {
                id: *id,
                schedule_id: *schedule_id,
                doctor_id: *doctor_id,
                patient_id: *patient_id,
                status: AppointmentStatus::Booked,
                payment_status: DEFAULT_PAYMENT_STATUS.to_string(),
                created_at: *created_at,
            });
            rs.reserve_seat();
        }
        Event::AppointmentCancelled { id, .. } => {
            move_appointment(rs, id, AppointmentStatus::Cancelled);
        }
        Event::AppointmentRebooked { id, .. } => {
            move_appointment(rs, id, AppointmentStatus::Booked);
        }
        Event::AppointmentDeleted { id, .. } => {
            if let Some(removed) = rs.remove_appointment(id)
                && removed.is_booked()
            {
                rs.release_seat();
            }
        }
        Event::PaymentStatusSet { id, payment_status, .. } => {
            if let Some(appointment) = rs.appointment_mut(id) {
                appointment.payment_status = payment_status.clone();
            }
        }
        Event::AppointmentUpdated { id, status, payment_status, .. } => {
            move_appointment(rs, id, *status);
            if let Some(appointment) = rs.appointment_mut(id) {
                appointment.payment_status = payment_status.clone();
            }
        }
        // Row creation/removal and the directory live at the map level.
        Event::ScheduleCreated { .. }
        | Event::ScheduleDeleted { .. }
        | Event::DoctorRegistered { .. }
        | Event::PatientRegistered { .. } => {}
    }
}

/// Flip an appointment to `status`, taking or giving back its seat. Setting
/// the status it already has changes nothing.
fn move_appointment(rs: &mut ScheduleState, id: &Ulid, status: AppointmentStatus) {
    let Some(appointment) = rs.appointment_mut(id) else {
        return;
    };
    if appointment.status == status {
        return;
    }
    appointment.status = status;
    match status {
        AppointmentStatus::Booked => rs.reserve_seat(),
        AppointmentStatus::Cancelled => rs.release_seat(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use tokio::sync::RwLock;

    fn row() -> ScheduleState {
        ScheduleState::new(
            Ulid::new(),
            Ulid::new(),
            NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            2,
            0,
        )
    }

    fn book(rs: &mut ScheduleState) -> Ulid {
        let id = Ulid::new();
        apply_to_schedule(
            rs,
            &Event::AppointmentBooked {
                id,
                schedule_id: rs.id,
                doctor_id: rs.doctor_id,
                patient_id: Ulid::new(),
                created_at: 0,
            },
        );
        id
    }

    #[test]
    fn booking_then_cancel_then_rebook() {
        let mut rs = row();
        let a = book(&mut rs);
        book(&mut rs);
        assert_eq!(rs.occupancy, 2);
        assert_eq!(rs.status, ScheduleStatus::Full);

        let cancel = Event::AppointmentCancelled { id: a, schedule_id: rs.id };
        apply_to_schedule(&mut rs, &cancel);
        assert_eq!(rs.occupancy, 1);
        assert_eq!(rs.status, ScheduleStatus::Active);

        // Second cancel of the same appointment changes nothing.
        apply_to_schedule(&mut rs, &cancel);
        assert_eq!(rs.occupancy, 1);

        let sid = rs.id;
        apply_to_schedule(&mut rs, &Event::AppointmentRebooked { id: a, schedule_id: sid });
        assert_eq!(rs.occupancy, 2);
        assert_eq!(rs.status, ScheduleStatus::Full);
        assert_eq!(rs.booked_count(), rs.occupancy);
    }

    #[test]
    fn deleting_cancelled_appointment_keeps_occupancy() {
        let mut rs = row();
        let a = book(&mut rs);
        book(&mut rs);
        let sid = rs.id;
        apply_to_schedule(&mut rs, &Event::AppointmentCancelled { id: a, schedule_id: sid });
        apply_to_schedule(&mut rs, &Event::AppointmentDeleted { id: a, schedule_id: sid });
        assert_eq!(rs.occupancy, 1);
        assert_eq!(rs.appointments.len(), 1);
    }

    #[test]
    fn payment_status_is_stored_verbatim() {
        let mut rs = row();
        let a = book(&mut rs);
        let sid = rs.id;
        apply_to_schedule(
            &mut rs,
            &Event::PaymentStatusSet {
                id: a,
                schedule_id: sid,
                payment_status: "SUCCESS".into(),
            },
        );
        assert_eq!(rs.appointment(&a).unwrap().payment_status, "SUCCESS");
        assert_eq!(rs.occupancy, 1);
    }

    #[test]
    fn claim_is_exclusive() {
        let store = Store::new();
        let id = Ulid::new();
        assert!(store.claim_appointment(id, Ulid::new()));
        assert!(!store.claim_appointment(id, Ulid::new()));
        store.release_appointment(&id);
        assert!(store.claim_appointment(id, Ulid::new()));
    }

    #[test]
    fn stale_row_is_not_current() {
        let store = Store::new();
        let rs = row();
        let id = rs.id;
        let first: SharedScheduleState = Arc::new(RwLock::new(rs.clone()));
        let second: SharedScheduleState = Arc::new(RwLock::new(rs));
        assert!(store.try_insert_schedule(id, first.clone()));
        assert!(!store.try_insert_schedule(id, second.clone()));
        assert!(store.is_current(&id, &first));
        assert!(!store.is_current(&id, &second));
        assert!(!store.remove_schedule_if(&id, &second));
        assert!(store.remove_schedule_if(&id, &first));
        assert!(!store.is_current(&id, &first));
    }

    #[test]
    fn directory_upserts() {
        let store = Store::new();
        let id = Ulid::new();
        store.apply_directory(&Event::DoctorRegistered {
            id,
            name: "Dr. Silva".into(),
            specialization: "ENT".into(),
        });
        store.apply_directory(&Event::DoctorRegistered {
            id,
            name: "Dr. Silva".into(),
            specialization: "Pediatrics".into(),
        });
        assert_eq!(store.doctor(&id).unwrap().specialization, "Pediatrics");
        assert_eq!(store.directory_len(), 1);
    }
}
