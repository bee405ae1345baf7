use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    fn schedule_info(&self, rs: &ScheduleState) -> ScheduleInfo {
        let doctor = self.store.doctor(&rs.doctor_id);
        ScheduleInfo {
            id: rs.id,
            doctor_id: rs.doctor_id,
            doctor_name: doctor.as_ref().map(|d| d.name.clone()),
            specialization: doctor.map(|d| d.specialization),
            date: rs.date,
            start: rs.start,
            end: rs.end,
            capacity: rs.capacity,
            occupancy: rs.occupancy,
            price: rs.price,
            status: rs.status,
        }
    }

    fn appointment_info(&self, appointment: &Appointment) -> AppointmentInfo {
        let patient = self.store.patient(&appointment.patient_id);
        AppointmentInfo {
            id: appointment.id,
            schedule_id: appointment.schedule_id,
            doctor_id: appointment.doctor_id,
            patient_id: appointment.patient_id,
            first_name: patient.as_ref().map(|p| p.first_name.clone()),
            second_name: patient.as_ref().map(|p| p.second_name.clone()),
            phone: patient.and_then(|p| p.phone),
            status: appointment.status,
            payment_status: appointment.payment_status.clone(),
            created_at: appointment.created_at,
        }
    }

    /// Schedules matching every set filter. A single day is listed by doctor
    /// name then start time; otherwise by date, start time and doctor name.
    /// Each row is read under its own read lock.
    pub async fn list_schedules(&self, filter: &ScheduleFilter) -> Vec<ScheduleInfo> {
        let mut out = Vec::new();
        for (id, rs) in self.store.schedule_rows() {
            let guard = rs.read().await;
            if !self.store.is_current(&id, &rs) {
                continue;
            }
            if filter.date.is_some_and(|d| d != guard.date) {
                continue;
            }
            if filter.doctor_id.is_some_and(|d| d != guard.doctor_id) {
                continue;
            }
            let info = self.schedule_info(&guard);
            drop(guard);
            if let Some(ref wanted) = filter.specialization
                && !info
                    .specialization
                    .as_deref()
                    .is_some_and(|s| s.eq_ignore_ascii_case(wanted))
            {
                continue;
            }
            out.push(info);
        }
        if filter.date.is_some() {
            out.sort_by(|a, b| (&a.doctor_name, a.start, a.id).cmp(&(&b.doctor_name, b.start, b.id)));
        } else {
            out.sort_by(|a, b| {
                (a.date, a.start, &a.doctor_name, a.id).cmp(&(b.date, b.start, &b.doctor_name, b.id))
            });
        }
        out
    }

    pub async fn get_schedule(&self, id: Ulid) -> Result<ScheduleInfo, EngineError> {
        let rs = self
            .store
            .get_schedule(&id)
            .ok_or(EngineError::schedule_not_found(id))?;
        let guard = rs.read().await;
        if !self.store.is_current(&id, &rs) {
            return Err(EngineError::schedule_not_found(id));
        }
        Ok(self.schedule_info(&guard))
    }

    /// Appointments of a schedule, oldest first. An unknown schedule has none.
    pub async fn list_appointments(&self, schedule_id: Ulid) -> Vec<AppointmentInfo> {
        let rs = match self.store.get_schedule(&schedule_id) {
            Some(rs) => rs,
            None => return vec![],
        };
        let guard = rs.read().await;
        if !self.store.is_current(&schedule_id, &rs) {
            return vec![];
        }
        let mut out: Vec<AppointmentInfo> = guard
            .appointments
            .iter()
            .map(|a| self.appointment_info(a))
            .collect();
        out.sort_by_key(|a| (a.created_at, a.id));
        out
    }

    pub async fn get_appointment(&self, id: Ulid) -> Result<AppointmentInfo, EngineError> {
        let schedule_id = self
            .store
            .schedule_for_appointment(&id)
            .ok_or(EngineError::appointment_not_found(id))?;
        let rs = self
            .store
            .get_schedule(&schedule_id)
            .ok_or(EngineError::appointment_not_found(id))?;
        let guard = rs.read().await;
        if !self.store.is_current(&schedule_id, &rs) {
            return Err(EngineError::appointment_not_found(id));
        }
        guard
            .appointment(&id)
            .map(|a| self.appointment_info(a))
            .ok_or(EngineError::appointment_not_found(id))
    }

    /// Doctors in the directory, by name.
    pub fn list_doctors(&self) -> Vec<Doctor> {
        let mut doctors = self.store.doctors();
        doctors.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        doctors
    }
}
