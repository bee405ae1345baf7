use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Price in minor currency units (cents).
pub type Price = i64;

pub const DEFAULT_PAYMENT_STATUS: &str = "PENDING";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status value: {0}")]
pub struct UnknownStatus(pub String);

/// Lifecycle of a schedule. `Cancelled` is only ever set by staff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Active,
    Full,
    Cancelled,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Active => "active",
            ScheduleStatus::Full => "full",
            ScheduleStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "active" => Ok(ScheduleStatus::Active),
            "full" => Ok(ScheduleStatus::Full),
            "cancelled" => Ok(ScheduleStatus::Cancelled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppointmentStatus {
    Booked,
    Cancelled,
}

impl AppointmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppointmentStatus::Booked => "booked",
            AppointmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "booked" => Ok(AppointmentStatus::Booked),
            "cancelled" => Ok(AppointmentStatus::Cancelled),
            _ => Err(UnknownStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Doctor {
    pub id: Ulid,
    pub name: String,
    pub specialization: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patient {
    pub id: Ulid,
    pub first_name: String,
    pub second_name: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub id: Ulid,
    pub schedule_id: Ulid,
    /// Denormalized from the schedule at booking time.
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub status: AppointmentStatus,
    /// Written by the payment collaborator; never interpreted here.
    pub payment_status: String,
    pub created_at: Ms,
}

impl Appointment {
    pub fn is_booked(&self) -> bool {
        self.status == AppointmentStatus::Booked
    }
}

/// One schedule row. Its appointments live inside it so that the row lock
/// guards both the occupancy counter and the appointment set.
#[derive(Debug, Clone)]
pub struct ScheduleState {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    /// Max patients.
    pub capacity: u32,
    /// Booked count.
    pub occupancy: u32,
    pub price: Price,
    pub status: ScheduleStatus,
    /// Booking order. Cancelled appointments stay for audit.
    pub appointments: Vec<Appointment>,
}

impl ScheduleState {
    pub fn new(
        id: Ulid,
        doctor_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        capacity: u32,
        price: Price,
    ) -> Self {
        Self {
            id,
            doctor_id,
            date,
            start,
            end,
            capacity,
            occupancy: 0,
            price,
            status: ScheduleStatus::Active,
            appointments: Vec::new(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.occupancy >= self.capacity
    }

    /// Number of appointments currently holding a seat.
    pub fn booked_count(&self) -> u32 {
        self.appointments.iter().filter(|a| a.is_booked()).count() as u32
    }

    pub fn appointment(&self, id: &Ulid) -> Option<&Appointment> {
        self.appointments.iter().find(|a| a.id == *id)
    }

    pub fn appointment_mut(&mut self, id: &Ulid) -> Option<&mut Appointment> {
        self.appointments.iter_mut().find(|a| a.id == *id)
    }

    pub fn remove_appointment(&mut self, id: &Ulid) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == *id)?;
        Some(self.appointments.remove(pos))
    }

    /// Take one seat. The caller has already checked status and capacity.
    pub fn reserve_seat(&mut self) {
        self.occupancy += 1;
        if self.occupancy >= self.capacity {
            self.status = ScheduleStatus::Full;
        }
    }

    /// Give one seat back, floored at zero. A full schedule reopens.
    pub fn release_seat(&mut self) {
        self.occupancy = self.occupancy.saturating_sub(1);
        if self.status == ScheduleStatus::Full {
            self.status = ScheduleStatus::Active;
        }
    }
}

/// Staff edit of a schedule. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulePatch {
    pub date: Option<NaiveDate>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
    pub capacity: Option<u32>,
    pub price: Option<Price>,
    pub status: Option<ScheduleStatus>,
}

impl SchedulePatch {
    pub fn is_empty(&self) -> bool {
        self.date.is_none()
            && self.start.is_none()
            && self.end.is_none()
            && self.capacity.is_none()
            && self.price.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleFilter {
    pub date: Option<NaiveDate>,
    pub specialization: Option<String>,
    pub doctor_id: Option<Ulid>,
}

/// The WAL record format. Each variant is one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DoctorRegistered {
        id: Ulid,
        name: String,
        specialization: String,
    },
    PatientRegistered {
        id: Ulid,
        first_name: String,
        second_name: String,
        phone: Option<String>,
    },
    ScheduleCreated {
        id: Ulid,
        doctor_id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        capacity: u32,
        price: Price,
    },
    /// Carries the fully resolved row attributes, not the patch.
    ScheduleUpdated {
        id: Ulid,
        date: NaiveDate,
        start: NaiveTime,
        end: NaiveTime,
        capacity: u32,
        price: Price,
        status: ScheduleStatus,
    },
    ScheduleDeleted {
        id: Ulid,
    },
    AppointmentBooked {
        id: Ulid,
        schedule_id: Ulid,
        doctor_id: Ulid,
        patient_id: Ulid,
        created_at: Ms,
    },
    AppointmentCancelled {
        id: Ulid,
        schedule_id: Ulid,
    },
    /// A cancelled appointment taking its seat back.
    AppointmentRebooked {
        id: Ulid,
        schedule_id: Ulid,
    },
    AppointmentDeleted {
        id: Ulid,
        schedule_id: Ulid,
    },
    PaymentStatusSet {
        id: Ulid,
        schedule_id: Ulid,
        payment_status: String,
    },
    /// A status change and a payment status written by one statement.
    AppointmentUpdated {
        id: Ulid,
        schedule_id: Ulid,
        status: AppointmentStatus,
        payment_status: String,
    },
}

impl Event {
    /// The schedule row this event mutates, if any.
    pub fn schedule_id(&self) -> Option<Ulid> {
        match self {
            Event::ScheduleCreated { id, .. }
            | Event::ScheduleUpdated { id, .. }
            | Event::ScheduleDeleted { id } => Some(*id),
            Event::AppointmentBooked { schedule_id, .. }
            | Event::AppointmentCancelled { schedule_id, .. }
            | Event::AppointmentRebooked { schedule_id, .. }
            | Event::AppointmentDeleted { schedule_id, .. }
            | Event::PaymentStatusSet { schedule_id, .. }
            | Event::AppointmentUpdated { schedule_id, .. } => Some(*schedule_id),
            Event::DoctorRegistered { .. } | Event::PatientRegistered { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// A schedule joined with its doctor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleInfo {
    pub id: Ulid,
    pub doctor_id: Ulid,
    pub doctor_name: Option<String>,
    pub specialization: Option<String>,
    pub date: NaiveDate,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub capacity: u32,
    pub occupancy: u32,
    pub price: Price,
    pub status: ScheduleStatus,
}

/// An appointment joined with the patient's contact details.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppointmentInfo {
    pub id: Ulid,
    pub schedule_id: Ulid,
    pub doctor_id: Ulid,
    pub patient_id: Ulid,
    pub first_name: Option<String>,
    pub second_name: Option<String>,
    pub phone: Option<String>,
    pub status: AppointmentStatus,
    pub payment_status: String,
    pub created_at: Ms,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn schedule(capacity: u32) -> ScheduleState {
        ScheduleState::new(
            Ulid::new(),
            Ulid::new(),
            date(2030, 1, 15),
            time(9, 0),
            time(12, 0),
            capacity,
            2500,
        )
    }

    fn appointment(schedule: &ScheduleState, status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            schedule_id: schedule.id,
            doctor_id: schedule.doctor_id,
            patient_id: Ulid::new(),
            status,
            payment_status: DEFAULT_PAYMENT_STATUS.into(),
            created_at: 0,
        }
    }

    #[test]
    fn new_schedule_is_active_and_empty() {
        let s = schedule(3);
        assert_eq!(s.status, ScheduleStatus::Active);
        assert_eq!(s.occupancy, 0);
        assert!(!s.is_full());
        assert!(s.appointments.is_empty());
    }

    #[test]
    fn reserve_last_seat_marks_full() {
        let mut s = schedule(2);
        s.reserve_seat();
        assert_eq!(s.status, ScheduleStatus::Active);
        s.reserve_seat();
        assert_eq!(s.occupancy, 2);
        assert_eq!(s.status, ScheduleStatus::Full);
        assert!(s.is_full());
    }

    #[test]
    fn release_reopens_full_schedule() {
        let mut s = schedule(1);
        s.reserve_seat();
        s.release_seat();
        assert_eq!(s.occupancy, 0);
        assert_eq!(s.status, ScheduleStatus::Active);
    }

    #[test]
    fn release_floors_at_zero() {
        let mut s = schedule(1);
        s.release_seat();
        assert_eq!(s.occupancy, 0);
    }

    #[test]
    fn release_keeps_cancelled_schedule_cancelled() {
        let mut s = schedule(2);
        s.reserve_seat();
        s.status = ScheduleStatus::Cancelled;
        s.release_seat();
        assert_eq!(s.status, ScheduleStatus::Cancelled);
    }

    #[test]
    fn booked_count_ignores_cancelled() {
        let mut s = schedule(5);
        let a = appointment(&s, AppointmentStatus::Booked);
        let b = appointment(&s, AppointmentStatus::Cancelled);
        s.appointments.push(a);
        s.appointments.push(b);
        assert_eq!(s.booked_count(), 1);
    }

    #[test]
    fn remove_appointment_by_id() {
        let mut s = schedule(5);
        let a = appointment(&s, AppointmentStatus::Booked);
        let id = a.id;
        s.appointments.push(a);
        assert!(s.remove_appointment(&Ulid::new()).is_none());
        assert_eq!(s.remove_appointment(&id).map(|a| a.id), Some(id));
        assert!(s.appointments.is_empty());
    }

    #[test]
    fn status_parsing() {
        assert_eq!("active".parse::<ScheduleStatus>(), Ok(ScheduleStatus::Active));
        assert_eq!("FULL".parse::<ScheduleStatus>(), Ok(ScheduleStatus::Full));
        assert_eq!(" cancelled ".parse::<ScheduleStatus>(), Ok(ScheduleStatus::Cancelled));
        assert!("closed".parse::<ScheduleStatus>().is_err());

        assert_eq!("booked".parse::<AppointmentStatus>(), Ok(AppointmentStatus::Booked));
        assert_eq!("Cancelled".parse::<AppointmentStatus>(), Ok(AppointmentStatus::Cancelled));
        let err = "done".parse::<AppointmentStatus>().unwrap_err();
        assert_eq!(err.to_string(), "invalid status value: done");
    }

    #[test]
    fn empty_patch() {
        assert!(SchedulePatch::default().is_empty());
        let patch = SchedulePatch {
            price: Some(0),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn event_schedule_id() {
        let sid = Ulid::new();
        let booked = Event::AppointmentBooked {
            id: Ulid::new(),
            schedule_id: sid,
            doctor_id: Ulid::new(),
            patient_id: Ulid::new(),
            created_at: 1,
        };
        assert_eq!(booked.schedule_id(), Some(sid));
        assert_eq!(Event::ScheduleDeleted { id: sid }.schedule_id(), Some(sid));
        let doc = Event::DoctorRegistered {
            id: Ulid::new(),
            name: "Dr. Perera".into(),
            specialization: "Cardiology".into(),
        };
        assert_eq!(doc.schedule_id(), None);
    }

    #[test]
    fn event_bincode_keeps_calendar_fields() {
        let event = Event::ScheduleCreated {
            id: Ulid::new(),
            doctor_id: Ulid::new(),
            date: date(2031, 2, 28),
            start: time(8, 30),
            end: time(10, 0),
            capacity: 12,
            price: 150_000,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
