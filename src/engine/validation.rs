use chrono::{Local, NaiveDate, NaiveTime, Utc};

use crate::limits::*;
use crate::model::*;

use super::{ConflictReason, EngineError};

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// The clinic's calendar day.
pub(crate) fn today() -> NaiveDate {
    Local::now().date_naive()
}

pub(crate) fn validate_date(date: NaiveDate, today: NaiveDate) -> Result<(), EngineError> {
    if date < today {
        return Err(EngineError::InvalidInput("schedule date cannot be in the past"));
    }
    Ok(())
}

pub(crate) fn validate_times(start: NaiveTime, end: NaiveTime) -> Result<(), EngineError> {
    if start >= end {
        return Err(EngineError::InvalidInput("start time must be before end time"));
    }
    Ok(())
}

pub(crate) fn validate_capacity(capacity: u32) -> Result<(), EngineError> {
    if capacity == 0 {
        return Err(EngineError::InvalidInput("max patients must be greater than 0"));
    }
    if capacity > MAX_CAPACITY {
        return Err(EngineError::LimitExceeded("max patients too large"));
    }
    Ok(())
}

pub(crate) fn validate_price(price: Price) -> Result<(), EngineError> {
    if price < 0 {
        return Err(EngineError::InvalidInput("price cannot be negative"));
    }
    Ok(())
}

pub(crate) fn validate_text(value: &str, max_len: usize, what: &'static str) -> Result<(), EngineError> {
    if value.len() > max_len {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

/// A seat can be taken only from an active schedule with room left.
pub(crate) fn check_bookable(rs: &ScheduleState) -> Result<(), EngineError> {
    if rs.status != ScheduleStatus::Active {
        return Err(ConflictReason::ScheduleNotActive(rs.status).into());
    }
    if rs.is_full() {
        return Err(ConflictReason::ScheduleFull.into());
    }
    if rs.appointments.len() >= MAX_APPOINTMENTS_PER_SCHEDULE {
        return Err(EngineError::LimitExceeded("too many appointments on schedule"));
    }
    Ok(())
}

/// Resolve a staff patch against the current row into the `ScheduleUpdated`
/// event to commit. Capacity changes move the status between active and full
/// on their own unless the patch names a status explicitly.
pub(crate) fn resolve_patch(
    rs: &ScheduleState,
    patch: &SchedulePatch,
    today: NaiveDate,
) -> Result<Event, EngineError> {
    if patch.is_empty() {
        return Err(EngineError::InvalidInput("no fields to update"));
    }

    if let Some(date) = patch.date {
        validate_date(date, today)?;
    }
    let start = patch.start.unwrap_or(rs.start);
    let end = patch.end.unwrap_or(rs.end);
    if patch.start.is_some() || patch.end.is_some() {
        validate_times(start, end)?;
    }

    let mut status = rs.status;
    if let Some(capacity) = patch.capacity {
        validate_capacity(capacity)?;
        if capacity < rs.occupancy {
            return Err(ConflictReason::CapacityBelowBooked {
                capacity,
                booked: rs.occupancy,
            }
            .into());
        }
        if patch.status.is_none() {
            if capacity > rs.occupancy && rs.status == ScheduleStatus::Full {
                status = ScheduleStatus::Active;
            } else if capacity == rs.occupancy && rs.status == ScheduleStatus::Active {
                status = ScheduleStatus::Full;
            }
        }
    }

    if let Some(price) = patch.price {
        validate_price(price)?;
    }
    if let Some(explicit) = patch.status {
        status = explicit;
    }

    Ok(Event::ScheduleUpdated {
        id: rs.id,
        date: patch.date.unwrap_or(rs.date),
        start,
        end,
        capacity: patch.capacity.unwrap_or(rs.capacity),
        price: patch.price.unwrap_or(rs.price),
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 6, d).unwrap()
    }

    fn at(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn row(capacity: u32, occupancy: u32, status: ScheduleStatus) -> ScheduleState {
        let mut rs = ScheduleState::new(Ulid::new(), Ulid::new(), day(10), at(9), at(12), capacity, 1000);
        rs.occupancy = occupancy;
        rs.status = status;
        rs
    }

    fn resolved_status(event: &Event) -> ScheduleStatus {
        match event {
            Event::ScheduleUpdated { status, .. } => *status,
            other => panic!("expected ScheduleUpdated, got {other:?}"),
        }
    }

    #[test]
    fn past_date_rejected_today_allowed() {
        assert!(validate_date(day(9), day(10)).is_err());
        assert!(validate_date(day(10), day(10)).is_ok());
        assert!(validate_date(day(11), day(10)).is_ok());
    }

    #[test]
    fn capacity_and_price_bounds() {
        assert!(matches!(validate_capacity(0), Err(EngineError::InvalidInput(_))));
        assert!(validate_capacity(1).is_ok());
        assert!(matches!(
            validate_capacity(MAX_CAPACITY + 1),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(validate_price(-1), Err(EngineError::InvalidInput(_))));
        assert!(validate_price(0).is_ok());
    }

    #[test]
    fn times_must_be_ordered() {
        assert!(validate_times(at(9), at(10)).is_ok());
        assert!(validate_times(at(10), at(10)).is_err());
        assert!(validate_times(at(11), at(10)).is_err());
    }

    #[test]
    fn bookable_checks_status_before_capacity() {
        let cancelled_and_full = row(1, 1, ScheduleStatus::Cancelled);
        assert!(matches!(
            check_bookable(&cancelled_and_full),
            Err(EngineError::Conflict(ConflictReason::ScheduleNotActive(ScheduleStatus::Cancelled)))
        ));
        assert!(matches!(
            check_bookable(&row(2, 2, ScheduleStatus::Active)),
            Err(EngineError::Conflict(ConflictReason::ScheduleFull))
        ));
        assert!(check_bookable(&row(2, 1, ScheduleStatus::Active)).is_ok());
    }

    #[test]
    fn empty_patch_rejected() {
        let rs = row(3, 0, ScheduleStatus::Active);
        assert!(matches!(
            resolve_patch(&rs, &SchedulePatch::default(), day(1)),
            Err(EngineError::InvalidInput("no fields to update"))
        ));
    }

    #[test]
    fn shrinking_below_booked_is_conflict() {
        let rs = row(5, 3, ScheduleStatus::Active);
        let patch = SchedulePatch { capacity: Some(2), ..Default::default() };
        assert!(matches!(
            resolve_patch(&rs, &patch, day(1)),
            Err(EngineError::Conflict(ConflictReason::CapacityBelowBooked { capacity: 2, booked: 3 }))
        ));
    }

    #[test]
    fn growing_full_schedule_reopens_it() {
        let rs = row(3, 3, ScheduleStatus::Full);
        let patch = SchedulePatch { capacity: Some(4), ..Default::default() };
        let event = resolve_patch(&rs, &patch, day(1)).unwrap();
        assert_eq!(resolved_status(&event), ScheduleStatus::Active);
    }

    #[test]
    fn shrinking_to_booked_count_fills_it() {
        let rs = row(5, 3, ScheduleStatus::Active);
        let patch = SchedulePatch { capacity: Some(3), ..Default::default() };
        let event = resolve_patch(&rs, &patch, day(1)).unwrap();
        assert_eq!(resolved_status(&event), ScheduleStatus::Full);
    }

    #[test]
    fn explicit_status_wins_over_capacity_rule() {
        let rs = row(3, 3, ScheduleStatus::Full);
        let patch = SchedulePatch {
            capacity: Some(5),
            status: Some(ScheduleStatus::Cancelled),
            ..Default::default()
        };
        let event = resolve_patch(&rs, &patch, day(1)).unwrap();
        assert_eq!(resolved_status(&event), ScheduleStatus::Cancelled);
    }

    #[test]
    fn capacity_rule_leaves_cancelled_alone() {
        let rs = row(3, 3, ScheduleStatus::Cancelled);
        let patch = SchedulePatch { capacity: Some(6), ..Default::default() };
        let event = resolve_patch(&rs, &patch, day(1)).unwrap();
        assert_eq!(resolved_status(&event), ScheduleStatus::Cancelled);
    }

    #[test]
    fn patch_merges_unchanged_fields() {
        let rs = row(4, 1, ScheduleStatus::Active);
        let patch = SchedulePatch { price: Some(4500), end: Some(at(13)), ..Default::default() };
        let event = resolve_patch(&rs, &patch, day(1)).unwrap();
        assert_eq!(
            event,
            Event::ScheduleUpdated {
                id: rs.id,
                date: rs.date,
                start: at(9),
                end: at(13),
                capacity: 4,
                price: 4500,
                status: ScheduleStatus::Active,
            }
        );
    }

    #[test]
    fn patch_rejects_inverted_times_and_past_date() {
        let rs = row(4, 0, ScheduleStatus::Active);
        let inverted = SchedulePatch { start: Some(at(13)), ..Default::default() };
        assert!(resolve_patch(&rs, &inverted, day(1)).is_err());
        let past = SchedulePatch { date: Some(day(1)), ..Default::default() };
        assert!(resolve_patch(&rs, &past, day(2)).is_err());
        let negative = SchedulePatch { price: Some(-5), ..Default::default() };
        assert!(resolve_patch(&rs, &negative, day(1)).is_err());
    }
}
