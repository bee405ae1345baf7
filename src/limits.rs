//! Hard caps that keep a single tenant from exhausting memory or the WAL.

pub const MAX_TENANTS: usize = 256;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_SCHEDULES_PER_TENANT: usize = 100_000;
pub const MAX_DIRECTORY_ENTRIES: usize = 1_000_000;

/// Upper bound for a schedule's max patients.
pub const MAX_CAPACITY: u32 = 1_000;
/// Booked plus cancelled appointments kept on one schedule.
pub const MAX_APPOINTMENTS_PER_SCHEDULE: usize = 10_000;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_PHONE_LEN: usize = 32;
pub const MAX_PAYMENT_STATUS_LEN: usize = 64;
