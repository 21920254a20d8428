//! Hard limits. Requests that exceed these are rejected up front so one
//! tenant cannot exhaust memory or wedge the WAL writer.

use crate::model::Ms;

pub const MAX_VEHICLES_PER_TENANT: usize = 10_000;
pub const MAX_RESERVATIONS_PER_VEHICLE: usize = 50_000;
pub const MAX_LINKS_PER_VEHICLE: usize = 16;
pub const MAX_EVENTS_PER_LINK: usize = 5_000;

/// Widest reservation or query range, in days (~3 years).
pub const MAX_RANGE_DAYS: u64 = 1_100;

pub const MAX_LABEL_LEN: usize = 256;
pub const MAX_SOURCE_LABEL_LEN: usize = 64;
pub const MAX_FEED_URL_LEN: usize = 2_048;

/// Feed payloads larger than this fail decoding outright.
pub const MAX_FEED_BYTES: usize = 4 * 1024 * 1024;

pub const MAX_TENANTS: usize = 4_096;
pub const MAX_TENANT_NAME_LEN: usize = 256;

pub const DEFAULT_FETCH_TIMEOUT_MS: Ms = 10_000;
pub const DEFAULT_SYNC_CONCURRENCY: usize = 8;
