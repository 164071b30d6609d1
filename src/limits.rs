use crate::model::{DAY_MS, Ms};

// ── Tenants ─────────────────────────────────────────────────────

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

// ── Catalog ─────────────────────────────────────────────────────

pub const MAX_USERS_PER_TENANT: usize = 100_000;
pub const MAX_EQUIPMENT_PER_TENANT: usize = 100_000;
pub const MAX_LOANS_PER_EQUIPMENT: usize = 10_000;

pub const MAX_NAME_LEN: usize = 30;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_EQUIPMENT_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2_000;
pub const MAX_REFERENCE_LEN: usize = 64;
pub const MAX_KIND_LEN: usize = 64;

/// Reference suffixes are drawn from `0..REFERENCE_SUFFIX_RANGE`.
pub const REFERENCE_SUFFIX_RANGE: u128 = 10_000;
pub const MAX_REFERENCE_ATTEMPTS: usize = 64;

// ── Borrowing policy ────────────────────────────────────────────

/// Furthest a loan may start after today.
pub const MAX_START_AHEAD_MS: Ms = 365 * DAY_MS;

/// Longest loan: half of a 365-day year.
pub const MAX_LOAN_DURATION_MS: Ms = 365 * DAY_MS / 2;

// ── Wire ────────────────────────────────────────────────────────

pub const MAX_SQL_LEN: usize = 64 * 1024;
