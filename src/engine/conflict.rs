use crate::limits::*;
use crate::model::*;

use super::LoanRejection;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Apply the date bounds of the borrowing policy. Checks run in a fixed
/// order and the first failure wins. All comparisons use day-truncated
/// values so that a same-day start is never "in the past".
pub fn validate_period(
    start: Option<Ms>,
    end: Option<Ms>,
    now: Ms,
) -> Result<LoanPeriod, LoanRejection> {
    let (Some(start), Some(end)) = (start, end) else {
        return Err(LoanRejection::MissingDates);
    };
    let today = day_floor(now);
    let start = day_floor(start);
    let end = day_floor(end);

    if start < today {
        return Err(LoanRejection::StartInPast);
    }
    if start > today + MAX_START_AHEAD_MS {
        return Err(LoanRejection::StartBeyondHorizon);
    }
    if end < start {
        return Err(LoanRejection::EndBeforeStart);
    }
    if end > start + MAX_LOAN_DURATION_MS {
        return Err(LoanRejection::PeriodTooLong);
    }
    Ok(LoanPeriod::new(start, end))
}

/// Reject `period` if any existing loan of the item overlaps it.
pub fn check_no_conflict(item: &EquipmentState, period: &LoanPeriod) -> Result<(), LoanRejection> {
    match item.overlapping(period).next() {
        Some(existing) => Err(LoanRejection::AlreadyOnLoan(existing.id)),
        None => Ok(()),
    }
}

/// Full policy for a loan request against one item: date bounds, then overlap.
pub fn check_loan(
    item: &EquipmentState,
    start: Option<Ms>,
    end: Option<Ms>,
    now: Ms,
) -> Result<LoanPeriod, LoanRejection> {
    let period = validate_period(start, end, now)?;
    check_no_conflict(item, &period)?;
    Ok(period)
}
