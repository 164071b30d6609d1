use ulid::Ulid;

use crate::validate::FieldError;

/// Why a loan request was refused by the borrowing policy.
/// Variants are listed in the order the checks run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoanRejection {
    MissingDates,
    StartInPast,
    StartBeyondHorizon,
    EndBeforeStart,
    PeriodTooLong,
    /// Carries the id of the first conflicting loan.
    AlreadyOnLoan(Ulid),
}

impl std::fmt::Display for LoanRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoanRejection::MissingDates => write!(f, "Please provide both start and end dates."),
            LoanRejection::StartInPast => write!(f, "The start date cannot be in the past."),
            LoanRejection::StartBeyondHorizon => {
                write!(f, "The start date must not exceed 1 year from the current date.")
            }
            LoanRejection::EndBeforeStart => {
                write!(f, "The end date must be after the start date.")
            }
            LoanRejection::PeriodTooLong => {
                write!(f, "The borrowing period must not exceed 6 months.")
            }
            LoanRejection::AlreadyOnLoan(_) => {
                write!(f, "Equipment is already on loan during this period.")
            }
        }
    }
}

impl std::error::Error for LoanRejection {}

impl LoanRejection {
    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            LoanRejection::MissingDates => "missing_dates",
            LoanRejection::StartInPast => "start_in_past",
            LoanRejection::StartBeyondHorizon => "start_beyond_horizon",
            LoanRejection::EndBeforeStart => "end_before_start",
            LoanRejection::PeriodTooLong => "period_too_long",
            LoanRejection::AlreadyOnLoan(_) => "already_on_loan",
        }
    }
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    UnknownUser(String),
    EmailInUse,
    AccountDeactivated,
    OutstandingLoans(Ulid),
    EquipmentUnavailable(Ulid),
    Rejected(LoanRejection),
    Invalid(FieldError),
    PermissionDenied(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::UnknownUser(email) => write!(f, "unknown user: {email}"),
            EngineError::EmailInUse => {
                write!(f, "This email is already in use. Please use a different email.")
            }
            EngineError::AccountDeactivated => write!(
                f,
                "Your account has been deactivated. Contact support to reactivate it."
            ),
            EngineError::OutstandingLoans(id) => write!(f, "{id} has outstanding borrows"),
            EngineError::EquipmentUnavailable(id) => {
                write!(f, "equipment {id} is not available for borrowing")
            }
            EngineError::Rejected(r) => write!(f, "{r}"),
            EngineError::Invalid(e) => write!(f, "{e}"),
            EngineError::PermissionDenied(what) => {
                write!(f, "You do not have permission to perform this action: {what}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<LoanRejection> for EngineError {
    fn from(r: LoanRejection) -> Self {
        EngineError::Rejected(r)
    }
}

impl From<FieldError> for EngineError {
    fn from(e: FieldError) -> Self {
        EngineError::Invalid(e)
    }
}
