use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Truncate a timestamp to UTC midnight of the same day. Saturates at
/// `Ms::MIN` for the few values whose midnight is not representable.
pub fn day_floor(ms: Ms) -> Ms {
    ms.div_euclid(DAY_MS).saturating_mul(DAY_MS)
}

/// Closed day range `[start, end]`. Both bounds are UTC midnights; the loan
/// covers the whole of its last day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanPeriod {
    pub start: Ms,
    pub end: Ms,
}

impl LoanPeriod {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start <= end, "LoanPeriod start must not be after end");
        Self { start, end }
    }

    /// Build a period from raw timestamps, truncating both to their day.
    pub fn from_days(start: Ms, end: Ms) -> Self {
        Self::new(day_floor(start), day_floor(end))
    }

    pub fn overlaps(&self, other: &LoanPeriod) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    /// Number of calendar days covered, counting both ends.
    pub fn days(&self) -> i64 {
        (self.end - self.start) / DAY_MS + 1
    }

    /// True while the last borrowed day has not fully elapsed.
    pub fn is_outstanding(&self, now: Ms) -> bool {
        self.end >= day_floor(now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserStatus {
    Active,
    Inactive,
}

impl UserStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(UserStatus::Active),
            "inactive" => Some(UserStatus::Inactive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquipmentStatus {
    Available,
    Unavailable,
}

impl EquipmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EquipmentStatus::Available => "available",
            EquipmentStatus::Unavailable => "unavailable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(EquipmentStatus::Available),
            "unavailable" => Some(EquipmentStatus::Unavailable),
            _ => None,
        }
    }
}

/// Catalog picture for an equipment type.
pub fn image_for_kind(kind: &str) -> &'static str {
    match kind {
        "phone" => "phone.png",
        "laptop" => "laptop.jpg",
        "mouse" => "mouse.jpg",
        "computer" => "computer.jpg",
        _ => "unknown.png",
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub id: Ulid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub role: Role,
    pub status: UserStatus,
    pub created_at: Ms,
}

impl UserRecord {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub id: Ulid,
    pub equipment_id: Ulid,
    pub user_id: Ulid,
    pub period: LoanPeriod,
    pub created_at: Ms,
}

#[derive(Debug, Clone)]
pub struct EquipmentState {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
    pub reference: String,
    pub description: Option<String>,
    pub status: EquipmentStatus,
    pub image: String,
    /// Loans of this item, sorted by `period.start`.
    pub loans: Vec<Loan>,
}

impl EquipmentState {
    pub fn new(
        id: Ulid,
        name: String,
        kind: String,
        reference: String,
        description: Option<String>,
        image: String,
    ) -> Self {
        Self {
            id,
            name,
            kind,
            reference,
            description,
            status: EquipmentStatus::Available,
            image,
            loans: Vec::new(),
        }
    }

    /// Insert loan maintaining sort order by period.start.
    pub fn insert_loan(&mut self, loan: Loan) {
        let pos = self
            .loans
            .binary_search_by_key(&loan.period.start, |l| l.period.start)
            .unwrap_or_else(|e| e);
        self.loans.insert(pos, loan);
    }

    pub fn remove_loan(&mut self, id: Ulid) -> Option<Loan> {
        let pos = self.loans.iter().position(|l| l.id == id)?;
        Some(self.loans.remove(pos))
    }

    /// Loans whose closed period overlaps `query`.
    /// Loans at index >= right_bound start after `query.end` and cannot overlap.
    pub fn overlapping(&self, query: &LoanPeriod) -> impl Iterator<Item = &Loan> {
        let right_bound = self.loans.partition_point(|l| l.period.start <= query.end);
        self.loans[..right_bound]
            .iter()
            .filter(move |l| l.period.end >= query.start)
    }

    pub fn has_outstanding_loans(&self, now: Ms) -> bool {
        self.loans.iter().any(|l| l.period.is_outstanding(now))
    }

    pub fn info(&self) -> EquipmentInfo {
        EquipmentInfo {
            id: self.id,
            name: self.name.clone(),
            kind: self.kind.clone(),
            reference: self.reference.clone(),
            description: self.description.clone(),
            status: self.status,
            image: self.image.clone(),
        }
    }
}

/// Flat event records; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        email: String,
        first_name: String,
        last_name: String,
        role: Role,
        created_at: Ms,
    },
    UserUpdated {
        id: Ulid,
        email: String,
        first_name: String,
        last_name: String,
        role: Role,
    },
    UserStatusChanged {
        id: Ulid,
        status: UserStatus,
    },
    /// Also removes every loan held by the user.
    UserDeleted {
        id: Ulid,
    },
    EquipmentAdded {
        id: Ulid,
        name: String,
        kind: String,
        reference: String,
        description: Option<String>,
        image: String,
    },
    EquipmentStatusChanged {
        id: Ulid,
        status: EquipmentStatus,
    },
    EquipmentDeleted {
        id: Ulid,
    },
    LoanCreated {
        id: Ulid,
        equipment_id: Ulid,
        user_id: Ulid,
        period: LoanPeriod,
        created_at: Ms,
    },
    LoanCancelled {
        id: Ulid,
        equipment_id: Ulid,
    },
}

// ── Query result types ───────────────────────────────────────────

pub type UserInfo = UserRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EquipmentInfo {
    pub id: Ulid,
    pub name: String,
    pub kind: String,
    pub reference: String,
    pub description: Option<String>,
    pub status: EquipmentStatus,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoanInfo {
    pub id: Ulid,
    pub equipment_id: Ulid,
    pub user_id: Ulid,
    pub borrow_date: Ms,
    pub return_date: Ms,
}

impl From<&Loan> for LoanInfo {
    fn from(loan: &Loan) -> Self {
        Self {
            id: loan.id,
            equipment_id: loan.equipment_id,
            user_id: loan.user_id,
            borrow_date: loan.period.start,
            return_date: loan.period.end,
        }
    }
}
