use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn get_user(&self, id: Ulid) -> Option<UserInfo> {
        self.users.read().await.get(&id).cloned()
    }

    /// Case-insensitive lookup on the login email.
    pub async fn find_user_by_email(&self, email: &str) -> Option<UserInfo> {
        self.users.read().await.find_by_email(email).cloned()
    }

    pub async fn list_users(&self) -> Vec<UserInfo> {
        let dir = self.users.read().await;
        let mut users: Vec<UserInfo> = dir.iter().cloned().collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// Resolve a login email to an active member.
    pub async fn sign_in(&self, email: &str) -> Result<UserInfo, EngineError> {
        let user = self
            .find_user_by_email(email)
            .await
            .ok_or_else(|| EngineError::UnknownUser(email.to_string()))?;
        if !user.is_active() {
            return Err(EngineError::AccountDeactivated);
        }
        Ok(user)
    }

    /// True if any loan of the user has not yet reached its return day.
    pub async fn user_has_outstanding_loans(&self, user_id: Ulid, now: Ms) -> bool {
        for item in self.equipment_handles() {
            let guard = item.read().await;
            if guard
                .loans
                .iter()
                .any(|l| l.user_id == user_id && l.period.is_outstanding(now))
            {
                return true;
            }
        }
        false
    }

    // ── Equipment ────────────────────────────────────────────

    pub async fn get_equipment(&self, id: Ulid) -> Option<EquipmentInfo> {
        let item = self.get_equipment_state(&id)?;
        let guard = item.read().await;
        Some(guard.info())
    }

    pub async fn list_equipment(&self) -> Vec<EquipmentInfo> {
        let mut out = Vec::new();
        for item in self.equipment_handles() {
            out.push(item.read().await.info());
        }
        out.sort_by_key(|e| e.id);
        out
    }

    /// Items whose status allows new loans. Existing loans do not hide an item.
    pub async fn list_available_equipment(&self) -> Vec<EquipmentInfo> {
        let mut out = self.list_equipment().await;
        out.retain(|e| e.status == EquipmentStatus::Available);
        out
    }

    // ── Loans ────────────────────────────────────────────────

    pub async fn get_loan(&self, id: Ulid) -> Option<LoanInfo> {
        let equipment_id = self.get_equipment_for_loan(&id)?;
        let item = self.get_equipment_state(&equipment_id)?;
        let guard = item.read().await;
        guard.loans.iter().find(|l| l.id == id).map(LoanInfo::from)
    }

    /// Loans of one item ordered by borrow date. Unknown items have none.
    pub async fn loans_for_equipment(&self, equipment_id: Ulid) -> Vec<LoanInfo> {
        let Some(item) = self.get_equipment_state(&equipment_id) else {
            return Vec::new();
        };
        let guard = item.read().await;
        guard.loans.iter().map(LoanInfo::from).collect()
    }

    pub async fn loans_for_user(&self, user_id: Ulid) -> Vec<LoanInfo> {
        let mut out = Vec::new();
        for item in self.equipment_handles() {
            let guard = item.read().await;
            out.extend(
                guard
                    .loans
                    .iter()
                    .filter(|l| l.user_id == user_id)
                    .map(LoanInfo::from),
            );
        }
        out.sort_by_key(|l| (l.borrow_date, l.id));
        out
    }

    pub async fn list_loans(&self) -> Vec<LoanInfo> {
        let mut out = Vec::new();
        for item in self.equipment_handles() {
            let guard = item.read().await;
            out.extend(guard.loans.iter().map(LoanInfo::from));
        }
        out.sort_by_key(|l| (l.borrow_date, l.id));
        out
    }
}
