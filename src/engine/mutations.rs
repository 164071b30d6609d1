use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use tokio::sync::RwLock;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::validate;

use super::conflict::{check_loan, now_ms};
use super::{Engine, EngineError, SharedEquipmentState, WalCommand, apply_to_equipment};

impl Engine {
    // ── Users ────────────────────────────────────────────────

    pub async fn register_user(
        &self,
        id: Ulid,
        email: String,
        first_name: String,
        last_name: String,
        role: Role,
    ) -> Result<(), EngineError> {
        validate::email(&email)?;
        validate::name("first name", &first_name)?;
        validate::name("last name", &last_name)?;

        let mut dir = self.users.write().await;
        if dir.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if dir.get(&id).is_some() {
            return Err(EngineError::AlreadyExists(id));
        }
        if let Some(existing) = dir.find_by_email(&email) {
            return Err(if existing.is_active() {
                EngineError::EmailInUse
            } else {
                EngineError::AccountDeactivated
            });
        }

        let event = Event::UserRegistered {
            id,
            email,
            first_name,
            last_name,
            role,
            created_at: now_ms(),
        };
        self.persist_and_apply_user(&mut dir, &event).await?;
        info!("registered user {id}");
        Ok(())
    }

    /// Edit a profile. Fields left `None` keep their stored value, read under
    /// the same directory lock as the write.
    pub async fn update_user(
        &self,
        id: Ulid,
        email: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
        role: Option<Role>,
    ) -> Result<(), EngineError> {
        let mut dir = self.users.write().await;
        let current = dir.get(&id).ok_or(EngineError::NotFound(id))?;
        let email = email.unwrap_or_else(|| current.email.clone());
        let first_name = first_name.unwrap_or_else(|| current.first_name.clone());
        let last_name = last_name.unwrap_or_else(|| current.last_name.clone());
        let role = role.unwrap_or(current.role);

        validate::email(&email)?;
        validate::name("first name", &first_name)?;
        validate::name("last name", &last_name)?;
        if let Some(other) = dir.find_by_email(&email)
            && other.id != id
        {
            return Err(EngineError::EmailInUse);
        }

        let event = Event::UserUpdated { id, email, first_name, last_name, role };
        self.persist_and_apply_user(&mut dir, &event).await
    }

    /// Deactivation is refused while the user still holds outstanding loans.
    pub async fn set_user_status(&self, id: Ulid, status: UserStatus) -> Result<(), EngineError> {
        let mut dir = self.users.write().await;
        let current = dir.get(&id).ok_or(EngineError::NotFound(id))?.status;
        if current == status {
            return Ok(());
        }
        if status == UserStatus::Inactive && self.user_has_outstanding_loans(id, now_ms()).await {
            return Err(EngineError::OutstandingLoans(id));
        }

        let event = Event::UserStatusChanged { id, status };
        self.persist_and_apply_user(&mut dir, &event).await?;
        info!("user {id} is now {}", status.as_str());
        Ok(())
    }

    /// Delete a user and every loan they hold. Without `force`, a user with
    /// outstanding loans is not deleted.
    pub async fn delete_user(&self, id: Ulid, force: bool) -> Result<(), EngineError> {
        // Holding the directory write lock keeps new loans for this user out.
        let mut dir = self.users.write().await;
        if dir.get(&id).is_none() {
            return Err(EngineError::NotFound(id));
        }

        let now = now_ms();
        let mut holding: Vec<(Ulid, SharedEquipmentState)> = Vec::new();
        let mut outstanding = false;
        for item in self.equipment_handles() {
            let guard = item.read().await;
            let mut held = guard.loans.iter().filter(|l| l.user_id == id).peekable();
            if held.peek().is_some() {
                outstanding |= held.any(|l| l.period.is_outstanding(now));
                holding.push((guard.id, item.clone()));
            }
        }
        if outstanding && !force {
            return Err(EngineError::OutstandingLoans(id));
        }

        // Acquire write locks in sorted order to prevent deadlocks.
        holding.sort_by_key(|(eid, _)| *eid);
        let mut guards = Vec::with_capacity(holding.len());
        for (_, item) in holding {
            guards.push(item.write_owned().await);
        }

        let event = Event::UserDeleted { id };
        self.persist_and_apply_user(&mut dir, &event).await?;
        for guard in &mut guards {
            apply_to_equipment(guard, &event, &self.loan_to_equipment);
        }
        if outstanding {
            warn!("deleted user {id} with outstanding loans");
        } else {
            info!("deleted user {id}");
        }
        Ok(())
    }

    // ── Equipment ────────────────────────────────────────────

    /// Add an item to the catalog. The stored reference is `{reference}-{n}`
    /// with a random `n`, redrawn until no other item uses it. Returns it.
    pub async fn add_equipment(
        &self,
        id: Ulid,
        name: String,
        kind: String,
        reference: String,
        description: Option<String>,
    ) -> Result<String, EngineError> {
        validate::text("name", &name, MAX_EQUIPMENT_NAME_LEN)?;
        validate::text("type", &kind, MAX_KIND_LEN)?;
        validate::text("ref", &reference, MAX_REFERENCE_LEN)?;
        if let Some(d) = &description {
            validate::text("description", d, MAX_DESCRIPTION_LEN)?;
        }
        if self.equipment.len() >= MAX_EQUIPMENT_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many equipment items"));
        }
        if self.equipment.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _gate = self.users.read().await;
        let unique_ref = self.reserve_reference(&reference, id)?;
        let image = image_for_kind(&kind).to_string();
        let event = Event::EquipmentAdded {
            id,
            name: name.clone(),
            kind: kind.clone(),
            reference: unique_ref.clone(),
            description: description.clone(),
            image: image.clone(),
        };
        if let Err(e) = self.wal_append(&event).await {
            self.references.remove(&unique_ref);
            return Err(e);
        }

        let item = EquipmentState::new(id, name, kind, unique_ref.clone(), description, image);
        self.equipment.insert(id, Arc::new(RwLock::new(item)));
        info!("added equipment {id} as {unique_ref}");
        Ok(unique_ref)
    }

    fn reserve_reference(&self, prefix: &str, id: Ulid) -> Result<String, EngineError> {
        for _ in 0..MAX_REFERENCE_ATTEMPTS {
            let suffix = Ulid::new().random() % REFERENCE_SUFFIX_RANGE;
            let candidate = format!("{prefix}-{suffix}");
            if let Entry::Vacant(slot) = self.references.entry(candidate.clone()) {
                slot.insert(id);
                return Ok(candidate);
            }
        }
        Err(EngineError::LimitExceeded("no free equipment reference for prefix"))
    }

    pub async fn set_equipment_status(
        &self,
        id: Ulid,
        status: EquipmentStatus,
    ) -> Result<(), EngineError> {
        let _gate = self.users.read().await;
        let item = self.get_equipment_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = item.write().await;
        if guard.status == status {
            return Ok(());
        }
        let event = Event::EquipmentStatusChanged { id, status };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Remove an item and its loan history. Refused while a loan is outstanding.
    pub async fn delete_equipment(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.users.read().await;
        let item = self.get_equipment_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = item.write().await;
        if !self.equipment.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.has_outstanding_loans(now_ms()) {
            return Err(EngineError::OutstandingLoans(id));
        }

        let event = Event::EquipmentDeleted { id };
        self.wal_append(&event).await?;
        for loan in &guard.loans {
            self.loan_to_equipment.remove(&loan.id);
        }
        self.references.remove(&guard.reference);
        // Removed while still locked so a waiting borrower sees it is gone.
        self.equipment.remove(&id);
        drop(guard);
        info!("deleted equipment {id}");
        Ok(())
    }

    // ── Loans ────────────────────────────────────────────────

    pub async fn borrow(
        &self,
        id: Ulid,
        equipment_id: Ulid,
        user_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
    ) -> Result<LoanPeriod, EngineError> {
        self.borrow_at(id, equipment_id, user_id, start, end, now_ms()).await
    }

    /// Validate a loan request against the borrowing policy and, if it
    /// passes, persist it with day-truncated dates.
    pub(super) async fn borrow_at(
        &self,
        id: Ulid,
        equipment_id: Ulid,
        user_id: Ulid,
        start: Option<Ms>,
        end: Option<Ms>,
        now: Ms,
    ) -> Result<LoanPeriod, EngineError> {
        // Directory read lock is held until the loan is applied so the
        // borrower cannot be deactivated or deleted halfway through.
        let dir = self.users.read().await;
        let borrower = dir.get(&user_id).ok_or(EngineError::NotFound(user_id))?;
        if !borrower.is_active() {
            return Err(EngineError::AccountDeactivated);
        }

        let item = self
            .get_equipment_state(&equipment_id)
            .ok_or(EngineError::NotFound(equipment_id))?;
        let mut guard = item.write().await;
        if !self.equipment.contains_key(&equipment_id) {
            return Err(EngineError::NotFound(equipment_id));
        }
        if self.loan_to_equipment.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.status != EquipmentStatus::Available {
            return Err(EngineError::EquipmentUnavailable(equipment_id));
        }
        if guard.loans.len() >= MAX_LOANS_PER_EQUIPMENT {
            return Err(EngineError::LimitExceeded("too many loans on equipment"));
        }

        let period = check_loan(&guard, start, end, now).inspect_err(|rejection| {
            metrics::counter!(
                crate::observability::LOANS_REJECTED_TOTAL,
                "reason" => rejection.label()
            )
            .increment(1);
        })?;

        let event = Event::LoanCreated {
            id,
            equipment_id,
            user_id,
            period,
            created_at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);
        drop(dir);
        metrics::counter!(crate::observability::LOANS_CREATED_TOTAL).increment(1);
        info!("loan {id}: equipment {equipment_id} to user {user_id} for {} day(s)", period.days());
        Ok(period)
    }

    /// Cancel (or close) a loan. Returns the equipment id it was on.
    pub async fn cancel_loan(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.users.read().await;
        let (equipment_id, mut guard) = self.resolve_loan_write(&id).await?;
        let event = Event::LoanCancelled { id, equipment_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(equipment_id)
    }

    // ── Maintenance ──────────────────────────────────────────

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        // Every mutation holds the directory lock (read or write) while it
        // appends, so the write lock here means no event is in flight.
        let dir = self.users.write().await;

        // Users first: loans replay only for known borrowers.
        let mut users: Vec<&UserRecord> = dir.iter().collect();
        users.sort_by_key(|u| u.id);
        for user in users {
            events.push(Event::UserRegistered {
                id: user.id,
                email: user.email.clone(),
                first_name: user.first_name.clone(),
                last_name: user.last_name.clone(),
                role: user.role,
                created_at: user.created_at,
            });
            if user.status != UserStatus::Active {
                events.push(Event::UserStatusChanged { id: user.id, status: user.status });
            }
        }

        for item in self.equipment_handles() {
            let guard = item.read().await;
            events.push(Event::EquipmentAdded {
                id: guard.id,
                name: guard.name.clone(),
                kind: guard.kind.clone(),
                reference: guard.reference.clone(),
                description: guard.description.clone(),
                image: guard.image.clone(),
            });
            if guard.status != EquipmentStatus::Available {
                events.push(Event::EquipmentStatusChanged { id: guard.id, status: guard.status });
            }
            for loan in &guard.loans {
                events.push(Event::LoanCreated {
                    id: loan.id,
                    equipment_id: loan.equipment_id,
                    user_id: loan.user_id,
                    period: loan.period,
                    created_at: loan.created_at,
                });
            }
        }

        // Keep the directory locked until the rewrite lands.
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(dir);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
