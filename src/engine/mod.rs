mod conflict;
mod error;
mod mutations;
mod queries;

pub use conflict::{check_loan, check_no_conflict, validate_period};
pub use error::{EngineError, LoanRejection};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedEquipmentState = Arc<RwLock<EquipmentState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// Blocks for the first append, drains whatever else is already queued,
/// then does one fsync for the whole batch and answers every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = match cmd {
            WalCommand::Append { event, response } => vec![(event, response)],
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        flush_and_respond(&mut wal, batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
    debug!("WAL writer stopped");
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes of a failed batch
    // are not carried into the next one.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── User directory ───────────────────────────────────────

/// Registered members, indexed by id and by lowercased email.
#[derive(Debug, Default)]
pub struct UserDirectory {
    by_id: HashMap<Ulid, UserRecord>,
    by_email: HashMap<String, Ulid>,
}

fn email_key(email: &str) -> String {
    email.trim().to_lowercase()
}

impl UserDirectory {
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: &Ulid) -> Option<&UserRecord> {
        self.by_id.get(id)
    }

    pub fn find_by_email(&self, email: &str) -> Option<&UserRecord> {
        self.by_email
            .get(&email_key(email))
            .and_then(|id| self.by_id.get(id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &UserRecord> {
        self.by_id.values()
    }

    fn insert(&mut self, user: UserRecord) {
        self.by_email.insert(email_key(&user.email), user.id);
        self.by_id.insert(user.id, user);
    }

    fn remove(&mut self, id: &Ulid) -> Option<UserRecord> {
        let user = self.by_id.remove(id)?;
        self.by_email.remove(&email_key(&user.email));
        Some(user)
    }
}

/// Apply a user event to the directory (caller holds the write lock).
fn apply_to_directory(dir: &mut UserDirectory, event: &Event) {
    match event {
        Event::UserRegistered {
            id,
            email,
            first_name,
            last_name,
            role,
            created_at,
        } => dir.insert(UserRecord {
            id: *id,
            email: email.clone(),
            first_name: first_name.clone(),
            last_name: last_name.clone(),
            role: *role,
            status: UserStatus::Active,
            created_at: *created_at,
        }),
        Event::UserUpdated {
            id,
            email,
            first_name,
            last_name,
            role,
        } => {
            if let Some(mut user) = dir.remove(id) {
                user.email = email.clone();
                user.first_name = first_name.clone();
                user.last_name = last_name.clone();
                user.role = *role;
                dir.insert(user);
            }
        }
        Event::UserStatusChanged { id, status } => {
            if let Some(user) = dir.by_id.get_mut(id) {
                user.status = *status;
            }
        }
        Event::UserDeleted { id } => {
            dir.remove(id);
        }
        _ => {}
    }
}

/// Apply an event to one equipment item (caller holds the lock).
fn apply_to_equipment(item: &mut EquipmentState, event: &Event, loan_index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::LoanCreated {
            id,
            equipment_id,
            user_id,
            period,
            created_at,
        } => {
            item.insert_loan(Loan {
                id: *id,
                equipment_id: *equipment_id,
                user_id: *user_id,
                period: *period,
                created_at: *created_at,
            });
            loan_index.insert(*id, *equipment_id);
        }
        Event::LoanCancelled { id, .. } => {
            item.remove_loan(*id);
            loan_index.remove(id);
        }
        Event::EquipmentStatusChanged { status, .. } => {
            item.status = *status;
        }
        // Deleting a user drops their loans on every item.
        Event::UserDeleted { id } => {
            item.loans.retain(|loan| {
                if loan.user_id == *id {
                    loan_index.remove(&loan.id);
                    false
                } else {
                    true
                }
            });
        }
        // Added/Deleted are handled at the DashMap level; user events at the directory.
        _ => {}
    }
}

pub struct Engine {
    /// Doubles as the mutation gate: every mutation holds it (read or write)
    /// while appending to the WAL, compaction takes it for writing.
    pub(super) users: RwLock<UserDirectory>,
    pub(super) equipment: DashMap<Ulid, SharedEquipmentState>,
    /// Equipment reference → equipment id; references are unique per tenant.
    pub(super) references: DashMap<String, Ulid>,
    /// Reverse lookup: loan id → equipment id
    pub(super) loan_to_equipment: DashMap<Ulid, Ulid>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?.with_backlog(events.len() as u64);
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // Replay into plain maps; nothing is shared yet so no locks are needed.
        let loan_to_equipment = DashMap::new();
        let mut directory = UserDirectory::default();
        let mut items: HashMap<Ulid, EquipmentState> = HashMap::new();

        for event in &events {
            match event {
                Event::UserRegistered { .. }
                | Event::UserUpdated { .. }
                | Event::UserStatusChanged { .. } => apply_to_directory(&mut directory, event),
                Event::UserDeleted { .. } => {
                    apply_to_directory(&mut directory, event);
                    for item in items.values_mut() {
                        apply_to_equipment(item, event, &loan_to_equipment);
                    }
                }
                Event::EquipmentAdded {
                    id,
                    name,
                    kind,
                    reference,
                    description,
                    image,
                } => {
                    items.insert(
                        *id,
                        EquipmentState::new(
                            *id,
                            name.clone(),
                            kind.clone(),
                            reference.clone(),
                            description.clone(),
                            image.clone(),
                        ),
                    );
                }
                Event::EquipmentDeleted { id } => {
                    if let Some(item) = items.remove(id) {
                        for loan in &item.loans {
                            loan_to_equipment.remove(&loan.id);
                        }
                    }
                }
                Event::LoanCreated { user_id, .. } if directory.get(user_id).is_none() => {
                    // Borrower was deleted while this loan was in flight.
                    debug!("replay: skipping loan of deleted user {user_id}");
                }
                Event::LoanCreated { equipment_id, .. }
                | Event::LoanCancelled { equipment_id, .. }
                | Event::EquipmentStatusChanged { id: equipment_id, .. } => {
                    if let Some(item) = items.get_mut(equipment_id) {
                        apply_to_equipment(item, event, &loan_to_equipment);
                    }
                }
            }
        }

        let references = DashMap::new();
        let equipment = DashMap::new();
        for (id, item) in items {
            references.insert(item.reference.clone(), id);
            equipment.insert(id, Arc::new(RwLock::new(item)));
        }

        Ok(Self {
            users: RwLock::new(directory),
            equipment,
            references,
            loan_to_equipment,
            wal_tx,
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_equipment_state(&self, id: &Ulid) -> Option<SharedEquipmentState> {
        self.equipment.get(id).map(|e| e.value().clone())
    }

    pub fn get_equipment_for_loan(&self, loan_id: &Ulid) -> Option<Ulid> {
        self.loan_to_equipment.get(loan_id).map(|e| *e.value())
    }

    /// WAL-append + apply for an event scoped to one equipment item.
    pub(super) async fn persist_and_apply(
        &self,
        item: &mut EquipmentState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_equipment(item, event, &self.loan_to_equipment);
        Ok(())
    }

    /// WAL-append + apply for a user event (caller holds the directory write lock).
    pub(super) async fn persist_and_apply_user(
        &self,
        dir: &mut UserDirectory,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_directory(dir, event);
        Ok(())
    }

    /// Lookup loan → equipment, get the item, acquire its write lock.
    pub(super) async fn resolve_loan_write(
        &self,
        loan_id: &Ulid,
    ) -> Result<(Ulid, tokio::sync::OwnedRwLockWriteGuard<EquipmentState>), EngineError> {
        let equipment_id = self
            .get_equipment_for_loan(loan_id)
            .ok_or(EngineError::NotFound(*loan_id))?;
        let item = self
            .get_equipment_state(&equipment_id)
            .ok_or(EngineError::NotFound(equipment_id))?;
        let guard = item.write_owned().await;
        // The loan may be gone by the time the lock is held.
        if !guard.loans.iter().any(|l| l.id == *loan_id) {
            return Err(EngineError::NotFound(*loan_id));
        }
        Ok((equipment_id, guard))
    }

    /// Snapshot of the item handles, so no DashMap shard lock is held across an await.
    pub(super) fn equipment_handles(&self) -> Vec<SharedEquipmentState> {
        self.equipment.iter().map(|e| e.value().clone()).collect()
    }
}
