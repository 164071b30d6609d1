//! Who is running a query, and what they may do.
//!
//! The startup user name of a connection is either the service account, an
//! administrator with no member identity, or the email of a registered member.

use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::*;
use crate::sql::{Command, LoanFilter, UserFilter};

#[derive(Debug, Clone)]
pub enum Session {
    Service,
    Member(UserInfo),
}

impl Session {
    pub fn is_admin(&self) -> bool {
        match self {
            Session::Service => true,
            Session::Member(user) => user.is_admin(),
        }
    }

    pub fn member(&self) -> Option<&UserInfo> {
        match self {
            Session::Service => None,
            Session::Member(user) => Some(user),
        }
    }

    pub fn is_self(&self, user_id: Ulid) -> bool {
        self.member().is_some_and(|u| u.id == user_id)
    }

    fn require_admin(&self, action: &'static str) -> Result<(), EngineError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied(action))
        }
    }

    fn require_self_or_admin(&self, user_id: Ulid, action: &'static str) -> Result<(), EngineError> {
        if self.is_admin() || self.is_self(user_id) {
            Ok(())
        } else {
            Err(EngineError::PermissionDenied(action))
        }
    }
}

/// Checks that depend only on the session and the command. Cancelling a
/// loan also needs the loan's owner, which the caller checks after lookup.
pub fn authorize(session: &Session, cmd: &Command) -> Result<(), EngineError> {
    match cmd {
        Command::InsertUser { .. } => session.require_admin("register users"),
        Command::UpdateUser { id, role, .. } => {
            session.require_self_or_admin(*id, "edit another user's profile")?;
            if !session.is_admin()
                && let (Some(role), Some(me)) = (role, session.member())
                && role != me.role.as_str()
            {
                return Err(EngineError::PermissionDenied("change your own role"));
            }
            Ok(())
        }
        Command::SetUserStatus { id, .. } => {
            session.require_admin("change a user's status")?;
            if session.is_self(*id) {
                return Err(EngineError::PermissionDenied("change your own status"));
            }
            Ok(())
        }
        Command::DeleteUser { id, .. } => {
            session.require_admin("delete users")?;
            if session.is_self(*id) {
                return Err(EngineError::PermissionDenied("delete your own account"));
            }
            Ok(())
        }
        Command::SelectUsers { filter } => match filter {
            UserFilter::All => session.require_admin("list users"),
            UserFilter::Id(id) => session.require_self_or_admin(*id, "view another user"),
            UserFilter::Email(email) => {
                if session.is_admin()
                    || session
                        .member()
                        .is_some_and(|u| u.email.eq_ignore_ascii_case(email.trim()))
                {
                    Ok(())
                } else {
                    Err(EngineError::PermissionDenied("view another user"))
                }
            }
        },
        Command::SelectProfile | Command::SelectEquipment { .. } => Ok(()),
        Command::InsertEquipment { .. } => session.require_admin("add equipment"),
        Command::SetEquipmentStatus { .. } => session.require_admin("change equipment status"),
        Command::DeleteEquipment { .. } => session.require_admin("delete equipment"),
        Command::InsertLoan { user_id, .. } => match user_id {
            Some(uid) => session.require_self_or_admin(*uid, "borrow for another user"),
            None => Ok(()),
        },
        Command::DeleteLoan { .. } => Ok(()),
        Command::SelectLoans { filter } => match filter {
            LoanFilter::All => session.require_admin("list all loans"),
            LoanFilter::Equipment(_) => Ok(()),
            LoanFilter::User(uid) => session.require_self_or_admin(*uid, "view another user's loans"),
        },
    }
}
