use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use tracing::debug;

/// Every login of every tenant checks against one shared password. Who the
/// login is (service account or member email) is resolved per query.
#[derive(Debug)]
pub struct SharedPasswordAuthSource {
    password: String,
}

impl SharedPasswordAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let Some(user) = login.user().filter(|u| !u.is_empty()) else {
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28000".into(),
                "a user name (service account or member email) is required".into(),
            ))));
        };
        debug!("password login for {user} on {:?}", login.database());
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
