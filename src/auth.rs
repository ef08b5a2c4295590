use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

/// One configured login shared by every business on the server.
#[derive(Debug)]
pub struct AgendaAuthSource {
    user: String,
    password: String,
}

impl AgendaAuthSource {
    pub fn new(user: String, password: String) -> Self {
        Self { user, password }
    }

    fn user_allowed(&self, user: Option<&str>) -> bool {
        user == Some(self.user.as_str())
    }
}

#[async_trait]
impl AuthSource for AgendaAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        if !self.user_allowed(login.user()) {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!("login rejected for user {:?}", login.user());
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28P01".into(),
                "password authentication failed".into(),
            ))));
        }
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}
