use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use ulid::Ulid;

use crate::observability::AUTH_FAILURES_TOTAL;

/// Shared-password check. The login user name doubles as the acting user
/// id, so it must be a ULID.
#[derive(Debug)]
pub struct VisitdAuthSource {
    password: String,
}

impl VisitdAuthSource {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

/// The acting user behind a login name.
pub fn login_user_id(user: &str) -> PgWireResult<Ulid> {
    Ulid::from_string(user).map_err(|_| {
        metrics::counter!(AUTH_FAILURES_TOTAL).increment(1);
        PgWireError::UserError(Box::new(ErrorInfo::new(
            "FATAL".into(),
            "28000".into(),
            format!("user name must be a user id (ULID), got {user:?}"),
        )))
    })
}

#[async_trait]
impl AuthSource for VisitdAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user: String = login.user().map(|u| u.to_string()).unwrap_or_default();
        login_user_id(&user)?;
        Ok(Password::new(None, self.password.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulid_login_is_the_acting_user() {
        let id = Ulid::new();
        assert_eq!(login_user_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn non_ulid_login_is_refused() {
        for name in ["alice", "", "postgres"] {
            let err = login_user_id(name).unwrap_err();
            assert!(matches!(err, PgWireError::UserError(_)));
            assert!(format!("{err:?}").contains("28000"), "{err:?}");
        }
    }
}
