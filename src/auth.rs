use std::fmt;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::config::Config;

/// What a connection may do, fixed by the user it logged in as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Catalogue, rules, feeds, booking administration, sync.
    Admin,
    /// Availability, quotes, direct bookings and payment callbacks.
    App,
}

impl Role {
    pub fn from_user(user: &str) -> Option<Self> {
        match user {
            "admin" => Some(Role::Admin),
            "app" => Some(Role::App),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Admin => "admin",
            Role::App => "app",
        })
    }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    admin_password: String,
    app_password: String,
}

impl Credentials {
    pub fn new(admin_password: impl Into<String>, app_password: impl Into<String>) -> Self {
        Self {
            admin_password: admin_password.into(),
            app_password: app_password.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.admin_password, &config.app_password)
    }

    fn password_for(&self, role: Role) -> &str {
        match role {
            Role::Admin => &self.admin_password,
            Role::App => &self.app_password,
        }
    }
}

#[derive(Debug)]
pub struct InnkeepAuthSource {
    credentials: Credentials,
}

impl InnkeepAuthSource {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

#[async_trait]
impl AuthSource for InnkeepAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().unwrap_or_default();
        let Some(role) = Role::from_user(user) else {
            metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
            tracing::warn!(user, "login as unknown user refused");
            return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                "FATAL".into(),
                "28P01".into(),
                format!("password authentication failed for user \"{user}\""),
            ))));
        };
        Ok(Password::new(
            None,
            self.credentials.password_for(role).as_bytes().to_vec(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_two_users() {
        assert_eq!(Role::from_user("admin"), Some(Role::Admin));
        assert_eq!(Role::from_user("app"), Some(Role::App));
        assert_eq!(Role::from_user("postgres"), None);
    }

    #[test]
    fn passwords_per_role() {
        let creds = Credentials::new("secret-admin", "secret-app");
        assert_eq!(creds.password_for(Role::Admin), "secret-admin");
        assert_eq!(creds.password_for(Role::App), "secret-app");
    }
}
