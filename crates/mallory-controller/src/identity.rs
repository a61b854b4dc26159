//! Intruder identity resolution
//!
//! Turns an `Intruder` descriptor into the credentials a scoped client
//! connects with. Pure: no network calls, same input gives same identity.

use std::fmt;

use kube::config::AuthInfo;
use mallory_crd::Intruder;
use secrecy::SecretString;

/// Connection identity for one operation
#[derive(Clone, PartialEq, Eq)]
pub enum IntruderIdentity {
    /// Bearer token, no impersonation
    Token(String),
    /// Impersonated `system:serviceaccount:<namespace>:<name>`
    ServiceAccount {
        /// Full service account username
        username: String,
    },
    /// Impersonated user and groups, verbatim
    User {
        /// User name
        name: String,
        /// Group names
        groups: Vec<String>,
    },
    /// The controller's own credentials
    Ambient,
}

impl IntruderIdentity {
    /// Resolve with fixed precedence: token, service account, user, ambient
    #[must_use]
    pub fn resolve(intruder: &Intruder, namespace: &str) -> Self {
        if let Some(token) = intruder.token.as_deref().filter(|t| !t.is_empty()) {
            return Self::Token(token.to_string());
        }
        if let Some(sa) = intruder.service_account.as_deref().filter(|s| !s.is_empty()) {
            return Self::ServiceAccount {
                username: service_account_username(namespace, sa),
            };
        }
        match &intruder.user {
            Some(user) => Self::User {
                name: user.name.clone(),
                groups: user.groups.clone(),
            },
            None => Self::Ambient,
        }
    }

    /// Derive connection settings from the controller's base config
    ///
    /// The base is never mutated; host and TLS trust carry over in every case.
    #[must_use]
    pub fn apply(&self, base: &kube::Config) -> kube::Config {
        let mut config = base.clone();
        match self {
            Self::Token(token) => {
                config.auth_info = AuthInfo {
                    token: Some(SecretString::from(token.clone())),
                    ..AuthInfo::default()
                };
            }
            Self::ServiceAccount { username } => {
                config.auth_info.impersonate = Some(username.clone());
                config.auth_info.impersonate_groups = None;
            }
            Self::User { name, groups } => {
                config.auth_info.impersonate = Some(name.clone());
                config.auth_info.impersonate_groups =
                    (!groups.is_empty()).then(|| groups.clone());
            }
            Self::Ambient => {}
        }
        config
    }

    /// Short label for logs; never includes the token
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::ServiceAccount { .. } => "service-account",
            Self::User { .. } => "user",
            Self::Ambient => "ambient",
        }
    }
}

impl fmt::Debug for IntruderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Token(_) => f.write_str("Token(<redacted>)"),
            Self::ServiceAccount { username } => {
                f.debug_struct("ServiceAccount").field("username", username).finish()
            }
            Self::User { name, groups } => f
                .debug_struct("User")
                .field("name", name)
                .field("groups", groups)
                .finish(),
            Self::Ambient => f.write_str("Ambient"),
        }
    }
}

/// `system:serviceaccount:<namespace>:<name>`
#[inline]
#[must_use]
pub fn service_account_username(namespace: &str, name: &str) -> String {
    format!("system:serviceaccount:{namespace}:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use mallory_crd::UserInfo;
    use proptest::prelude::*;
    use secrecy::ExposeSecret;

    fn base_config() -> kube::Config {
        let mut config = kube::Config::new("https://10.0.0.1:6443".parse().unwrap());
        config.accept_invalid_certs = true;
        config.auth_info.client_certificate_data = Some("controller-cert".to_string());
        config
    }

    fn user(name: &str, groups: &[&str]) -> Option<UserInfo> {
        Some(UserInfo {
            name: name.to_string(),
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
        })
    }

    #[test]
    fn token_wins_over_service_account() {
        let intruder = Intruder {
            token: Some("t0k3n".to_string()),
            service_account: Some("builder".to_string()),
            user: user("eve", &[]),
        };
        assert_eq!(
            IntruderIdentity::resolve(&intruder, "team-a"),
            IntruderIdentity::Token("t0k3n".to_string())
        );
    }

    #[test]
    fn service_account_uses_resource_namespace() {
        let intruder = Intruder {
            service_account: Some("builder".to_string()),
            user: user("eve", &["devs"]),
            ..Default::default()
        };
        assert_eq!(
            IntruderIdentity::resolve(&intruder, "team-a"),
            IntruderIdentity::ServiceAccount {
                username: "system:serviceaccount:team-a:builder".to_string()
            }
        );
    }

    #[test]
    fn empty_strings_fall_through() {
        let intruder = Intruder {
            token: Some(String::new()),
            service_account: Some(String::new()),
            user: user("eve", &["devs", "ops"]),
        };
        assert_eq!(
            IntruderIdentity::resolve(&intruder, "ns"),
            IntruderIdentity::User {
                name: "eve".to_string(),
                groups: vec!["devs".to_string(), "ops".to_string()],
            }
        );
        assert_eq!(
            IntruderIdentity::resolve(&Intruder::default(), "ns"),
            IntruderIdentity::Ambient
        );
    }

    #[test]
    fn token_config_drops_controller_credentials() {
        let base = base_config();
        let config = IntruderIdentity::Token("t0k3n".to_string()).apply(&base);
        assert_eq!(config.cluster_url, base.cluster_url);
        assert!(config.accept_invalid_certs);
        assert_eq!(config.auth_info.client_certificate_data, None);
        assert_eq!(config.auth_info.impersonate, None);
        assert_eq!(
            config.auth_info.token.as_ref().map(|t| t.expose_secret().to_string()),
            Some("t0k3n".to_string())
        );
    }

    #[test]
    fn impersonation_keeps_controller_credentials() {
        let config = IntruderIdentity::User {
            name: "eve".to_string(),
            groups: vec!["devs".to_string()],
        }
        .apply(&base_config());
        assert_eq!(config.auth_info.client_certificate_data.as_deref(), Some("controller-cert"));
        assert_eq!(config.auth_info.impersonate.as_deref(), Some("eve"));
        assert_eq!(config.auth_info.impersonate_groups, Some(vec!["devs".to_string()]));

        let sa = IntruderIdentity::ServiceAccount {
            username: service_account_username("ns", "sa"),
        }
        .apply(&base_config());
        assert_eq!(sa.auth_info.impersonate.as_deref(), Some("system:serviceaccount:ns:sa"));
        assert_eq!(sa.auth_info.impersonate_groups, None);
    }

    #[test]
    fn ambient_is_base_unchanged() {
        let base = base_config();
        let config = IntruderIdentity::Ambient.apply(&base);
        assert_eq!(config.cluster_url, base.cluster_url);
        assert_eq!(
            config.auth_info.client_certificate_data,
            base.auth_info.client_certificate_data
        );
        assert!(config.auth_info.token.is_none());
        assert!(config.auth_info.impersonate.is_none());
    }

    #[test]
    fn debug_redacts_token() {
        let shown = format!("{:?}", IntruderIdentity::Token("s3cret".to_string()));
        assert!(!shown.contains("s3cret"));
    }

    fn opt_name() -> impl Strategy<Value = Option<String>> {
        prop::option::of("[a-z]{0,6}")
    }

    proptest! {
        #[test]
        fn precedence_is_deterministic(
            token in opt_name(),
            sa in opt_name(),
            user_name in opt_name(),
            ns in "[a-z]{1,6}",
        ) {
            let intruder = Intruder {
                token: token.clone(),
                service_account: sa.clone(),
                user: user_name.clone().map(|name| UserInfo { name, groups: vec![] }),
            };
            let first = IntruderIdentity::resolve(&intruder, &ns);
            prop_assert_eq!(&first, &IntruderIdentity::resolve(&intruder, &ns));

            let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
            let expected = if has(&token) {
                "token"
            } else if has(&sa) {
                "service-account"
            } else if user_name.is_some() {
                "user"
            } else {
                "ambient"
            };
            prop_assert_eq!(first.label(), expected);
        }
    }
}
