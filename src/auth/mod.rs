// src/auth/mod.rs

//! Authentication and authorization
//!
//! A request is turned into an [`Entity`] from its bearer token (or the
//! anonymous entity when there is none). [`Authorization::resolve`] then
//! expands the entity into its effective role bindings:
//!
//! - anonymous callers get `[auth] unauthenticated_role_bindings` only
//! - token holders get `[auth] authenticated_role_bindings`, the bindings
//!   in their token, `admin` on `<primary_namespace>/*`, and every
//!   namespace role mapping whose `other_namespace` glob matches their
//!   primary namespace
//!
//! Namespace-level checks only consider bindings whose environment part
//! is `*`.

pub mod arn;
pub mod permissions;
pub mod token;

pub use arn::ArnPattern;
pub use permissions::{Permission, Role};
pub use token::{Claims, TokenSigner};

use crate::config::{AuthSection, Config};
use crate::db::models::NamespaceRoleMapping;
use crate::environment::spec::validate_name;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::warn;

/// Who is making a request
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Entity {
    pub authenticated: bool,
    pub primary_namespace: Option<String>,
    pub role_bindings: BTreeMap<String, Vec<String>>,
    /// Token expiry, seconds since the epoch
    pub exp: Option<i64>,
}

impl Entity {
    pub fn anonymous() -> Self {
        Self::default()
    }

    fn from_claims(claims: Claims) -> Self {
        Self {
            authenticated: true,
            primary_namespace: Some(claims.primary_namespace),
            role_bindings: claims.role_bindings,
            exp: Some(claims.exp),
        }
    }
}

/// Body of `POST /api/v1/token/`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenRequest {
    pub primary_namespace: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub role_bindings: Option<BTreeMap<String, Vec<String>>>,
}

/// Validate and canonicalize a role-binding map (`editor` becomes `developer`)
pub fn normalize_bindings(bindings: &BTreeMap<String, Vec<String>>) -> Result<BTreeMap<String, Vec<String>>> {
    let mut out = BTreeMap::new();
    for (pattern, roles) in bindings {
        let arn = ArnPattern::parse(pattern)?;
        let roles = roles
            .iter()
            .map(|role| Role::normalize(role))
            .collect::<Result<BTreeSet<_>>>()?;
        out.insert(arn.to_string(), roles.into_iter().collect());
    }
    Ok(out)
}

/// Verifies incoming tokens and signs new ones
pub struct Authenticator {
    signer: TokenSigner,
    auth: AuthSection,
    expiry: Duration,
}

impl Authenticator {
    pub fn new(signer: TokenSigner, auth: AuthSection, expiry: Duration) -> Self {
        Self { signer, auth, expiry }
    }

    /// Load (or create) the signing key named by `[auth] key_path`
    pub fn from_config(config: &Config) -> Result<Self> {
        let expiry = config
            .token_expiry()
            .map_err(|e| Error::Config(format!("[auth] token_expiry: {e}")))?;
        let signer = TokenSigner::load_or_generate(&config.auth.key_path)?;
        Ok(Self::new(signer, config.auth.clone(), expiry))
    }

    pub fn auth(&self) -> &AuthSection {
        &self.auth
    }

    /// Entity for an `Authorization: Bearer` value, anonymous when absent
    pub fn entity(&self, bearer: Option<&str>) -> Result<Entity> {
        match bearer {
            None => Ok(Entity::anonymous()),
            Some(token) => self.signer.verify(token).map(Entity::from_claims),
        }
    }

    /// Sign a token for claims that were already checked
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        self.signer.issue(claims)
    }

    /// Issue a token on behalf of `caller`
    ///
    /// The new token can never outlive or out-permission its issuer.
    pub fn issue(&self, caller: &Authorization, request: TokenRequest) -> Result<(String, Claims)> {
        let primary_namespace = match request.primary_namespace.or_else(|| caller.entity.primary_namespace.clone()) {
            Some(ns) => ns,
            None => {
                return Err(Error::Authorization(
                    "a primary namespace is required to issue a token".into(),
                ));
            }
        };
        validate_name("namespace", &primary_namespace)?;

        let role_bindings = match &request.role_bindings {
            Some(bindings) => normalize_bindings(bindings)?,
            None => caller.entity.role_bindings.clone(),
        };
        caller.check_grantable(&primary_namespace, &role_bindings)?;

        let now = Utc::now().timestamp();
        let mut exp = match request.expiration {
            Some(when) => when.timestamp(),
            None => now + self.expiry.as_secs() as i64,
        };
        if let Some(caller_exp) = caller.entity.exp {
            if exp > caller_exp {
                if request.expiration.is_some() {
                    return Err(Error::Authorization(
                        "token expiration exceeds the caller's own".into(),
                    ));
                }
                exp = caller_exp;
            }
        }
        if exp <= now {
            return Err(Error::Validation("token expiration is in the past".into()));
        }

        let claims = Claims {
            exp,
            primary_namespace,
            role_bindings,
        };
        let token = self.sign(&claims)?;
        Ok((token, claims))
    }
}

#[derive(Debug, Clone)]
struct Binding {
    pattern: ArnPattern,
    role: Role,
}

/// Effective permissions of one entity
#[derive(Debug, Clone)]
pub struct Authorization {
    pub entity: Entity,
    bindings: Vec<Binding>,
}

impl Authorization {
    /// Expand an entity into its effective bindings
    pub fn resolve(conn: &Connection, entity: &Entity, auth: &AuthSection) -> Result<Self> {
        let mut bindings = Vec::new();

        if !entity.authenticated {
            push_bindings(&mut bindings, &auth.unauthenticated_role_bindings);
            return Ok(Self {
                entity: entity.clone(),
                bindings,
            });
        }

        push_bindings(&mut bindings, &auth.authenticated_role_bindings);
        push_bindings(&mut bindings, &entity.role_bindings);

        if let Some(primary) = &entity.primary_namespace {
            if let Ok(pattern) = ArnPattern::parse(&format!("{primary}/*")) {
                bindings.push(Binding {
                    pattern,
                    role: Role::Admin,
                });
            }

            for mapping in NamespaceRoleMapping::list_all(conn)? {
                if !arn::glob_matches(&mapping.other_namespace, primary) {
                    continue;
                }
                let role = match mapping.role.parse::<Role>() {
                    Ok(role) => role,
                    Err(e) => {
                        warn!("Ignoring role mapping on {}: {}", mapping.namespace, e);
                        continue;
                    }
                };
                if let Ok(pattern) = ArnPattern::parse(&format!("{}/*", mapping.namespace)) {
                    bindings.push(Binding { pattern, role });
                }
            }
        }

        Ok(Self {
            entity: entity.clone(),
            bindings,
        })
    }

    /// Whether `permission` is held on an environment, or on the namespace
    /// itself when `environment` is `None`
    pub fn is_allowed(&self, namespace: &str, environment: Option<&str>, permission: Permission) -> bool {
        self.bindings.iter().any(|binding| {
            binding.role.grants(permission)
                && match environment {
                    Some(environment) => binding.pattern.matches(namespace, environment),
                    None => binding.pattern.matches_namespace(namespace),
                }
        })
    }

    pub fn require(&self, namespace: &str, environment: Option<&str>, permission: Permission) -> Result<()> {
        if self.is_allowed(namespace, environment, permission) {
            Ok(())
        } else {
            Err(Error::Authorization(permission.to_string()))
        }
    }

    /// Whether any binding grants `permission` at all (global resources)
    pub fn has_any(&self, permission: Permission) -> bool {
        self.bindings.iter().any(|binding| binding.role.grants(permission))
    }

    /// Whether `permission` is held through a `*/*` binding (global settings)
    pub fn is_global(&self, permission: Permission) -> bool {
        self.bindings.iter().any(|binding| {
            binding.role.grants(permission)
                && binding.pattern.namespace == "*"
                && binding.pattern.environment == "*"
        })
    }

    /// ARN globs under which `permission` is held, for list filters
    pub fn visible(&self, permission: Permission) -> Vec<(String, String)> {
        let mut globs: Vec<(String, String)> = self
            .bindings
            .iter()
            .filter(|binding| binding.role.grants(permission))
            .map(|binding| binding.pattern.globs())
            .collect();
        globs.sort();
        globs.dedup();
        globs
    }

    /// ARN pattern -> permissions held through it
    pub fn permissions(&self) -> BTreeMap<String, Vec<Permission>> {
        let mut out: BTreeMap<String, BTreeSet<Permission>> = BTreeMap::new();
        for binding in &self.bindings {
            out.entry(binding.pattern.to_string())
                .or_default()
                .extend(binding.role.permissions().iter().copied());
        }
        out.into_iter()
            .map(|(pattern, permissions)| (pattern, permissions.into_iter().collect()))
            .collect()
    }

    /// Whether a pattern/role pair is covered by one of our bindings
    fn covers(&self, pattern: &ArnPattern, role: Role) -> bool {
        self.bindings
            .iter()
            .any(|binding| binding.role >= role && pattern.is_subset_of(&binding.pattern))
    }

    /// Refuse bindings (including the implied primary-namespace admin)
    /// that exceed what this caller holds
    pub fn check_grantable(&self, primary_namespace: &str, bindings: &BTreeMap<String, Vec<String>>) -> Result<()> {
        let primary = ArnPattern::parse(&format!("{primary_namespace}/*"))?;
        if !self.covers(&primary, Role::Admin) {
            return Err(Error::Authorization(format!(
                "cannot grant admin on {primary}"
            )));
        }
        for (pattern, roles) in bindings {
            let arn = ArnPattern::parse(pattern)?;
            for role in roles {
                let role = role.parse::<Role>().map_err(Error::Validation)?;
                if !self.covers(&arn, role) {
                    return Err(Error::Authorization(format!("cannot grant {role} on {arn}")));
                }
            }
        }
        Ok(())
    }
}

fn push_bindings(bindings: &mut Vec<Binding>, source: &BTreeMap<String, Vec<String>>) {
    for (pattern, roles) in source {
        let pattern = match ArnPattern::parse(pattern) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!("Ignoring role binding {}: {}", pattern, e);
                continue;
            }
        };
        for role in roles {
            match role.parse::<Role>() {
                Ok(role) => bindings.push(Binding {
                    pattern: pattern.clone(),
                    role,
                }),
                Err(e) => warn!("Ignoring role binding {}: {}", pattern, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{self, models::Namespace};

    fn bindings(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<String>> {
        let mut out: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (pattern, role) in pairs {
            out.entry(pattern.to_string()).or_default().push(role.to_string());
        }
        out
    }

    fn user(primary: &str, extra: &[(&str, &str)]) -> Entity {
        Entity {
            authenticated: true,
            primary_namespace: Some(primary.to_string()),
            role_bindings: bindings(extra),
            exp: Some(Utc::now().timestamp() + 3600),
        }
    }

    #[test]
    fn test_anonymous_gets_unauthenticated_bindings_only() {
        let conn = db::open_in_memory().unwrap();
        let authz = Authorization::resolve(&conn, &Entity::anonymous(), &AuthSection::default()).unwrap();
        assert!(authz.is_allowed("default", Some("env"), Permission::EnvironmentRead));
        assert!(!authz.is_allowed("default", Some("env"), Permission::EnvironmentCreate));
        assert!(!authz.is_allowed("filesystem", Some("env"), Permission::EnvironmentRead));
    }

    #[test]
    fn test_primary_namespace_is_admin() {
        let conn = db::open_in_memory().unwrap();
        let authz = Authorization::resolve(&conn, &user("alice", &[]), &AuthSection::default()).unwrap();
        assert!(authz.is_allowed("alice", None, Permission::NamespaceDelete));
        assert!(authz.is_allowed("alice", Some("x"), Permission::BuildDelete));
        assert!(authz.is_allowed("filesystem", Some("x"), Permission::EnvironmentRead));
        assert!(!authz.is_allowed("bob", Some("x"), Permission::EnvironmentRead));
    }

    #[test]
    fn test_namespace_checks_need_wildcard_environment() {
        let conn = db::open_in_memory().unwrap();
        let entity = user("alice", &[("team/app", "admin")]);
        let authz = Authorization::resolve(&conn, &entity, &AuthSection::default()).unwrap();
        assert!(authz.is_allowed("team", Some("app"), Permission::EnvironmentDelete));
        assert!(!authz.is_allowed("team", None, Permission::NamespaceRead));
    }

    #[test]
    fn test_role_mappings_grant_across_namespaces() {
        let conn = db::open_in_memory().unwrap();
        let ns = Namespace::ensure(&conn, "shared").unwrap();
        NamespaceRoleMapping::create(&conn, ns.id.unwrap(), "team-*", "developer").unwrap();

        let member = Authorization::resolve(&conn, &user("team-a", &[]), &AuthSection::default()).unwrap();
        assert!(member.is_allowed("shared", Some("env"), Permission::EnvironmentCreate));
        assert!(!member.is_allowed("shared", Some("env"), Permission::BuildDelete));

        let outsider = Authorization::resolve(&conn, &user("other", &[]), &AuthSection::default()).unwrap();
        assert!(!outsider.is_allowed("shared", Some("env"), Permission::EnvironmentRead));
    }

    #[test]
    fn test_visible_and_permissions() {
        let conn = db::open_in_memory().unwrap();
        let authz = Authorization::resolve(&conn, &user("alice", &[]), &AuthSection::default()).unwrap();
        let visible = authz.visible(Permission::EnvironmentDelete);
        assert_eq!(visible, vec![("alice".to_string(), "*".to_string())]);

        let permissions = authz.permissions();
        assert!(permissions["default/*"].contains(&Permission::EnvironmentRead));
        assert!(permissions["alice/*"].contains(&Permission::SettingUpdate));
        assert!(!authz.is_global(Permission::SettingRead));

        let root = Authorization::resolve(&conn, &user("ops", &[("*/*", "admin")]), &AuthSection::default()).unwrap();
        assert!(root.is_global(Permission::SettingUpdate));
    }

    #[test]
    fn test_issue_is_bounded_by_caller() {
        let conn = db::open_in_memory().unwrap();
        let authn = Authenticator::new(TokenSigner::generate(), AuthSection::default(), Duration::from_secs(3600));
        let caller = Authorization::resolve(&conn, &user("alice", &[("team/*", "developer")]), &AuthSection::default())
            .unwrap();

        let (token, claims) = authn
            .issue(
                &caller,
                TokenRequest {
                    role_bindings: Some(bindings(&[("team/app", "editor")])),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(claims.primary_namespace, "alice");
        assert_eq!(claims.role_bindings["team/app"], vec!["developer".to_string()]);
        assert!(claims.exp <= caller.entity.exp.unwrap());
        assert_eq!(authn.entity(Some(&token)).unwrap().primary_namespace.as_deref(), Some("alice"));

        let escalate = TokenRequest {
            role_bindings: Some(bindings(&[("team/*", "admin")])),
            ..Default::default()
        };
        assert!(matches!(authn.issue(&caller, escalate), Err(Error::Authorization(_))));

        let foreign_primary = TokenRequest {
            primary_namespace: Some("bob".into()),
            ..Default::default()
        };
        assert!(matches!(authn.issue(&caller, foreign_primary), Err(Error::Authorization(_))));

        let too_long = TokenRequest {
            expiration: Some(Utc::now() + chrono::Duration::days(30)),
            ..Default::default()
        };
        assert!(matches!(authn.issue(&caller, too_long), Err(Error::Authorization(_))));
    }

    #[test]
    fn test_anonymous_cannot_issue() {
        let conn = db::open_in_memory().unwrap();
        let authn = Authenticator::new(TokenSigner::generate(), AuthSection::default(), Duration::from_secs(3600));
        let caller = Authorization::resolve(&conn, &Entity::anonymous(), &AuthSection::default()).unwrap();
        assert!(authn.issue(&caller, TokenRequest::default()).is_err());
        assert_eq!(authn.entity(None).unwrap(), Entity::anonymous());
        assert!(authn.entity(Some("bogus")).is_err());
    }
}
