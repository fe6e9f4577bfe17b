//! Caller identity from trusted gateway headers
//!
//! The API sits behind a gateway that has already authenticated the caller
//! and forwards the identity in request headers. Roles are mapped onto
//! permission rules through the configured policy.

use crate::domain::ports::Token;
use crate::error::{Error, Result};
use axum::http::HeaderMap;
use std::collections::{BTreeMap, BTreeSet};

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_USER_NAME: &str = "x-user-name";
pub const HEADER_USER_DOMAIN_ID: &str = "x-user-domain-id";
pub const HEADER_USER_DOMAIN_NAME: &str = "x-user-domain-name";
pub const HEADER_PROJECT_ID: &str = "x-project-id";
pub const HEADER_ROLES: &str = "x-roles";

/// Turns request headers into a caller token
pub trait Authorizer: Send + Sync {
    fn authorize(&self, headers: &HeaderMap) -> Result<Token>;
}

/// Trusts identity headers set by the gateway
pub struct TrustedHeaderAuthorizer {
    /// role → rules granted to it
    grants: BTreeMap<String, BTreeSet<String>>,
}

impl TrustedHeaderAuthorizer {
    /// Build from a policy mapping each rule to the roles allowed to use it
    pub fn new(policy: &BTreeMap<String, Vec<String>>) -> Self {
        let mut grants: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (rule, roles) in policy {
            for role in roles {
                grants.entry(role.clone()).or_default().insert(rule.clone());
            }
        }
        Self { grants }
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

impl Authorizer for TrustedHeaderAuthorizer {
    fn authorize(&self, headers: &HeaderMap) -> Result<Token> {
        let user_id = header(headers, HEADER_USER_ID)
            .ok_or_else(|| Error::Unauthenticated(format!("missing {} header", HEADER_USER_ID)))?;

        let granted_rules = header(headers, HEADER_ROLES)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter_map(|role| self.grants.get(role))
            .flatten()
            .cloned()
            .collect();

        Ok(Token {
            user_name: header(headers, HEADER_USER_NAME).unwrap_or_else(|| user_id.clone()),
            user_id,
            user_domain_id: header(headers, HEADER_USER_DOMAIN_ID).unwrap_or_default(),
            user_domain_name: header(headers, HEADER_USER_DOMAIN_NAME).unwrap_or_default(),
            project_id: header(headers, HEADER_PROJECT_ID),
            granted_rules,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::HeaderValue;

    fn authorizer() -> TrustedHeaderAuthorizer {
        TrustedHeaderAuthorizer::new(&BTreeMap::from([
            ("domain:raise".to_string(), vec!["cloud_admin".to_string()]),
            ("domain:lower".to_string(), vec!["cloud_admin".to_string()]),
            (
                "project:raise".to_string(),
                vec!["cloud_admin".to_string(), "domain_admin".to_string()],
            ),
        ]))
    }

    #[test]
    fn test_roles_map_to_rules() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_USER_ID, HeaderValue::from_static("u-7"));
        headers.insert(HEADER_USER_NAME, HeaderValue::from_static("dana"));
        headers.insert(HEADER_ROLES, HeaderValue::from_static("member, domain_admin"));

        let token = authorizer().authorize(&headers).unwrap();
        assert_eq!(token.user_id, "u-7");
        assert_eq!(token.user_name, "dana");
        assert!(token.check("project:raise"));
        assert!(!token.check("domain:raise"));
        assert_eq!(token.project_id, None);
    }

    #[test]
    fn test_missing_user_is_unauthenticated() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ROLES, HeaderValue::from_static("cloud_admin"));
        assert_matches!(authorizer().authorize(&headers), Err(Error::Unauthenticated(_)));
    }
}
