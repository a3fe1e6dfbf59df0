//! Administrator role checks.

use crate::error::{PortfolioError, PortfolioResult};
use std::collections::BTreeSet;

/// Set of principals allowed to mutate the portfolio.
#[derive(Debug, Clone, Default)]
pub struct AccessControl {
    admins: BTreeSet<String>,
}

impl AccessControl {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_admin(&self, principal: &str) -> bool {
        self.admins.contains(principal)
    }

    pub fn ensure_admin(&self, principal: &str) -> PortfolioResult<()> {
        if self.is_admin(principal) {
            Ok(())
        } else {
            Err(PortfolioError::Unauthorized {
                principal: principal.to_string(),
            })
        }
    }

    /// Returns false if the principal already was an administrator.
    pub fn grant(&mut self, principal: &str) -> bool {
        self.admins.insert(principal.to_string())
    }

    /// Fails if `principal` is the only administrator left.
    pub fn revoke(&mut self, principal: &str) -> PortfolioResult<bool> {
        if self.admins.len() == 1 && self.is_admin(principal) {
            return Err(PortfolioError::LastAdministrator {
                principal: principal.to_string(),
            });
        }
        Ok(self.admins.remove(principal))
    }

    pub fn admins(&self) -> impl Iterator<Item = &str> {
        self.admins.iter().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_admin() {
        let access = AccessControl::new(["ops"]);
        assert!(access.ensure_admin("ops").is_ok());
        assert_eq!(
            access.ensure_admin("mallory").unwrap_err(),
            PortfolioError::Unauthorized {
                principal: "mallory".to_string()
            }
        );
    }

    #[test]
    fn test_cannot_revoke_last_admin() {
        let mut access = AccessControl::new(["ops"]);
        assert!(access.grant("treasury"));
        assert!(!access.grant("treasury"));

        assert!(access.revoke("ops").unwrap());
        assert!(matches!(
            access.revoke("treasury"),
            Err(PortfolioError::LastAdministrator { .. })
        ));
        assert_eq!(access.admins().collect::<Vec<_>>(), vec!["treasury"]);
    }
}
