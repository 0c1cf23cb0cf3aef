//! Per-request authorization context.
//!
//! Resolved by the gateway once per request and discarded afterwards.
//! Accessors receive it read-only; they never look sessions up themselves.

/// Coarse access level a caller holds toward the target namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    /// No relationship at all; the request is rejected outright.
    None,
    /// May learn the namespace exists (signature checks only).
    Know,
    /// May discover and retrieve rows.
    Read,
    /// May also store rows.
    Write,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    /// Identity of the caller (row id in `global.user`).
    pub user_id: i64,
    /// Project the request targets; `None` for the global namespace.
    pub project_id: Option<i64>,
    /// Coarse access level computed from membership and project settings.
    pub access: Access,
    /// Administrative identities bypass per-row restrictions.
    pub unrestricted: bool,
    /// Session area (`client` interactive, `robot` automated, `admin`).
    pub area: String,
}

impl Credentials {
    /// Context for internal operations that answer to no caller.
    pub fn internal() -> Self {
        Credentials {
            user_id: 0,
            project_id: None,
            access: Access::Write,
            unrestricted: true,
            area: "internal".to_string(),
        }
    }

    pub fn can_read(&self) -> bool {
        self.unrestricted || self.access >= Access::Read
    }

    pub fn can_write(&self) -> bool {
        self.unrestricted || self.access >= Access::Write
    }

    pub fn can_know(&self) -> bool {
        self.unrestricted || self.access >= Access::Know
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(access: Access, unrestricted: bool) -> Credentials {
        Credentials {
            user_id: 7,
            project_id: Some(1),
            access,
            unrestricted,
            area: "client".to_string(),
        }
    }

    #[test]
    fn test_access_ordering() {
        assert!(Access::Write > Access::Read);
        assert!(Access::Read > Access::Know);
        assert!(Access::Know > Access::None);
    }

    #[test]
    fn test_level_checks() {
        assert!(!creds(Access::None, false).can_know());
        assert!(creds(Access::Know, false).can_know());
        assert!(!creds(Access::Know, false).can_read());
        assert!(creds(Access::Read, false).can_read());
        assert!(!creds(Access::Read, false).can_write());
        assert!(creds(Access::Write, false).can_write());
    }

    #[test]
    fn test_unrestricted_bypasses_level() {
        assert!(creds(Access::None, true).can_write());
    }
}
