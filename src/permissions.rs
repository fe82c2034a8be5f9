//! Authorization collaborator consumed by the engine.

use crate::config::PolicyConfig;
use crate::types::{LockPurpose, PrincipalId, ProjectId};

/// Decides whether a principal may act on a project.
///
/// Role, team membership and mapping-level rules live behind this trait.
pub trait PermissionCheck: Send + Sync {
    /// May `principal` lock tasks in `project` for `purpose`?
    fn may_lock(&self, principal: PrincipalId, project: ProjectId, purpose: LockPurpose) -> bool;

    /// May `principal` validate a task whose latest mapping is their own?
    fn may_validate_own_work(&self, _principal: PrincipalId, _project: ProjectId) -> bool {
        true
    }

    /// May `principal` run project-wide bulk transitions?
    fn may_administer(&self, principal: PrincipalId, project: ProjectId) -> bool;
}

/// Grants everything. Useful for tests and trusted operators.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionCheck for AllowAll {
    fn may_lock(
        &self,
        _principal: PrincipalId,
        _project: ProjectId,
        _purpose: LockPurpose,
    ) -> bool {
        true
    }

    fn may_administer(&self, _principal: PrincipalId, _project: ProjectId) -> bool {
        true
    }
}

/// Permissions driven by the `policy` config section.
#[derive(Debug, Clone)]
pub struct PolicyPermissions {
    policy: PolicyConfig,
}

impl PolicyPermissions {
    pub fn new(policy: PolicyConfig) -> Self {
        Self { policy }
    }

    fn is_blocked(&self, principal: PrincipalId) -> bool {
        self.policy.blocked.contains(&principal)
    }
}

impl PermissionCheck for PolicyPermissions {
    fn may_lock(&self, principal: PrincipalId, _project: ProjectId, _purpose: LockPurpose) -> bool {
        !self.is_blocked(principal)
    }

    fn may_validate_own_work(&self, _principal: PrincipalId, _project: ProjectId) -> bool {
        self.policy.allow_self_validation
    }

    fn may_administer(&self, principal: PrincipalId, _project: ProjectId) -> bool {
        !self.is_blocked(principal) && self.policy.administrators.contains(&principal)
    }
}
