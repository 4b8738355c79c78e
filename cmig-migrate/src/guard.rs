//! Permission guard
//!
//! The HTTP layer asks the guard before invoking an orchestrator operation.
//! The orchestrator itself only enforces tenancy: a run owned by another
//! clinic is reported as not found.

use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use crate::error::{MigrationError, MigrationResult};

/// Who is calling, as established by the boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerContext {
    pub clinic_id: Uuid,
    /// None for unauthenticated or system callers
    pub actor_id: Option<String>,
}

impl CallerContext {
    pub fn new(clinic_id: Uuid, actor_id: Option<String>) -> Self {
        Self {
            clinic_id,
            actor_id: actor_id.filter(|a| !a.trim().is_empty()),
        }
    }

    /// Caller with no actor, used for startup recovery and tests
    pub fn system(clinic_id: Uuid) -> Self {
        Self {
            clinic_id,
            actor_id: None,
        }
    }
}

/// Operation being authorized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardAction {
    StartRun,
    ViewRun,
    RunPhase,
    ApproveMapping,
    ReviseMapping,
    Pause,
    Resume,
    RejectRecord,
    Purge,
}

impl GuardAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardAction::StartRun => "start_run",
            GuardAction::ViewRun => "view_run",
            GuardAction::RunPhase => "run_phase",
            GuardAction::ApproveMapping => "approve_mapping",
            GuardAction::ReviseMapping => "revise_mapping",
            GuardAction::Pause => "pause",
            GuardAction::Resume => "resume",
            GuardAction::RejectRecord => "reject_record",
            GuardAction::Purge => "purge",
        }
    }
}

impl fmt::Display for GuardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub trait PermissionGuard: Send + Sync {
    /// Returns the acting actor id, or an authorization error
    fn require_permission(
        &self,
        caller: &CallerContext,
        resource: &str,
        action: GuardAction,
    ) -> MigrationResult<String>;
}

/// Fixed approver list from configuration
///
/// Every operation needs an identified actor. Approval and purge are limited
/// to the approver list; an empty list lets any actor through.
#[derive(Debug, Clone, Default)]
pub struct StaticPermissionGuard {
    approvers: BTreeSet<String>,
}

impl StaticPermissionGuard {
    pub fn new<I, S>(approvers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            approvers: approvers.into_iter().map(Into::into).collect(),
        }
    }

    fn privileged(action: GuardAction) -> bool {
        matches!(action, GuardAction::ApproveMapping | GuardAction::Purge)
    }
}

impl PermissionGuard for StaticPermissionGuard {
    fn require_permission(
        &self,
        caller: &CallerContext,
        resource: &str,
        action: GuardAction,
    ) -> MigrationResult<String> {
        let actor = caller.actor_id.as_deref().ok_or_else(|| {
            MigrationError::Authorization(format!("{} on {} requires an actor", action, resource))
        })?;

        if Self::privileged(action) && !self.approvers.is_empty() && !self.approvers.contains(actor)
        {
            tracing::warn!(
                clinic_id = %caller.clinic_id,
                actor_id = actor,
                action = %action,
                resource,
                "Permission denied"
            );
            return Err(MigrationError::Authorization(format!(
                "actor {} may not {} {}",
                actor, action, resource
            )));
        }

        Ok(actor.to_string())
    }
}
