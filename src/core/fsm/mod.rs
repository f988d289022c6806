// src/core/fsm/mod.rs

//! The node state machine: given the role the keeper is in and the role the
//! monitor assigned, select the local procedure that converges the two.
//!
//! Planning is total over the role pairs: equal roles plan to [`Plan::Stay`],
//! known edges plan to a [`TransitionAction`], and everything else is
//! [`Plan::Unsupported`], logged at ERROR by the caller and retried on the
//! next tick once the monitor re-issues an assignment.

pub mod actions;

pub use actions::{TransitionContext, execute};

use crate::core::roles::NodeRole;

/// A local procedure run by the keeper to reach the assigned role. Every
/// action checks its postcondition before doing work, so replaying an
/// assignment is a no-op and a crash mid-transition resumes cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionAction {
    /// initdb when needed, start, run standalone and writable.
    InitAsSingle,
    /// Nothing to do locally; the new role is acknowledged by reporting it.
    ReportOnly,
    /// `synchronous_standby_names = '*'`, reload.
    EnableSyncRep,
    /// Confirm a standby is streaming; keep the sync configuration.
    ConfirmPrimary,
    /// Lost the sync standby: drop the sync requirement, keep accepting
    /// writes.
    RelaxSyncRep,
    /// Back to a standalone primary: promote out of recovery if needed and
    /// clear the sync configuration.
    BecomeSingle,
    /// Stop accepting writes ahead of a scheduled failover.
    BlockWrites,
    /// Base backup from the primary, configure as standby, start streaming.
    InitAsStandby,
    /// Replay has caught up within the configured lag; no local work.
    ConfirmCatchup,
    /// Re-establish standby configuration toward the current primary.
    EnsureFollowing,
    /// Pause replay and report the final LSN.
    PreparePromotion,
    /// Disconnect from the old primary while staying in recovery.
    StopReplication,
    /// Promote, wait for a writable state, enable sync replication.
    PromoteToWaitPrimary,
    /// `pg_rewind` against the new primary (base backup on rewind failure),
    /// leaving the node stopped and configured to follow.
    FastForward,
    /// Start streaming again after a fast-forward.
    ResumeStreaming,
    /// Rewind and rejoin the group as a standby of the current primary.
    RejoinAsStandby,
    /// Stop Postgres (fast) for maintenance.
    StopForMaintenance,
    /// Start Postgres again and follow the current primary.
    ResumeFromMaintenance,
    /// Stop Postgres (fast); used by the demotion chain.
    EnsureStoppedFast,
    /// Make sure the node runs and record the position it reports.
    ReportLsn,
    /// A standby is joining: create its replication slot and open HBA.
    PrepareForNewStandby,
    /// Re-derive `synchronous_standby_names` and HBA from the monitor's
    /// current node set.
    ApplySettings,
    /// Stop Postgres; the keeper exits once the drop is reported.
    DropNode,
}

/// Outcome of planning one `(current, assigned)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Roles already agree.
    Stay,
    /// Run this procedure, then report the new role.
    Step(TransitionAction),
    /// No edge between these roles; the monitor stays in charge.
    Unsupported,
}

/// The transition table.
pub fn plan(current: NodeRole, assigned: NodeRole) -> Plan {
    use NodeRole::*;
    use TransitionAction as A;

    if current == assigned {
        return Plan::Stay;
    }

    let action = match (current, assigned) {
        // Bootstrap of the first node in a group.
        (NoState | Init, Single) => A::InitAsSingle,
        // A standby-to-be waits for the primary to make room for it.
        (NoState | Init, WaitStandby) => A::ReportOnly,

        // Primary-side sync replication management.
        (Single | JoinPrimary | ApplySettings, WaitPrimary) => A::EnableSyncRep,
        (WaitPrimary | JoinPrimary | ApplySettings, Primary) => A::ConfirmPrimary,
        (Primary, WaitPrimary) => A::RelaxSyncRep,
        (WaitPrimary | Primary | JoinPrimary | ApplySettings, Single) => A::RelaxSyncRep,
        (Demoted | DemoteTimeout | Draining, Single) => A::BecomeSingle,

        // Scheduled failover staging.
        (Single | WaitPrimary | Primary | JoinPrimary, PrepareMaintenance) => A::BlockWrites,
        (Secondary | Catchingup | ReportLsn, PrepareMaintenance) => A::ReportOnly,

        // Standby bootstrap and steady state.
        (WaitStandby, Catchingup) => A::InitAsStandby,
        (Maintenance, Catchingup | Secondary) => A::ResumeFromMaintenance,
        (FastForward, Catchingup | Secondary) => A::ResumeStreaming,
        (Catchingup, Secondary) => A::ConfirmCatchup,
        (Secondary | ApplySettings | ReportLsn, Catchingup) => A::EnsureFollowing,
        (ApplySettings | ReportLsn, Secondary) => A::EnsureFollowing,

        // Promotion of a standby.
        (Secondary | Catchingup | ReportLsn, PreparePromotion) => A::PreparePromotion,
        (PreparePromotion, StopReplication) => A::StopReplication,
        (PreparePromotion | StopReplication, WaitPrimary) => A::PromoteToWaitPrimary,

        // Rewinding a failed ex-primary (or a diverged standby).
        (Secondary | Catchingup | Demoted | DemoteTimeout | ReportLsn, FastForward) => {
            A::FastForward
        }
        (Demoted | DemoteTimeout, Catchingup) => A::RejoinAsStandby,

        // A new standby joins the group.
        (Single | WaitPrimary | Primary | ApplySettings, JoinPrimary) => A::PrepareForNewStandby,

        // Nothing after a drop.
        (Dropped, _) => return Plan::Unsupported,

        // Role-independent assignments.
        (_, ApplySettings) => A::ApplySettings,
        (_, Maintenance) => A::StopForMaintenance,
        (_, ReportLsn) => A::ReportLsn,
        (_, Draining | DemoteTimeout | Demoted) => A::EnsureStoppedFast,
        (_, Dropped) => A::DropNode,

        _ => return Plan::Unsupported,
    };

    Plan::Step(action)
}
