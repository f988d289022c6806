// src/core/fsm/actions.rs

//! The transition procedures.
//!
//! Every procedure is restartable: it checks its postcondition first, so the
//! keeper can crash mid-transition and converge on the next tick. On failure
//! the transition is abandoned, `current_role` stays put, and the monitor
//! re-issues the assignment.

use super::TransitionAction;
use crate::config::KeeperConfig;
use crate::core::errors::KeeperError;
use crate::core::keeper::state::KeeperState;
use crate::core::monitor::{MonitorLink, NodeAddress};
use crate::core::postgres::conf::{replication_slot_name, standby_application_name};
use crate::core::postgres::{PostgresAdmin, StopMode};
use tracing::info;

/// Borrowed view of everything a transition may touch. The keeper loop owns
/// all of it and lends it per transition.
pub struct TransitionContext<'a> {
    pub pg: &'a dyn PostgresAdmin,
    pub monitor: &'a dyn MonitorLink,
    pub config: &'a KeeperConfig,
    pub state: &'a mut KeeperState,
}

impl TransitionContext<'_> {
    async fn current_primary(&self) -> Result<NodeAddress, KeeperError> {
        self.monitor
            .get_primary(&self.config.pg_autoctl.formation, self.state.current_group)
            .await
    }

    fn my_slot(&self) -> String {
        replication_slot_name(self.state.current_node_id)
    }

    fn my_application_name(&self) -> String {
        standby_application_name(self.state.current_node_id)
    }
}

/// Builds the `synchronous_standby_names` expression for the given peers.
/// One sync standby among all known standbys, addressed by the application
/// names they announce.
pub fn sync_standby_expression(peers: &[NodeAddress]) -> String {
    let names: Vec<String> = peers
        .iter()
        .filter(|p| !p.is_primary)
        .map(|p| standby_application_name(p.node_id))
        .collect();
    if names.is_empty() {
        String::new()
    } else {
        format!("ANY 1 ({})", names.join(", "))
    }
}

/// Runs one transition procedure to completion.
pub async fn execute(
    ctx: &mut TransitionContext<'_>,
    action: TransitionAction,
) -> Result<(), KeeperError> {
    match action {
        TransitionAction::ReportOnly => Ok(()),

        TransitionAction::InitAsSingle => {
            if ctx.pg.init_if_needed().await? {
                info!("initialized a new data directory");
            }
            ctx.pg.ensure_running().await?;
            let st = ctx.pg.probe().await;
            if !st.pg_is_running {
                return Err(KeeperError::Transient("server is not up yet".into()));
            }
            if st.is_in_recovery {
                return Err(KeeperError::Transient(
                    "server is still in recovery; cannot run as single".into(),
                ));
            }
            Ok(())
        }

        TransitionAction::EnableSyncRep => {
            ctx.pg.ensure_running().await?;
            let st = ctx.pg.probe().await;
            if !st.pg_is_running || st.is_in_recovery {
                return Err(KeeperError::Transient(
                    "server is not writable; cannot enable sync replication".into(),
                ));
            }
            ctx.pg.set_synchronous_standby_names("*").await?;
            Ok(())
        }

        TransitionAction::ConfirmPrimary => {
            let st = ctx.pg.probe().await;
            if !st.pg_is_running || st.is_in_recovery {
                return Err(KeeperError::Transient("server is not writable".into()));
            }
            if !ctx.pg.has_streaming_standby().await? {
                return Err(KeeperError::Transient(
                    "no standby is streaming yet".into(),
                ));
            }
            ctx.pg.set_transaction_read_only(false).await?;
            Ok(())
        }

        TransitionAction::RelaxSyncRep => {
            let st = ctx.pg.probe().await;
            if !st.pg_is_running || st.is_in_recovery {
                return Err(KeeperError::Transient("server is not writable".into()));
            }
            ctx.pg.set_synchronous_standby_names("").await?;
            Ok(())
        }

        TransitionAction::BecomeSingle => {
            ctx.pg.ensure_running().await?;
            let st = ctx.pg.probe().await;
            if st.is_in_recovery {
                ctx.pg.promote().await?;
            }
            ctx.pg.set_synchronous_standby_names("").await?;
            Ok(())
        }

        TransitionAction::BlockWrites => {
            let st = ctx.pg.probe().await;
            if !st.pg_is_running {
                return Err(KeeperError::Transient("server is not up".into()));
            }
            ctx.pg.set_transaction_read_only(true).await?;
            info!("writes are now blocked ahead of the failover");
            Ok(())
        }

        TransitionAction::InitAsStandby => {
            // A crashed first attempt may have left a complete standby
            // behind; starting it is all that remains then.
            if ctx.pg.is_following().await.unwrap_or(false) {
                ctx.pg.ensure_running().await?;
                let st = ctx.pg.probe().await;
                if st.pg_is_running && st.is_in_recovery {
                    return Ok(());
                }
            }

            let primary = ctx.current_primary().await?;
            info!(
                "building a standby from {}:{}",
                primary.host, primary.port
            );
            ctx.pg.base_backup_from(&primary).await?;
            let slot = ctx.my_slot();
            let application_name = ctx.my_application_name();
            ctx.pg
                .follow(&primary, &slot, &application_name, false)
                .await?;
            ctx.pg.ensure_running().await?;

            let st = ctx.pg.probe().await;
            if !st.pg_is_running || !st.is_in_recovery {
                return Err(KeeperError::Transient(
                    "standby did not come up in recovery".into(),
                ));
            }
            Ok(())
        }

        TransitionAction::ConfirmCatchup => {
            let st = ctx.pg.probe().await;
            if !st.pg_is_running || !st.is_in_recovery {
                return Err(KeeperError::Transient("standby is not up".into()));
            }
            let max_lag = ctx.config.replication.catchup_max_lag_bytes;
            match st.wal_lag_bytes {
                Some(lag) if lag <= max_lag => Ok(()),
                Some(lag) => Err(KeeperError::Transient(format!(
                    "still catching up: {lag} bytes behind (threshold {max_lag})"
                ))),
                None => Err(KeeperError::Transient(
                    "replication has not started streaming yet".into(),
                )),
            }
        }

        TransitionAction::EnsureFollowing => {
            let st = ctx.pg.probe().await;
            if st.pg_is_running
                && st.is_in_recovery
                && ctx.pg.is_following().await.unwrap_or(false)
            {
                return Ok(());
            }
            let primary = ctx.current_primary().await?;
            let slot = ctx.my_slot();
            let application_name = ctx.my_application_name();
            ctx.pg
                .follow(&primary, &slot, &application_name, true)
                .await?;
            ctx.pg.ensure_running().await?;
            let st = ctx.pg.probe().await;
            if !st.pg_is_running || !st.is_in_recovery {
                return Err(KeeperError::Transient("standby is not up".into()));
            }
            Ok(())
        }

        TransitionAction::PreparePromotion => {
            let st = ctx.pg.probe().await;
            if !st.pg_is_running {
                return Err(KeeperError::Transient("server is not up".into()));
            }
            if st.is_in_recovery {
                ctx.pg.pause_wal_replay().await?;
            }
            let st = ctx.pg.probe().await;
            ctx.state.xlog_location = st.current_lsn.0;
            info!("replay paused; final position is {}", st.current_lsn);
            Ok(())
        }

        TransitionAction::StopReplication => {
            let st = ctx.pg.probe().await;
            if st.is_in_recovery {
                ctx.pg.drop_primary_conninfo().await?;
            }
            Ok(())
        }

        TransitionAction::PromoteToWaitPrimary => {
            ctx.pg.promote().await?;
            ctx.pg.set_synchronous_standby_names("*").await?;
            info!("promoted; accepting writes");
            Ok(())
        }

        TransitionAction::FastForward => {
            // A crashed earlier attempt may have finished the rewind: the
            // node is then stopped and configured to follow, which is this
            // action's postcondition. A live standby still gets rewound.
            let st = ctx.pg.probe().await;
            if !st.pg_is_running && ctx.pg.is_following().await.unwrap_or(false) {
                return Ok(());
            }
            let primary = ctx.current_primary().await?;
            ctx.pg.rewind_from(&primary).await?;
            let slot = ctx.my_slot();
            let application_name = ctx.my_application_name();
            ctx.pg
                .follow(&primary, &slot, &application_name, false)
                .await?;
            Ok(())
        }

        TransitionAction::ResumeStreaming => {
            if !ctx.pg.is_following().await.unwrap_or(false) {
                let primary = ctx.current_primary().await?;
                let slot = ctx.my_slot();
                let application_name = ctx.my_application_name();
                ctx.pg
                    .follow(&primary, &slot, &application_name, false)
                    .await?;
            }
            ctx.pg.ensure_running().await?;
            let st = ctx.pg.probe().await;
            if !st.pg_is_running || !st.is_in_recovery {
                return Err(KeeperError::Transient("standby is not up".into()));
            }
            Ok(())
        }

        TransitionAction::RejoinAsStandby => {
            let primary = ctx.current_primary().await?;
            ctx.pg.rewind_from(&primary).await?;
            let slot = ctx.my_slot();
            let application_name = ctx.my_application_name();
            ctx.pg
                .follow(&primary, &slot, &application_name, false)
                .await?;
            ctx.pg.ensure_running().await?;
            let st = ctx.pg.probe().await;
            if !st.pg_is_running || !st.is_in_recovery {
                return Err(KeeperError::Transient("standby is not up".into()));
            }
            Ok(())
        }

        TransitionAction::StopForMaintenance | TransitionAction::EnsureStoppedFast => {
            ctx.pg.ensure_stopped(StopMode::Fast).await?;
            Ok(())
        }

        TransitionAction::ResumeFromMaintenance => {
            let primary = ctx.current_primary().await?;
            let slot = ctx.my_slot();
            let application_name = ctx.my_application_name();
            ctx.pg
                .follow(&primary, &slot, &application_name, false)
                .await?;
            ctx.pg.ensure_running().await?;
            let st = ctx.pg.probe().await;
            if !st.pg_is_running || !st.is_in_recovery {
                return Err(KeeperError::Transient("standby is not up".into()));
            }
            Ok(())
        }

        TransitionAction::ReportLsn => {
            ctx.pg.ensure_running().await?;
            let st = ctx.pg.probe().await;
            if !st.pg_is_running {
                return Err(KeeperError::Transient("server is not up".into()));
            }
            ctx.state.xlog_location = st.current_lsn.0;
            Ok(())
        }

        TransitionAction::PrepareForNewStandby => {
            let peers = ctx
                .monitor
                .get_other_nodes(ctx.state.current_node_id)
                .await?;
            for peer in peers.iter().filter(|p| !p.is_primary) {
                ctx.pg
                    .create_replication_slot(&replication_slot_name(peer.node_id))
                    .await?;
            }
            ctx.pg.ensure_hba_rules_for(&peers).await?;
            Ok(())
        }

        TransitionAction::ApplySettings => {
            let st = ctx.pg.probe().await;
            if st.pg_is_running && !st.is_in_recovery {
                let peers = ctx
                    .monitor
                    .get_other_nodes(ctx.state.current_node_id)
                    .await?;
                let expression = sync_standby_expression(&peers);
                ctx.pg.set_synchronous_standby_names(&expression).await?;
                ctx.pg.ensure_hba_rules_for(&peers).await?;
            }
            Ok(())
        }

        TransitionAction::DropNode => {
            ctx.pg.ensure_stopped(StopMode::Fast).await?;
            info!("node is dropped from the formation; the keeper will exit");
            Ok(())
        }
    }
}
