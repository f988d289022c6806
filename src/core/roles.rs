// src/core/roles.rs

//! The node role identifiers shared between the keeper, the monitor, and the
//! notification channel.
//!
//! Roles are wire-serialized as lowercase identifiers (`wait_primary`,
//! `catchingup`, ...) and must remain stable across versions; the binary ids
//! used in the state file are likewise frozen.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{Display, EnumIter, EnumString, IntoStaticStr};

/// The role of a node in its replication group, as reported by the keeper and
/// assigned by the monitor.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeRole {
    NoState,
    Init,
    Single,
    WaitPrimary,
    Primary,
    WaitStandby,
    Catchingup,
    Secondary,
    PreparePromotion,
    StopReplication,
    Demoted,
    DemoteTimeout,
    Draining,
    ReportLsn,
    Maintenance,
    PrepareMaintenance,
    JoinPrimary,
    ApplySettings,
    FastForward,
    Dropped,
    /// Sentinel for a role identifier this keeper does not know. Never
    /// reported back to the monitor and never persisted.
    Unknown,
}

impl NodeRole {
    /// The stable lowercase identifier used on the wire.
    pub fn wire_name(&self) -> &'static str {
        (*self).into()
    }

    /// Strict parse of a wire identifier. `None` for anything unknown,
    /// including the `unknown` sentinel itself.
    pub fn from_wire(s: &str) -> Option<NodeRole> {
        match NodeRole::from_str(s) {
            Ok(NodeRole::Unknown) | Err(_) => None,
            Ok(role) => Some(role),
        }
    }

    /// Lenient parse: unknown identifiers degrade to [`NodeRole::Unknown`]
    /// instead of failing, so that a newer monitor never crashes an older
    /// keeper.
    pub fn parse_lenient(s: &str) -> NodeRole {
        Self::from_wire(s).unwrap_or(NodeRole::Unknown)
    }

    /// The frozen id used in the binary state file.
    pub fn binary_id(&self) -> u32 {
        match self {
            NodeRole::NoState => 0,
            NodeRole::Init => 1,
            NodeRole::Single => 2,
            NodeRole::WaitPrimary => 3,
            NodeRole::Primary => 4,
            NodeRole::WaitStandby => 5,
            NodeRole::Catchingup => 6,
            NodeRole::Secondary => 7,
            NodeRole::PreparePromotion => 8,
            NodeRole::StopReplication => 9,
            NodeRole::Demoted => 10,
            NodeRole::DemoteTimeout => 11,
            NodeRole::Draining => 12,
            NodeRole::ReportLsn => 13,
            NodeRole::Maintenance => 14,
            NodeRole::JoinPrimary => 15,
            NodeRole::ApplySettings => 16,
            NodeRole::FastForward => 17,
            NodeRole::Dropped => 18,
            NodeRole::PrepareMaintenance => 19,
            // Unknown is in-memory only; writers must reject it first.
            NodeRole::Unknown => u32::MAX,
        }
    }

    /// Inverse of [`binary_id`](Self::binary_id). `None` for ids written by a
    /// newer keeper or a corrupt file.
    pub fn from_binary_id(id: u32) -> Option<NodeRole> {
        let role = match id {
            0 => NodeRole::NoState,
            1 => NodeRole::Init,
            2 => NodeRole::Single,
            3 => NodeRole::WaitPrimary,
            4 => NodeRole::Primary,
            5 => NodeRole::WaitStandby,
            6 => NodeRole::Catchingup,
            7 => NodeRole::Secondary,
            8 => NodeRole::PreparePromotion,
            9 => NodeRole::StopReplication,
            10 => NodeRole::Demoted,
            11 => NodeRole::DemoteTimeout,
            12 => NodeRole::Draining,
            13 => NodeRole::ReportLsn,
            14 => NodeRole::Maintenance,
            15 => NodeRole::JoinPrimary,
            16 => NodeRole::ApplySettings,
            17 => NodeRole::FastForward,
            18 => NodeRole::Dropped,
            19 => NodeRole::PrepareMaintenance,
            _ => return None,
        };
        Some(role)
    }

    /// True for the roles in which the local Postgres accepts writes.
    pub fn accepts_writes(&self) -> bool {
        matches!(
            self,
            NodeRole::Single | NodeRole::WaitPrimary | NodeRole::Primary | NodeRole::JoinPrimary
        )
    }

    /// True for the roles in which the local Postgres runs as a standby.
    pub fn is_standby(&self) -> bool {
        matches!(
            self,
            NodeRole::WaitStandby
                | NodeRole::Catchingup
                | NodeRole::Secondary
                | NodeRole::ReportLsn
                | NodeRole::PreparePromotion
                | NodeRole::StopReplication
        )
    }
}
