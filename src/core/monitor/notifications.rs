// src/core/monitor/notifications.rs

//! Parsing of the monitor's `LISTEN` payloads.
//!
//! The `state` channel carries colon-separated records of the form
//! `S:<reported>:<goal>:<node_id>.<formation>:<group_id>:<node_id>:<nodename>:<port>`.
//! Parsing is strictly best-effort: unknown roles degrade to `unknown`,
//! malformed payloads yield `None`. Notifications only feed logging; the
//! monitor's `node_active` reply is the authoritative channel.

use crate::core::roles::NodeRole;

/// A decoded state-change event from the `state` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateNotification {
    pub reported: NodeRole,
    pub goal: NodeRole,
    /// Node id carried in the formation-qualified field.
    pub notification_node_id: i64,
    pub formation: String,
    pub group_id: i32,
    pub node_id: i64,
    pub nodename: String,
    pub port: u16,
}

impl StateNotification {
    /// Parses a `state` channel payload. Returns `None` on any structural
    /// mismatch; never panics on malformed input.
    pub fn parse(payload: &str) -> Option<StateNotification> {
        let parts: Vec<&str> = payload.split(':').collect();
        if parts.len() != 8 || parts[0] != "S" {
            return None;
        }

        let reported = NodeRole::parse_lenient(parts[1]);
        let goal = NodeRole::parse_lenient(parts[2]);

        let (qualifier, formation) = parts[3].split_once('.')?;
        let notification_node_id: i64 = qualifier.parse().ok()?;
        if formation.is_empty() {
            return None;
        }

        Some(StateNotification {
            reported,
            goal,
            notification_node_id,
            formation: formation.to_string(),
            group_id: parts[4].parse().ok()?,
            node_id: parts[5].parse().ok()?,
            nodename: parts[6].to_string(),
            port: parts[7].parse().ok()?,
        })
    }

    /// Renders the payload back into its wire form. `parse(render(x)) == x`
    /// for every record parse can produce.
    pub fn render(&self) -> String {
        format!(
            "S:{}:{}:{}.{}:{}:{}:{}:{}",
            self.reported,
            self.goal,
            self.notification_node_id,
            self.formation,
            self.group_id,
            self.node_id,
            self.nodename,
            self.port
        )
    }

    /// One-line human description for the INFO log.
    pub fn describe(&self) -> String {
        format!(
            "node {} ({}:{}) in formation \"{}\" group {}: {} -> {}",
            self.node_id, self.nodename, self.port, self.formation, self.group_id, self.reported,
            self.goal
        )
    }
}
