//! Node status display
//!
//! Nodes report a small colored indicator with a line of text whenever their
//! connection changes. The host decides how to show it; the default sink
//! writes it to the log.

use crate::broker::NodeId;
use serde::Serialize;
use std::fmt;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusFill {
    Red,
    Green,
    Yellow,
    Grey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusShape {
    Dot,
    Ring,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub fill: StatusFill,
    pub shape: StatusShape,
    pub text: String,
}

impl NodeStatus {
    /// Green dot
    pub fn ok(text: impl Into<String>) -> Self {
        Self {
            fill: StatusFill::Green,
            shape: StatusShape::Dot,
            text: text.into(),
        }
    }

    /// Red ring
    pub fn problem(text: impl Into<String>) -> Self {
        Self {
            fill: StatusFill::Red,
            shape: StatusShape::Ring,
            text: text.into(),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?} {:?}] {}", self.fill, self.shape, self.text)
    }
}

/// Receives status updates from nodes
pub trait StatusSink: Send + Sync {
    fn report(&self, node: &NodeId, status: NodeStatus);
}

/// Writes status updates through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStatus;

impl StatusSink for TracingStatus {
    fn report(&self, node: &NodeId, status: NodeStatus) {
        match status.fill {
            StatusFill::Red => warn!(node = %node, status = %status.text, "Node status"),
            _ => info!(node = %node, status = %status.text, "Node status"),
        }
    }
}
