//! Aegis Database Topology
//!
//! Membership of a database across cluster nodes. The first member of the
//! topology is the primary for background work such as rollups and
//! retention; every other member only schedules work and waits for the
//! primary's results to replicate in.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use aegis_common::NodeTag;
use serde::{Deserialize, Serialize};

// =============================================================================
// Node Status
// =============================================================================

/// Status of a node in the database group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeStatus {
    /// Node is catching up and does not serve as primary yet.
    #[default]
    Promotable,
    /// Node is a full member.
    Member,
    /// Node is being removed from the group.
    Leaving,
}

// =============================================================================
// Database Topology
// =============================================================================

/// Ordered membership of one database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseTopology {
    members: Vec<NodeTag>,
    promotables: Vec<NodeTag>,
}

impl DatabaseTopology {
    pub fn new(members: impl IntoIterator<Item = NodeTag>) -> Self {
        Self {
            members: members.into_iter().collect(),
            promotables: Vec::new(),
        }
    }

    /// A topology with a single member.
    pub fn single(tag: impl Into<NodeTag>) -> Self {
        Self::new([tag.into()])
    }

    pub fn members(&self) -> &[NodeTag] {
        &self.members
    }

    /// The node responsible for background work.
    pub fn primary(&self) -> Option<&NodeTag> {
        self.members.first()
    }

    pub fn is_primary(&self, tag: &NodeTag) -> bool {
        self.primary() == Some(tag)
    }

    pub fn status_of(&self, tag: &NodeTag) -> Option<NodeStatus> {
        if self.members.contains(tag) {
            Some(NodeStatus::Member)
        } else if self.promotables.contains(tag) {
            Some(NodeStatus::Promotable)
        } else {
            None
        }
    }

    /// Add a node that will become a member once promoted.
    pub fn add_promotable(&mut self, tag: NodeTag) {
        if self.status_of(&tag).is_none() {
            self.promotables.push(tag);
        }
    }

    /// Promote a node to a full member, appended after existing members.
    pub fn promote(&mut self, tag: &NodeTag) -> bool {
        match self.promotables.iter().position(|t| t == tag) {
            Some(pos) => {
                let tag = self.promotables.remove(pos);
                self.members.push(tag);
                true
            }
            None => false,
        }
    }

    /// Remove a node entirely. Removing the primary hands the role to the next member.
    pub fn remove(&mut self, tag: &NodeTag) -> bool {
        let before = self.members.len() + self.promotables.len();
        self.members.retain(|t| t != tag);
        self.promotables.retain(|t| t != tag);
        before != self.members.len() + self.promotables.len()
    }

    /// Move a member to the front, making it primary.
    pub fn set_primary(&mut self, tag: &NodeTag) -> bool {
        match self.members.iter().position(|t| t == tag) {
            Some(pos) => {
                let tag = self.members.remove(pos);
                self.members.insert(0, tag);
                true
            }
            None => false,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
