use std::fmt;

use serde::{Deserialize, Serialize};

/// Cluster-unique identity of a node's origin: the system identifier it was
/// initialized with, the timeline it is currently on, and the database it
/// is speaking for. Two nodes that are really the same physical node but on
/// different timelines (e.g. after a point-in-time restore) are distinct
/// `NodeId`s, matching how the replication transport tags messages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub sysid: u64,
    pub timeline: u32,
    pub dbid: u32,
}

impl NodeId {
    pub const fn new(sysid: u64, timeline: u32, dbid: u32) -> Self {
        NodeId {
            sysid,
            timeline,
            dbid,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.sysid, self.timeline, self.dbid)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_field_order() {
        let id = NodeId::new(42, 3, 7);
        assert_eq!(id.to_string(), "42/3/7");
    }

    #[test]
    fn ordering_is_lexicographic_on_fields() {
        let a = NodeId::new(1, 0, 0);
        let b = NodeId::new(1, 0, 1);
        assert!(a < b);
    }
}
