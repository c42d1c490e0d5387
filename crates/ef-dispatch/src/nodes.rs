//! Registry of worker nodes and their capabilities.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ef_core::{HwAccel, NodeId};
use serde::Serialize;

use crate::model::JobType;

/// What a node told the dispatcher about itself.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Hardware encoders available; software is always implied.
    pub accels: Vec<HwAccel>,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl NodeInfo {
    pub fn has_accel(&self, hw: HwAccel) -> bool {
        !hw.is_hardware() || self.accels.contains(&hw)
    }
}

/// Known nodes, keyed by id.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: DashMap<NodeId, NodeInfo>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or re-register a node. Returns `true` for a new node.
    pub fn register(&self, id: NodeId, accels: Vec<HwAccel>) -> bool {
        let now = Utc::now();
        let accels: Vec<HwAccel> = accels.into_iter().filter(HwAccel::is_hardware).collect();
        match self.nodes.get_mut(&id) {
            Some(mut existing) => {
                existing.accels = accels;
                existing.last_seen = now;
                false
            }
            None => {
                self.nodes.insert(
                    id.clone(),
                    NodeInfo {
                        id,
                        accels,
                        registered_at: now,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Refresh a node's last-seen time. Returns `false` for unknown nodes.
    pub fn heartbeat(&self, id: &NodeId) -> bool {
        match self.nodes.get_mut(id) {
            Some(mut node) => {
                node.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.remove(id).map(|(_, info)| info)
    }

    pub fn get(&self, id: &NodeId) -> Option<NodeInfo> {
        self.nodes.get(id).map(|n| n.clone())
    }

    /// All nodes, sorted by id.
    pub fn list(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|n| n.clone()).collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether `id` is registered with `hw`. Unknown nodes have nothing.
    pub fn node_has(&self, id: &NodeId, hw: HwAccel) -> bool {
        self.nodes.get(id).is_some_and(|n| n.has_accel(hw))
    }
}

/// Constraints a caller puts on the next task it wants.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Node asking for work; its capabilities come from the registry.
    pub node_id: Option<NodeId>,
    /// Only these task types; `None` accepts every type.
    pub job_types: Option<Vec<JobType>>,
}

impl TaskFilter {
    /// Any task, for any node.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_node(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            job_types: None,
        }
    }

    pub fn with_types(mut self, types: impl IntoIterator<Item = JobType>) -> Self {
        self.job_types = Some(types.into_iter().collect());
        self
    }

    pub fn accepts_type(&self, job_type: JobType) -> bool {
        self.job_types.as_ref().map_or(true, |types| types.contains(&job_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let registry = NodeRegistry::new();
        assert!(registry.register(NodeId::from("a"), vec![HwAccel::Nvenc]));
        assert!(!registry.register(NodeId::from("a"), vec![HwAccel::Qsv, HwAccel::None]));
        assert_eq!(registry.len(), 1);
        let node = registry.get(&NodeId::from("a")).unwrap();
        assert_eq!(node.accels, vec![HwAccel::Qsv]);
    }

    #[test]
    fn capabilities() {
        let registry = NodeRegistry::new();
        registry.register(NodeId::from("gpu"), vec![HwAccel::Nvenc]);
        registry.register(NodeId::from("cpu"), vec![]);
        assert!(registry.node_has(&NodeId::from("gpu"), HwAccel::Nvenc));
        assert!(!registry.node_has(&NodeId::from("cpu"), HwAccel::Nvenc));
        assert!(registry.node_has(&NodeId::from("cpu"), HwAccel::None));
        assert!(!registry.node_has(&NodeId::from("ghost"), HwAccel::None));
        let ids: Vec<_> = registry.list().into_iter().map(|n| n.id.to_string()).collect();
        assert_eq!(ids, vec!["cpu", "gpu"]);
    }

    #[test]
    fn heartbeat_unknown_node() {
        let registry = NodeRegistry::new();
        assert!(!registry.heartbeat(&NodeId::from("x")));
        registry.register(NodeId::from("x"), vec![]);
        assert!(registry.heartbeat(&NodeId::from("x")));
        assert!(registry.remove(&NodeId::from("x")).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn filter_types() {
        let filter = TaskFilter::for_node("n1").with_types([JobType::Audio, JobType::Master]);
        assert!(filter.accepts_type(JobType::Master));
        assert!(!filter.accepts_type(JobType::Video));
        assert!(TaskFilter::any().accepts_type(JobType::Video));
    }
}
