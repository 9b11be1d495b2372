use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::Node;

/// Node id → node record, shared between clones and guarded by a lock.
///
/// The lock is only held inside these methods, never across an `.await`.
/// Iteration works on a snapshot taken under the lock.
#[derive(Clone, Default)]
pub struct NodeMap {
  inner: Arc<Mutex<HashMap<String, Node>>>,
}

impl NodeMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn lock(&self) -> MutexGuard<'_, HashMap<String, Node>> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Insert or replace a node, returning the previous record.
  pub fn insert(&self, node: Node) -> Option<Node> {
    self.lock().insert(node.id.clone(), node)
  }

  pub fn get(&self, id: &str) -> Option<Node> {
    self.lock().get(id).cloned()
  }

  pub fn remove(&self, id: &str) -> Option<Node> {
    self.lock().remove(id)
  }

  pub fn contains(&self, id: &str) -> bool {
    self.lock().contains_key(id)
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// All nodes, ordered by id.
  pub fn snapshot(&self) -> Vec<Node> {
    let mut nodes: Vec<Node> = self.lock().values().cloned().collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));
    nodes
  }

  /// Call `f` on every node. The lock is released before the first call.
  pub fn for_each(&self, mut f: impl FnMut(&Node)) {
    for node in self.snapshot() {
      f(&node);
    }
  }

  /// Apply `f` to the node with `id`, if present.
  pub fn update(&self, id: &str, f: impl FnOnce(&mut Node)) -> bool {
    match self.lock().get_mut(id) {
      Some(node) => {
        f(node);
        true
      }
      None => false,
    }
  }

  /// Whether both handles point at the same underlying map.
  pub fn shares_with(&self, other: &NodeMap) -> bool {
    Arc::ptr_eq(&self.inner, &other.inner)
  }
}

impl fmt::Debug for NodeMap {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_map()
      .entries(self.snapshot().into_iter().map(|n| (n.id.clone(), n)))
      .finish()
  }
}

impl Serialize for NodeMap {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let ordered: BTreeMap<String, Node> = self
      .snapshot()
      .into_iter()
      .map(|n| (n.id.clone(), n))
      .collect();
    ordered.serialize(serializer)
  }
}

impl<'de> Deserialize<'de> for NodeMap {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let nodes = HashMap::<String, Node>::deserialize(deserializer)?;
    Ok(Self {
      inner: Arc::new(Mutex::new(nodes)),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{NodeRole, Provider};

  fn node(id: &str) -> Node {
    Node::new(id, id, NodeRole::Node, "c-1", Provider::Aws)
  }

  #[test]
  fn test_clones_share_entries() {
    let map = NodeMap::new();
    let clone = map.clone();
    clone.insert(node("n-1"));

    assert!(map.contains("n-1"));
    assert!(map.shares_with(&clone));
  }

  #[test]
  fn test_snapshot_is_sorted() {
    let map = NodeMap::new();
    map.insert(node("b"));
    map.insert(node("a"));
    map.insert(node("c"));

    let ids: Vec<String> = map.snapshot().into_iter().map(|n| n.id).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_for_each_can_reenter() {
    let map = NodeMap::new();
    map.insert(node("a"));
    map.insert(node("b"));

    // Callbacks run without the lock held, so touching the map is fine.
    let mut seen = 0;
    map.for_each(|n| {
      assert!(map.contains(&n.id));
      seen += 1;
    });
    assert_eq!(seen, 2);
  }

  #[test]
  fn test_update() {
    let map = NodeMap::new();
    map.insert(node("a"));

    assert!(map.update("a", |n| n.public_ip = Some("198.51.100.1".into())));
    assert!(!map.update("missing", |_| {}));
    assert_eq!(map.get("a").unwrap().public_ip.as_deref(), Some("198.51.100.1"));
  }

  #[test]
  fn test_serde_round_trip() {
    let map = NodeMap::new();
    map.insert(node("a"));
    map.insert(node("b"));

    let json = serde_json::to_string(&map).unwrap();
    let back: NodeMap = serde_json::from_str(&json).unwrap();

    assert_eq!(back.snapshot(), map.snapshot());
    assert!(!back.shares_with(&map));
  }
}
