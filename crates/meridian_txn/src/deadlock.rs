//! Deadlock detection via wait-for graph (WFG).
//!
//! Each lock owner blocked on a lock held by another owner contributes an
//! edge `waiter → holder`. A cycle through the checking owner is a deadlock;
//! the youngest owner in the cycle (highest id) is the victim.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::lock::LockOwner;

pub struct WaitForGraph {
    /// waiter → owners it waits on.
    edges: Mutex<HashMap<LockOwner, HashSet<LockOwner>>>,
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            edges: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_wait(&self, waiter: LockOwner, holder: LockOwner) {
        if waiter == holder {
            return;
        }
        let mut edges = self.edges.lock();
        edges.entry(waiter).or_default().insert(holder);
    }

    /// Drop every outgoing edge of `waiter` (it stopped waiting).
    pub fn clear_waits_of(&self, waiter: LockOwner) {
        self.edges.lock().remove(&waiter);
    }

    /// Remove an owner entirely, both as waiter and as holder.
    pub fn remove_owner(&self, owner: LockOwner) {
        let mut edges = self.edges.lock();
        edges.remove(&owner);
        for holders in edges.values_mut() {
            holders.remove(&owner);
        }
        edges.retain(|_, h| !h.is_empty());
    }

    /// Any cycle in the graph.
    pub fn detect_cycle(&self) -> Option<Vec<LockOwner>> {
        let edges = self.edges.lock();
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();
        let mut path = Vec::new();
        for &start in edges.keys() {
            if visited.contains(&start) {
                continue;
            }
            if let Some(cycle) = Self::dfs(start, &edges, &mut visited, &mut in_stack, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    /// A cycle that passes through `start`, if one exists.
    pub fn detect_cycle_from(&self, start: LockOwner) -> Option<Vec<LockOwner>> {
        let edges = self.edges.lock();
        let mut visited = HashSet::new();
        let mut in_stack = HashSet::new();
        let mut path = Vec::new();
        let cycle = Self::dfs(start, &edges, &mut visited, &mut in_stack, &mut path)?;
        cycle.contains(&start).then_some(cycle)
    }

    fn dfs(
        node: LockOwner,
        edges: &HashMap<LockOwner, HashSet<LockOwner>>,
        visited: &mut HashSet<LockOwner>,
        in_stack: &mut HashSet<LockOwner>,
        path: &mut Vec<LockOwner>,
    ) -> Option<Vec<LockOwner>> {
        visited.insert(node);
        in_stack.insert(node);
        path.push(node);

        if let Some(holders) = edges.get(&node) {
            let mut next: Vec<LockOwner> = holders.iter().copied().collect();
            next.sort();
            for holder in next {
                if !visited.contains(&holder) {
                    if let Some(cycle) = Self::dfs(holder, edges, visited, in_stack, path) {
                        return Some(cycle);
                    }
                } else if in_stack.contains(&holder) {
                    let cycle_start = match path.iter().position(|&o| o == holder) {
                        Some(pos) => pos,
                        None => {
                            tracing::error!("BUG: owner {} in DFS stack but not in path", holder);
                            return None;
                        }
                    };
                    return Some(path[cycle_start..].to_vec());
                }
            }
        }

        path.pop();
        in_stack.remove(&node);
        None
    }

    /// Youngest (highest id) owner in the cycle.
    pub fn choose_victim(cycle: &[LockOwner]) -> LockOwner {
        debug_assert!(!cycle.is_empty(), "choose_victim called with empty cycle");
        cycle.iter().max().copied().unwrap_or(LockOwner(0))
    }

    pub fn edge_count(&self) -> usize {
        self.edges.lock().values().map(|s| s.len()).sum()
    }
}
