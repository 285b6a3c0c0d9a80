use crate::snapshot::{ThreadId, ThreadSnapshot};
use parking_lot::{Mutex, RwLock};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A directed "waiter waits for owner" relation with its cumulative wait time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitEdge {
    pub waiter: ThreadId,
    pub owner: ThreadId,
    pub wait_ms: u64,
}

/// Serializable point-in-time copy of the graph
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<ThreadId>,
    pub edges: Vec<WaitEdge>,
}

/// A circular wait: every member waits, directly or transitively, on every other
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadlock {
    pub threads: Vec<ThreadId>,
    /// Sum of the edge weights between members of the cycle
    pub total_wait_ms: u64,
}

#[derive(Debug, Default)]
struct DeadBlocks {
    chains: Vec<Vec<ThreadId>>,
    members: HashSet<ThreadId>,
}

#[derive(Default)]
struct Memo<T> {
    generation: u64,
    value: Option<Arc<T>>,
}

impl<T> Memo<T> {
    fn get(&self, generation: u64) -> Option<Arc<T>> {
        match &self.value {
            Some(value) if self.generation == generation => Some(Arc::clone(value)),
            _ => None,
        }
    }

    fn store(&mut self, generation: u64, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.generation = generation;
        self.value = Some(Arc::clone(&value));
        value
    }
}

struct Adjacency {
    graph: DiGraphMap<ThreadId, u64>,
    /// Bumped on every structural mutation; memoized results are tagged with it
    generation: u64,
}

/// Wait-for graph over thread ids.
///
/// Structural mutations take the write side of a single graph-wide lock, and
/// detection passes run under the read side, so a pass never sees a torn
/// adjacency. Cycle and chain results are memoized per graph generation.
pub struct WaitForGraph {
    inner: RwLock<Adjacency>,
    cycles: Mutex<Memo<Vec<Vec<ThreadId>>>>,
    dead_blocks: Mutex<Memo<DeadBlocks>>,
}

impl WaitForGraph {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Adjacency {
                graph: DiGraphMap::new(),
                generation: 0,
            }),
            cycles: Mutex::new(Memo::default()),
            dead_blocks: Mutex::new(Memo::default()),
        }
    }

    /// Idempotent node insertion
    pub fn add_thread(&self, id: ThreadId) {
        let mut inner = self.inner.write();
        if !inner.graph.contains_node(id) {
            inner.graph.add_node(id);
            inner.generation += 1;
        }
    }

    /// Add `duration_ms` to the `src -> dst` edge, creating nodes and edge as needed.
    /// Self-loops are ignored.
    pub fn add_edge(&self, src: ThreadId, dst: ThreadId, duration_ms: u64) {
        if src == dst {
            tracing::debug!("Ignoring self-wait on thread {}", src);
            return;
        }
        let mut inner = self.inner.write();
        accumulate_edge(&mut inner.graph, src, dst, duration_ms);
        inner.generation += 1;
    }

    /// Add a burst of edges, invalidating memoized results once
    pub fn add_edges(&self, edges: impl IntoIterator<Item = WaitEdge>) {
        let mut inner = self.inner.write();
        let mut changed = false;
        for edge in edges {
            if edge.waiter == edge.owner {
                continue;
            }
            accumulate_edge(&mut inner.graph, edge.waiter, edge.owner, edge.wait_ms);
            changed = true;
        }
        if changed {
            inner.generation += 1;
        }
    }

    /// Record the wait relation carried by `curr`, weighted by the time since `prev`.
    ///
    /// Nothing is added unless `curr` waits on a lock with a known owner. The
    /// weight is at least 1 ms so every observed wait is visible.
    pub fn observe(&self, prev: Option<&ThreadSnapshot>, curr: &ThreadSnapshot) -> bool {
        match wait_edge(prev, curr) {
            Some(edge) => {
                self.add_edge(edge.waiter, edge.owner, edge.wait_ms);
                true
            }
            None => false,
        }
    }

    /// Make `curr`'s wait relation the thread's only outgoing edge.
    ///
    /// A wait that continues from the previous sample keeps accumulating; edges
    /// to owners the thread no longer waits on are dropped.
    pub fn update_waits(&self, prev: Option<&ThreadSnapshot>, curr: &ThreadSnapshot) {
        let edge = wait_edge(prev, curr);
        let current_owner = edge.map(|edge| edge.owner);
        let mut inner = self.inner.write();

        let mut changed = false;
        if inner.graph.contains_node(curr.thread_id) {
            let stale: Vec<ThreadId> = inner
                .graph
                .neighbors(curr.thread_id)
                .filter(|owner| Some(*owner) != current_owner)
                .collect();
            for owner in stale {
                inner.graph.remove_edge(curr.thread_id, owner);
                changed = true;
            }
        } else {
            inner.graph.add_node(curr.thread_id);
            changed = true;
        }
        if let Some(edge) = edge {
            accumulate_edge(&mut inner.graph, edge.waiter, edge.owner, edge.wait_ms);
            changed = true;
        }
        if changed {
            inner.generation += 1;
        }
    }

    pub fn remove_edge(&self, src: ThreadId, dst: ThreadId) -> Option<u64> {
        let mut inner = self.inner.write();
        let removed = inner.graph.remove_edge(src, dst);
        if removed.is_some() {
            inner.generation += 1;
        }
        removed
    }

    /// Remove a node together with every edge touching it
    pub fn remove_thread(&self, id: ThreadId) -> bool {
        self.remove_threads(std::iter::once(id)) > 0
    }

    pub fn remove_threads(&self, ids: impl IntoIterator<Item = ThreadId>) -> usize {
        let mut inner = self.inner.write();
        let removed = ids
            .into_iter()
            .filter(|id| inner.graph.remove_node(*id))
            .count();
        if removed > 0 {
            inner.generation += 1;
        }
        removed
    }

    /// Strongly connected components of more than one thread, each sorted,
    /// ordered by their smallest member
    pub fn detect_cycles(&self) -> Vec<Vec<ThreadId>> {
        let inner = self.inner.read();
        self.cycles_of(&inner).as_ref().clone()
    }

    fn cycles_of(&self, inner: &Adjacency) -> Arc<Vec<Vec<ThreadId>>> {
        if let Some(cached) = self.cycles.lock().get(inner.generation) {
            return cached;
        }
        let components = tarjan_cycles(&inner.graph);
        if !components.is_empty() {
            tracing::debug!(
                "Detected {} wait cycle(s) at generation {}",
                components.len(),
                inner.generation
            );
        }
        self.cycles.lock().store(inner.generation, components)
    }

    pub fn has_deadlock(&self) -> bool {
        let inner = self.inner.read();
        !self.cycles_of(&inner).is_empty()
    }

    /// Cycles with the total wait accrued on their internal edges
    pub fn deadlocks(&self) -> Vec<Deadlock> {
        let inner = self.inner.read();
        let cycles = self.cycles_of(&inner);
        let deadlocks = cycles
            .iter()
            .cloned()
            .map(|threads| {
                let members: HashSet<ThreadId> = threads.iter().copied().collect();
                let total_wait_ms = threads
                    .iter()
                    .flat_map(|waiter| inner.graph.edges(*waiter))
                    .filter(|(_, owner, _)| members.contains(owner))
                    .map(|(_, _, weight)| *weight)
                    .sum();
                Deadlock {
                    threads,
                    total_wait_ms,
                }
            })
            .collect();
        deadlocks
    }

    /// Blocking chains found in one pass over the graph.
    ///
    /// Each chain starts at a thread nobody waits on (or, for pure cycles, the
    /// lowest unvisited id) and follows the lowest-id unvisited owner until it
    /// runs out; a chain ending at an already visited thread names it last.
    pub fn get_dead_blocks(&self) -> Vec<Vec<ThreadId>> {
        self.dead_blocks_memo().chains.clone()
    }

    pub fn is_in_blocking_chain(&self, id: ThreadId) -> bool {
        self.dead_blocks_memo().members.contains(&id)
    }

    fn dead_blocks_memo(&self) -> Arc<DeadBlocks> {
        let inner = self.inner.read();
        if let Some(cached) = self.dead_blocks.lock().get(inner.generation) {
            return cached;
        }
        let computed = blocking_chains(&inner.graph);
        self.dead_blocks.lock().store(inner.generation, computed)
    }

    /// Threads currently waiting on someone
    pub fn blocked_threads(&self) -> Vec<ThreadId> {
        self.nodes_with_degree(Direction::Outgoing)
    }

    /// Threads someone is waiting on
    pub fn owner_threads(&self) -> Vec<ThreadId> {
        self.nodes_with_degree(Direction::Incoming)
    }

    fn nodes_with_degree(&self, direction: Direction) -> Vec<ThreadId> {
        let inner = self.inner.read();
        let mut nodes: Vec<ThreadId> = inner
            .graph
            .nodes()
            .filter(|node| {
                inner
                    .graph
                    .neighbors_directed(*node, direction)
                    .next()
                    .is_some()
            })
            .collect();
        nodes.sort_unstable();
        nodes
    }

    pub fn wait_time(&self, src: ThreadId, dst: ThreadId) -> Option<u64> {
        self.inner.read().graph.edge_weight(src, dst).copied()
    }

    /// Total time `id` has spent waiting on any owner
    pub fn total_wait_time(&self, id: ThreadId) -> u64 {
        let inner = self.inner.read();
        if !inner.graph.contains_node(id) {
            return 0;
        }
        inner.graph.edges(id).map(|(_, _, weight)| *weight).sum()
    }

    pub fn contains_thread(&self, id: ThreadId) -> bool {
        self.inner.read().graph.contains_node(id)
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().graph.edge_count()
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        let inner = self.inner.read();
        let mut nodes: Vec<ThreadId> = inner.graph.nodes().collect();
        nodes.sort_unstable();
        let mut edges: Vec<WaitEdge> = inner
            .graph
            .all_edges()
            .map(|(waiter, owner, weight)| WaitEdge {
                waiter,
                owner,
                wait_ms: *weight,
            })
            .collect();
        edges.sort_by_key(|edge| (edge.waiter, edge.owner));
        GraphSnapshot { nodes, edges }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.graph.clear();
        inner.generation += 1;
    }
}

impl Default for WaitForGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WaitForGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot();
        writeln!(
            f,
            "WaitForGraph nodes={} edges={}",
            snapshot.nodes.len(),
            snapshot.edges.len()
        )?;
        for edge in &snapshot.edges {
            writeln!(f, "  {} -> {} ({}ms)", edge.waiter, edge.owner, edge.wait_ms)?;
        }
        Ok(())
    }
}

/// Edge implied by `curr` waiting on an owned lock; weight is the time since `prev`, at least 1
pub fn wait_edge(prev: Option<&ThreadSnapshot>, curr: &ThreadSnapshot) -> Option<WaitEdge> {
    let owner = curr.waiting_on.as_ref()?.owner()?;
    if owner == curr.thread_id {
        return None;
    }
    let elapsed = prev
        .map(|prev| curr.timestamp_ms.saturating_sub(prev.timestamp_ms))
        .unwrap_or(0);
    Some(WaitEdge {
        waiter: curr.thread_id,
        owner,
        wait_ms: elapsed.max(1),
    })
}

fn accumulate_edge(graph: &mut DiGraphMap<ThreadId, u64>, src: ThreadId, dst: ThreadId, weight: u64) {
    match graph.edge_weight_mut(src, dst) {
        Some(existing) => *existing += weight,
        None => {
            graph.add_edge(src, dst, weight);
        }
    }
}

/// Dense, sorted view of the graph for the detection passes
fn indexed(graph: &DiGraphMap<ThreadId, u64>) -> (Vec<ThreadId>, Vec<Vec<usize>>) {
    let mut nodes: Vec<ThreadId> = graph.nodes().collect();
    nodes.sort_unstable();
    let position: HashMap<ThreadId, usize> =
        nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    let adjacency = nodes
        .iter()
        .map(|node| {
            let mut targets: Vec<usize> = graph.neighbors(*node).map(|n| position[&n]).collect();
            targets.sort_unstable();
            targets
        })
        .collect();
    (nodes, adjacency)
}

/// Tarjan's SCC algorithm driven by an explicit frame stack
fn tarjan_cycles(graph: &DiGraphMap<ThreadId, u64>) -> Vec<Vec<ThreadId>> {
    const UNVISITED: usize = usize::MAX;

    let (nodes, adjacency) = indexed(graph);
    let n = nodes.len();
    let mut index = vec![UNVISITED; n];
    let mut lowlink = vec![0usize; n];
    let mut on_stack = vec![false; n];
    let mut scc_stack: Vec<usize> = Vec::new();
    // (node, position of the next successor to visit)
    let mut frames: Vec<(usize, usize)> = Vec::new();
    let mut next_index = 0usize;
    let mut components = Vec::new();

    for root in 0..n {
        if index[root] != UNVISITED {
            continue;
        }
        index[root] = next_index;
        lowlink[root] = next_index;
        next_index += 1;
        scc_stack.push(root);
        on_stack[root] = true;
        frames.push((root, 0));

        while let Some(frame) = frames.last_mut() {
            let v = frame.0;
            if let Some(&w) = adjacency[v].get(frame.1) {
                frame.1 += 1;
                if index[w] == UNVISITED {
                    index[w] = next_index;
                    lowlink[w] = next_index;
                    next_index += 1;
                    scc_stack.push(w);
                    on_stack[w] = true;
                    frames.push((w, 0));
                } else if on_stack[w] {
                    lowlink[v] = lowlink[v].min(index[w]);
                }
                continue;
            }

            frames.pop();
            if let Some(&(parent, _)) = frames.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[v]);
            }
            if lowlink[v] == index[v] {
                let mut component = Vec::new();
                while let Some(w) = scc_stack.pop() {
                    on_stack[w] = false;
                    component.push(nodes[w]);
                    if w == v {
                        break;
                    }
                }
                if component.len() > 1 {
                    component.sort_unstable();
                    components.push(component);
                }
            }
        }
    }

    components.sort();
    components
}

fn blocking_chains(graph: &DiGraphMap<ThreadId, u64>) -> DeadBlocks {
    let (nodes, adjacency) = indexed(graph);
    let mut in_degree = vec![0usize; nodes.len()];
    for targets in &adjacency {
        for target in targets {
            in_degree[*target] += 1;
        }
    }

    let mut members = HashSet::new();
    for (i, targets) in adjacency.iter().enumerate() {
        if !targets.is_empty() {
            members.insert(nodes[i]);
            members.extend(targets.iter().map(|t| nodes[*t]));
        }
    }

    // Chain heads nobody waits on come first so chains are as long as possible
    let starts: Vec<usize> = (0..nodes.len())
        .filter(|i| in_degree[*i] == 0)
        .chain((0..nodes.len()).filter(|i| in_degree[*i] > 0))
        .collect();

    let mut visited = vec![false; nodes.len()];
    let mut chains = Vec::new();
    for start in starts {
        if visited[start] {
            continue;
        }
        let mut chain = vec![nodes[start]];
        visited[start] = true;
        let mut current = start;
        loop {
            let targets = &adjacency[current];
            match targets.iter().find(|t| !visited[**t]) {
                Some(&next) => {
                    visited[next] = true;
                    chain.push(nodes[next]);
                    current = next;
                }
                None => {
                    if let Some(&end) = targets.first() {
                        chain.push(nodes[end]);
                    }
                    break;
                }
            }
        }
        if chain.len() >= 2 {
            chains.push(chain);
        }
    }

    DeadBlocks { chains, members }
}
