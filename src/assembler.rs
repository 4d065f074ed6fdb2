//! Local de Bruijn assembly over one reference window.
//!
//! The graph threads the reference sequence once (vertices and edges marked
//! reference) and every read on top of it; alternate alleles appear as
//! detours ("bubbles") leaving and rejoining the reference path. After
//! pruning weak edges, breaking read-induced cycles and trimming everything
//! that cannot lie on a head-to-tail path, bubbles are scored and extracted
//! as window-relative variants.
//!
//! Vertices live in a slot vector and are referenced by index; k-mers are
//! borrowed views into the reference window and the bin's read sequences, so
//! an `Assembler` never outlives the bin it was built for.

use crate::error::ReasmError;
use crate::variant::AssemblerVariant;
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::BinaryHeap;
use std::collections::VecDeque;
use std::hash::Hasher;
use std::io;

/// Floor transition penalty for reference edges, so a perfectly supported
/// reference continuation is still not free.
const REFERENCE_SCORE_FLOOR: f64 = 1.52587890625e-05; // 2^-16

/// Finite stand-in for `-ln(0)` on unobserved reference edges; keeps the
/// reference spine walkable through uncovered stretches.
const MAX_TRANSITION_SCORE: f64 = 100.0;

/// Edge weights at or below this count as weakly supported when scoring
/// bubble flanks.
const LOW_WEIGHT: u32 = 1;

/// Borrowed k-mer view with a precomputed hash. Does not own its bytes.
#[derive(Debug, Clone, Copy)]
pub struct Kmer<'a> {
    bases: &'a [u8],
    hash: u64,
}

impl<'a> Kmer<'a> {
    fn new(bases: &'a [u8]) -> Self {
        let mut hasher = FxHasher::default();
        hasher.write(bases);
        Kmer {
            bases,
            hash: hasher.finish(),
        }
    }

    pub fn bases(&self) -> &'a [u8] {
        self.bases
    }

    fn back(&self) -> u8 {
        self.bases[self.bases.len() - 1]
    }
}

impl PartialEq for Kmer<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.bases == other.bases
    }
}

impl Eq for Kmer<'_> {}

impl PartialOrd for Kmer<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Kmer<'_> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.bases.cmp(other.bases)
    }
}

impl std::hash::Hash for Kmer<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

type VertexId = usize;

#[derive(Debug)]
struct GraphNode<'a> {
    kmer: Kmer<'a>,
    /// Dense index over alive vertices, regenerated before extraction.
    index: usize,
    /// Window offset for reference vertices, fixed at insertion.
    reference_index: Option<usize>,
    is_reference: bool,
    alive: bool,
}

#[derive(Debug, Clone, Copy)]
struct GraphEdge {
    target: VertexId,
    weight: u32,
    transition_score: f64,
    is_reference: bool,
}

pub struct Assembler<'a> {
    k: usize,
    nodes: Vec<GraphNode<'a>>,
    out_edges: Vec<Vec<GraphEdge>>,
    in_edges: Vec<Vec<VertexId>>,
    vertex_index: FxHashMap<Kmer<'a>, VertexId>,
    /// Window k-mers in order, kept whole even as flanks are popped so
    /// reference bases stay addressable by window offset.
    reference_kmers: Vec<Kmer<'a>>,
    /// Current reference path, head to tail.
    reference_path: VecDeque<VertexId>,
    reference_unique: bool,
    num_alive: usize,
}

struct SubGraph {
    head: VertexId,
    tail: VertexId,
}

impl<'a> Assembler<'a> {
    pub fn new(kmer_size: usize) -> Self {
        assert!(kmer_size > 1, "kmer size must be at least 2");
        Assembler {
            k: kmer_size,
            nodes: Vec::new(),
            out_edges: Vec::new(),
            in_edges: Vec::new(),
            vertex_index: FxHashMap::default(),
            reference_kmers: Vec::new(),
            reference_path: VecDeque::new(),
            reference_unique: true,
            num_alive: 0,
        }
    }

    pub fn kmer_size(&self) -> usize {
        self.k
    }

    pub fn num_kmers(&self) -> usize {
        self.num_alive
    }

    pub fn is_empty(&self) -> bool {
        self.num_alive == 0
    }

    /// True when a reference was inserted and no window k-mer repeated.
    pub fn is_unique_reference(&self) -> bool {
        self.reference_unique && !self.reference_kmers.is_empty()
    }

    pub fn is_all_reference(&self) -> bool {
        self.nodes.iter().all(|n| !n.alive || n.is_reference)
    }

    /// Thread the reference window. The graph must not already hold one;
    /// a repeated window k-mer marks the graph unusable.
    pub fn insert_reference(&mut self, sequence: &'a [u8]) {
        assert!(
            self.reference_kmers.is_empty(),
            "reference already inserted"
        );
        if sequence.len() < self.k {
            return;
        }
        let mut prev: Option<VertexId> = None;
        for (offset, window) in sequence.windows(self.k).enumerate() {
            let kmer = Kmer::new(window);
            if self.vertex_index.contains_key(&kmer) {
                self.reference_unique = false;
                return;
            }
            let v = self.add_vertex(kmer, Some(offset));
            self.reference_kmers.push(kmer);
            self.reference_path.push_back(v);
            if let Some(u) = prev {
                self.add_edge(u, v, 0, true);
            }
            prev = Some(v);
        }
    }

    /// Thread one read. Sequences shorter than `k` contribute nothing.
    pub fn insert_read(&mut self, sequence: &'a [u8]) {
        if sequence.len() < self.k {
            return;
        }
        let mut prev: Option<VertexId> = None;
        for window in sequence.windows(self.k) {
            let kmer = Kmer::new(window);
            let v = match self.vertex_index.get(&kmer) {
                Some(&v) => v,
                None => self.add_vertex(kmer, None),
            };
            if let Some(u) = prev {
                match self.find_edge_mut(u, v) {
                    Some(edge) => edge.weight += 1,
                    None => self.add_edge(u, v, 1, false),
                }
            }
            prev = Some(v);
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.out_edges.clear();
        self.in_edges.clear();
        self.vertex_index.clear();
        self.reference_kmers.clear();
        self.reference_path.clear();
        self.reference_unique = true;
        self.num_alive = 0;
    }

    // --- vertex and edge primitives ---

    fn add_vertex(&mut self, kmer: Kmer<'a>, reference_index: Option<usize>) -> VertexId {
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            kmer,
            index: id,
            reference_index,
            is_reference: reference_index.is_some(),
            alive: true,
        });
        self.out_edges.push(Vec::new());
        self.in_edges.push(Vec::new());
        self.vertex_index.insert(kmer, id);
        self.num_alive += 1;
        id
    }

    fn remove_vertex(&mut self, v: VertexId) {
        debug_assert!(self.nodes[v].alive);
        let targets: Vec<VertexId> = self.out_edges[v].iter().map(|e| e.target).collect();
        for t in targets {
            self.in_edges[t].retain(|&s| s != v);
        }
        let sources = std::mem::take(&mut self.in_edges[v]);
        for s in sources {
            self.out_edges[s].retain(|e| e.target != v);
        }
        self.out_edges[v].clear();
        let kmer = self.nodes[v].kmer;
        self.vertex_index.remove(&kmer);
        self.nodes[v].alive = false;
        self.num_alive -= 1;
    }

    fn add_edge(&mut self, u: VertexId, v: VertexId, weight: u32, is_reference: bool) {
        debug_assert!(self.find_edge(u, v).is_none(), "parallel edge");
        self.out_edges[u].push(GraphEdge {
            target: v,
            weight,
            transition_score: 0.0,
            is_reference,
        });
        self.in_edges[v].push(u);
    }

    fn find_edge(&self, u: VertexId, v: VertexId) -> Option<&GraphEdge> {
        self.out_edges[u].iter().find(|e| e.target == v)
    }

    fn find_edge_mut(&mut self, u: VertexId, v: VertexId) -> Option<&mut GraphEdge> {
        self.out_edges[u].iter_mut().find(|e| e.target == v)
    }

    fn alive_vertices(&self) -> impl Iterator<Item = VertexId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.alive)
            .map(|(id, _)| id)
    }

    fn degree(&self, v: VertexId) -> usize {
        self.out_edges[v].len() + self.in_edges[v].len()
    }

    fn reference_head(&self) -> Option<VertexId> {
        self.reference_path.front().copied()
    }

    fn reference_tail(&self) -> Option<VertexId> {
        self.reference_path.back().copied()
    }

    // --- graph conditioning ---

    /// Bridge non-reference dead ends back onto the reference path where the
    /// de Bruijn overlap allows it, so alternate alleles cut short by read
    /// boundaries still form closed bubbles.
    pub fn try_recover_dangling_branches(&mut self) {
        let tips: Vec<VertexId> = self
            .alive_vertices()
            .filter(|&v| !self.nodes[v].is_reference && self.out_edges[v].is_empty())
            .collect();
        for tip in tips {
            if let Some(joined) = self.find_joining_vertex(tip) {
                self.add_edge(tip, joined, 1, false);
            }
        }
    }

    /// First reference vertex whose k-mer extends the tip by one base.
    fn find_joining_vertex(&self, tip: VertexId) -> Option<VertexId> {
        let suffix = &self.nodes[tip].kmer.bases()[1..];
        self.reference_path
            .iter()
            .copied()
            .find(|&r| &self.nodes[r].kmer.bases()[..self.k - 1] == suffix)
    }

    /// Drop non-reference edges observed fewer than `min_weight` times, then
    /// any vertex left fully disconnected.
    pub fn prune(&mut self, min_weight: u32) {
        for v in 0..self.nodes.len() {
            if !self.nodes[v].alive {
                continue;
            }
            let removed: Vec<VertexId> = self.out_edges[v]
                .iter()
                .filter(|e| !e.is_reference && e.weight < min_weight)
                .map(|e| e.target)
                .collect();
            if removed.is_empty() {
                continue;
            }
            self.out_edges[v].retain(|e| e.is_reference || e.weight >= min_weight);
            for t in removed {
                self.in_edges[t].retain(|&s| s != v);
            }
        }
        self.remove_disconnected_vertices();
    }

    fn remove_disconnected_vertices(&mut self) {
        let disconnected: Vec<VertexId> = self
            .alive_vertices()
            .filter(|&v| !self.nodes[v].is_reference && self.degree(v) == 0)
            .collect();
        for v in disconnected {
            self.remove_vertex(v);
        }
    }

    /// Three-colour DFS over all alive vertices.
    pub fn is_acyclic(&self) -> bool {
        const WHITE: u8 = 0;
        const GREY: u8 = 1;
        const BLACK: u8 = 2;
        let mut colour = vec![WHITE; self.nodes.len()];
        for root in self.alive_vertices() {
            if colour[root] != WHITE {
                continue;
            }
            let mut stack: Vec<(VertexId, usize)> = vec![(root, 0)];
            colour[root] = GREY;
            while let Some(&mut (v, ref mut next)) = stack.last_mut() {
                if *next < self.out_edges[v].len() {
                    let w = self.out_edges[v][*next].target;
                    *next += 1;
                    match colour[w] {
                        WHITE => {
                            colour[w] = GREY;
                            stack.push((w, 0));
                        }
                        GREY => return false,
                        _ => {}
                    }
                } else {
                    colour[v] = BLACK;
                    stack.pop();
                }
            }
        }
        true
    }

    /// Break every cycle by deleting the non-reference edges of each
    /// non-trivial strongly connected component. The reference path itself
    /// is simple, so it always survives.
    pub fn remove_nonreference_cycles(&mut self) {
        let components = self.strongly_connected_components();
        let mut member = vec![usize::MAX; self.nodes.len()];
        for (id, component) in components.iter().enumerate() {
            for &v in component {
                member[v] = id;
            }
        }
        for component in &components {
            let cyclic = component.len() > 1
                || component
                    .iter()
                    .any(|&v| self.find_edge(v, v).is_some());
            if !cyclic {
                continue;
            }
            for &v in component {
                let internal: Vec<VertexId> = self.out_edges[v]
                    .iter()
                    .filter(|e| !e.is_reference && member[e.target] == member[v])
                    .map(|e| e.target)
                    .collect();
                if internal.is_empty() {
                    continue;
                }
                self.out_edges[v].retain(|e| e.is_reference || member[e.target] != member[v]);
                for t in internal {
                    self.in_edges[t].retain(|&s| s != v);
                }
            }
        }
        self.remove_disconnected_vertices();
        debug_assert!(self.is_acyclic(), "cycle removal left a cycle");
    }

    /// Iterative Tarjan over alive vertices.
    fn strongly_connected_components(&self) -> Vec<Vec<VertexId>> {
        const UNVISITED: usize = usize::MAX;
        let n = self.nodes.len();
        let mut next_index = 0usize;
        let mut indices = vec![UNVISITED; n];
        let mut lowlink = vec![0usize; n];
        let mut on_stack = vec![false; n];
        let mut stack: Vec<VertexId> = Vec::new();
        let mut components: Vec<Vec<VertexId>> = Vec::new();

        for root in self.alive_vertices() {
            if indices[root] != UNVISITED {
                continue;
            }
            let mut frames: Vec<(VertexId, usize)> = vec![(root, 0)];
            indices[root] = next_index;
            lowlink[root] = next_index;
            next_index += 1;
            stack.push(root);
            on_stack[root] = true;
            while let Some(&mut (v, ref mut next)) = frames.last_mut() {
                if *next < self.out_edges[v].len() {
                    let w = self.out_edges[v][*next].target;
                    *next += 1;
                    if indices[w] == UNVISITED {
                        indices[w] = next_index;
                        lowlink[w] = next_index;
                        next_index += 1;
                        stack.push(w);
                        on_stack[w] = true;
                        frames.push((w, 0));
                    } else if on_stack[w] {
                        lowlink[v] = lowlink[v].min(indices[w]);
                    }
                } else {
                    frames.pop();
                    if let Some(&(parent, _)) = frames.last() {
                        lowlink[parent] = lowlink[parent].min(lowlink[v]);
                    }
                    if lowlink[v] == indices[v] {
                        let mut component = Vec::new();
                        loop {
                            let w = stack.pop().unwrap();
                            on_stack[w] = false;
                            component.push(w);
                            if w == v {
                                break;
                            }
                        }
                        components.push(component);
                    }
                }
            }
        }
        components
    }

    /// Restrict the graph to vertices lying on some head-to-tail path and
    /// pop uninformative reference flanks. Idempotent.
    pub fn cleanup(&mut self) {
        let (head, tail) = match (self.reference_head(), self.reference_tail()) {
            (Some(h), Some(t)) => (h, t),
            _ => return,
        };
        self.remove_vertices_not_reachable_from(head);
        self.remove_vertices_that_cannot_reach(tail);
        self.prune_reference_flanks();
        self.regenerate_vertex_indices();
    }

    fn remove_vertices_not_reachable_from(&mut self, from: VertexId) {
        let reachable = self.reachable_forward(from);
        let doomed: Vec<VertexId> = self
            .alive_vertices()
            .filter(|&v| !reachable[v])
            .collect();
        for v in doomed {
            self.remove_vertex(v);
        }
    }

    fn remove_vertices_that_cannot_reach(&mut self, to: VertexId) {
        let mut reaching = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([to]);
        reaching[to] = true;
        while let Some(v) = queue.pop_front() {
            for &s in &self.in_edges[v] {
                if !reaching[s] {
                    reaching[s] = true;
                    queue.push_back(s);
                }
            }
        }
        let doomed: Vec<VertexId> = self.alive_vertices().filter(|&v| !reaching[v]).collect();
        for v in doomed {
            self.remove_vertex(v);
        }
    }

    fn reachable_forward(&self, from: VertexId) -> Vec<bool> {
        let mut reachable = vec![false; self.nodes.len()];
        let mut queue = VecDeque::from([from]);
        reachable[from] = true;
        while let Some(v) = queue.pop_front() {
            for e in &self.out_edges[v] {
                if !reachable[e.target] {
                    reachable[e.target] = true;
                    queue.push_back(e.target);
                }
            }
        }
        reachable
    }

    /// Pop reference vertices off both ends while they are plain bridges,
    /// stopping at the first bifurcation.
    fn prune_reference_flanks(&mut self) {
        while self.reference_path.len() > 1 {
            let head = self.reference_path[0];
            let next = self.reference_path[1];
            if self.out_edges[head].len() == 1
                && self.in_edges[head].is_empty()
                && self.in_edges[next].len() == 1
            {
                self.reference_path.pop_front();
                self.remove_vertex(head);
            } else {
                break;
            }
        }
        while self.reference_path.len() > 1 {
            let tail = self.reference_path[self.reference_path.len() - 1];
            let prev = self.reference_path[self.reference_path.len() - 2];
            if self.in_edges[tail].len() == 1
                && self.out_edges[tail].is_empty()
                && self.out_edges[prev].len() == 1
            {
                self.reference_path.pop_back();
                self.remove_vertex(tail);
            } else {
                break;
            }
        }
    }

    fn regenerate_vertex_indices(&mut self) {
        let mut next = 0usize;
        for node in self.nodes.iter_mut() {
            if node.alive {
                node.index = next;
                next += 1;
            }
        }
    }

    // --- bubble extraction ---

    /// Extract up to `max_bubbles` variants per independent subgraph, best
    /// supported first. Consumes transition-score state; call once per
    /// conditioned graph.
    pub fn extract_variants(
        &mut self,
        max_bubbles: u32,
        min_bubble_score: f64,
    ) -> Result<Vec<AssemblerVariant>, ReasmError> {
        if !self.is_unique_reference() || self.is_empty() || self.reference_path.len() < 2 {
            return Ok(Vec::new());
        }
        debug_assert!(self.is_acyclic(), "extracting variants from a cyclic graph");
        self.regenerate_vertex_indices();
        self.set_all_transition_scores();
        let subgraphs = self.find_independent_subgraphs()?;
        let mut result = Vec::new();
        for subgraph in subgraphs {
            self.extract_subgraph_bubbles(&subgraph, max_bubbles, min_bubble_score, &mut result)?;
        }
        Ok(result)
    }

    fn set_all_transition_scores(&mut self) {
        for v in 0..self.nodes.len() {
            if !self.nodes[v].alive {
                continue;
            }
            let total: u64 = self.out_edges[v].iter().map(|e| e.weight as u64).sum();
            for edge in self.out_edges[v].iter_mut() {
                let mut score = if edge.weight == 0 || total == 0 {
                    MAX_TRANSITION_SCORE
                } else {
                    -((edge.weight as f64 / total as f64).ln())
                };
                if edge.is_reference {
                    score = score.clamp(REFERENCE_SCORE_FLOOR, MAX_TRANSITION_SCORE);
                }
                edge.transition_score = score;
            }
        }
    }

    /// Split the graph at the reference vertices every head-to-tail path
    /// must cross, so each bubble cluster gets its own extraction budget.
    fn find_independent_subgraphs(&self) -> Result<Vec<SubGraph>, ReasmError> {
        let head = self.reference_head().expect("non-empty reference path");
        let tail = self.reference_tail().expect("non-empty reference path");
        let idom = self.build_dominator_tree(head);
        // Dominators of the tail are exactly the tail's idom chain
        let mut cuts = vec![false; self.nodes.len()];
        let mut v = tail;
        loop {
            cuts[v] = true;
            if v == head {
                break;
            }
            v = idom[v].ok_or_else(|| {
                ReasmError::InternalInvariant(
                    "dominator chain from reference tail does not reach the head".to_string(),
                )
            })?;
        }
        let cut_path: Vec<VertexId> = self
            .reference_path
            .iter()
            .copied()
            .filter(|&r| cuts[r])
            .collect();
        Ok(cut_path
            .windows(2)
            .map(|pair| SubGraph {
                head: pair[0],
                tail: pair[1],
            })
            .collect())
    }

    /// Immediate dominators per vertex id (Cooper–Harvey–Kennedy over the
    /// reverse postorder of the dense indices).
    fn build_dominator_tree(&self, root: VertexId) -> Vec<Option<VertexId>> {
        let rpo = self.reverse_postorder(root);
        let mut rpo_position = vec![usize::MAX; self.nodes.len()];
        for (position, &v) in rpo.iter().enumerate() {
            rpo_position[v] = position;
        }
        let mut idom: Vec<Option<VertexId>> = vec![None; self.nodes.len()];
        idom[root] = Some(root);
        let mut changed = true;
        while changed {
            changed = false;
            for &v in rpo.iter().skip(1) {
                let mut new_idom: Option<VertexId> = None;
                for &p in &self.in_edges[v] {
                    if idom[p].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => p,
                        Some(current) => {
                            self.intersect_dominators(p, current, &idom, &rpo_position)
                        }
                    });
                }
                if new_idom.is_some() && idom[v] != new_idom {
                    idom[v] = new_idom;
                    changed = true;
                }
            }
        }
        idom
    }

    fn intersect_dominators(
        &self,
        mut a: VertexId,
        mut b: VertexId,
        idom: &[Option<VertexId>],
        rpo_position: &[usize],
    ) -> VertexId {
        while a != b {
            while rpo_position[a] > rpo_position[b] {
                a = idom[a].expect("processed vertex has a dominator");
            }
            while rpo_position[b] > rpo_position[a] {
                b = idom[b].expect("processed vertex has a dominator");
            }
        }
        a
    }

    fn reverse_postorder(&self, root: VertexId) -> Vec<VertexId> {
        let mut order = Vec::with_capacity(self.num_alive);
        let mut visited = vec![false; self.nodes.len()];
        let mut stack: Vec<(VertexId, usize)> = vec![(root, 0)];
        visited[root] = true;
        while let Some(&mut (v, ref mut next)) = stack.last_mut() {
            if *next < self.out_edges[v].len() {
                let w = self.out_edges[v][*next].target;
                *next += 1;
                if !visited[w] {
                    visited[w] = true;
                    stack.push((w, 0));
                }
            } else {
                order.push(v);
                stack.pop();
            }
        }
        order.reverse();
        order
    }

    fn extract_subgraph_bubbles(
        &mut self,
        subgraph: &SubGraph,
        max_bubbles: u32,
        min_bubble_score: f64,
        result: &mut Vec<AssemblerVariant>,
    ) -> Result<(), ReasmError> {
        let mut rounds = 0;
        while rounds < max_bubbles {
            let path = match self.shortest_scoring_path(subgraph.head, subgraph.tail) {
                Some(path) => path,
                None => break,
            };
            if self.is_pure_reference_path(&path) {
                break;
            }
            self.emit_path_bubbles(&path, min_bubble_score, result)?;
            self.block_nonreference_path_edges(&path);
            rounds += 1;
        }
        Ok(())
    }

    fn is_pure_reference_path(&self, path: &[VertexId]) -> bool {
        path.iter().all(|&v| self.nodes[v].is_reference)
            && path.windows(2).all(|pair| {
                let (a, b) = (pair[0], pair[1]);
                self.reference_offset(b) == self.reference_offset(a).map(|offset| offset + 1)
            })
    }

    fn reference_offset(&self, v: VertexId) -> Option<usize> {
        self.nodes[v].reference_index
    }

    /// Lowest transition-score path, deterministic under score ties.
    fn shortest_scoring_path(&self, from: VertexId, to: VertexId) -> Option<Vec<VertexId>> {
        #[derive(PartialEq)]
        struct Entry(f64, usize, VertexId);
        impl Eq for Entry {}
        impl PartialOrd for Entry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Entry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                // min-heap over (score, dense index)
                other
                    .0
                    .partial_cmp(&self.0)
                    .expect("transition scores are never NaN")
                    .then(other.1.cmp(&self.1))
            }
        }

        let mut best: FxHashMap<VertexId, f64> = FxHashMap::default();
        let mut predecessor: FxHashMap<VertexId, VertexId> = FxHashMap::default();
        let mut heap = BinaryHeap::new();
        best.insert(from, 0.0);
        heap.push(Entry(0.0, self.nodes[from].index, from));
        while let Some(Entry(score, _, v)) = heap.pop() {
            if v == to {
                break;
            }
            if score > best.get(&v).copied().unwrap_or(f64::INFINITY) {
                continue;
            }
            for edge in &self.out_edges[v] {
                if edge.transition_score.is_infinite() {
                    continue;
                }
                let candidate = score + edge.transition_score;
                if candidate < best.get(&edge.target).copied().unwrap_or(f64::INFINITY) {
                    best.insert(edge.target, candidate);
                    predecessor.insert(edge.target, v);
                    heap.push(Entry(candidate, self.nodes[edge.target].index, edge.target));
                }
            }
        }
        if !best.contains_key(&to) {
            return None;
        }
        let mut path = vec![to];
        let mut v = to;
        while v != from {
            v = *predecessor.get(&v)?;
            path.push(v);
        }
        path.reverse();
        Some(path)
    }

    /// One bubble per maximal non-reference stretch (or reference shortcut)
    /// on the path.
    fn emit_path_bubbles(
        &self,
        path: &[VertexId],
        min_bubble_score: f64,
        result: &mut Vec<AssemblerVariant>,
    ) -> Result<(), ReasmError> {
        let mut i = 0;
        while i + 1 < path.len() {
            debug_assert!(self.nodes[path[i]].is_reference);
            let mut j = i + 1;
            while !self.nodes[path[j]].is_reference {
                j += 1;
                if j == path.len() {
                    return Err(ReasmError::InternalInvariant(
                        "bubble path ends off the reference".to_string(),
                    ));
                }
            }
            let source = path[i];
            let sink = path[j];
            let source_offset = self.reference_offset(source).ok_or_else(|| {
                ReasmError::InternalInvariant("bubble source is not on the reference".to_string())
            })?;
            let sink_offset = self.reference_offset(sink).ok_or_else(|| {
                ReasmError::InternalInvariant("bubble sink is not on the reference".to_string())
            })?;
            let run = &path[i + 1..j];
            if !run.is_empty() || sink_offset != source_offset + 1 {
                if sink_offset <= source_offset {
                    return Err(ReasmError::InternalInvariant(
                        "bubble sink precedes its source on the reference".to_string(),
                    ));
                }
                if self.bubble_score(&path[i..=j]) >= min_bubble_score {
                    let ref_allele: Vec<u8> = (source_offset + 1..=sink_offset)
                        .map(|offset| self.reference_kmers[offset].back())
                        .collect();
                    let mut alt_allele: Vec<u8> =
                        run.iter().map(|&v| self.nodes[v].kmer.back()).collect();
                    alt_allele.push(self.nodes[sink].kmer.back());
                    result.push(AssemblerVariant::new(
                        source_offset + self.k,
                        ref_allele,
                        alt_allele,
                    ));
                }
            }
            i = j;
        }
        Ok(())
    }

    /// Mean edge weight across the bubble, halved per weakly supported
    /// flank. This is the read support `min_bubble_score` is compared to.
    fn bubble_score(&self, bubble: &[VertexId]) -> f64 {
        let weights: Vec<u32> = bubble
            .windows(2)
            .map(|pair| {
                self.find_edge(pair[0], pair[1])
                    .map(|e| e.weight)
                    .unwrap_or(0)
            })
            .collect();
        if weights.is_empty() {
            return 0.0;
        }
        let mean = weights.iter().map(|&w| w as f64).sum::<f64>() / weights.len() as f64;
        let mut score = mean;
        if weights[0] <= LOW_WEIGHT {
            score /= 2.0;
        }
        if weights.len() > 1 && *weights.last().unwrap() <= LOW_WEIGHT {
            score /= 2.0;
        }
        score
    }

    fn block_nonreference_path_edges(&mut self, path: &[VertexId]) {
        for pair in path.windows(2) {
            if let Some(edge) = self.find_edge_mut(pair[0], pair[1]) {
                if !edge.is_reference {
                    edge.transition_score = f64::INFINITY;
                }
            }
        }
    }

    /// Graphviz dump for debugging; reference vertices are boxes.
    pub fn write_dot<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "digraph kmers {{")?;
        for v in self.alive_vertices() {
            let node = &self.nodes[v];
            let shape = if node.is_reference { ",shape=box" } else { "" };
            writeln!(
                out,
                "  v{} [label=\"{}\"{}];",
                node.index,
                String::from_utf8_lossy(node.kmer.bases()),
                shape
            )?;
        }
        for v in self.alive_vertices() {
            for edge in &self.out_edges[v] {
                let style = if edge.is_reference { ",style=bold" } else { "" };
                writeln!(
                    out,
                    "  v{} -> v{} [label=\"{}\"{}];",
                    self.nodes[v].index, self.nodes[edge.target].index, edge.weight, style
                )?;
            }
        }
        writeln!(out, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::{normalise, DecompositionLimits};

    // Every 4-mer of this sequence is unique
    const REFERENCE: &[u8] = b"ACGGTCAGTTGCATCCATGG";

    fn conditioned(reference: &[u8], reads: &[&'static [u8]], min_weight: u32) -> Assembler<'static> {
        let mut assembler = Assembler::new(4);
        // Tests use 'static data so the assembler can be returned
        let reference: &'static [u8] = Box::leak(reference.to_vec().into_boxed_slice());
        assembler.insert_reference(reference);
        assert!(assembler.is_unique_reference());
        for &read in reads {
            assembler.insert_read(read);
        }
        assembler.try_recover_dangling_branches();
        assembler.prune(min_weight);
        if !assembler.is_acyclic() {
            assembler.remove_nonreference_cycles();
        }
        assembler.cleanup();
        assembler
    }

    fn extract_normalised(assembler: &mut Assembler<'_>) -> Vec<AssemblerVariant> {
        let mut variants = assembler.extract_variants(10, 0.0).unwrap();
        normalise(&mut variants, &DecompositionLimits::default());
        variants
    }

    #[test]
    fn test_reference_round_trip_is_empty() {
        let reads: Vec<&[u8]> = vec![REFERENCE; 4];
        let mut assembler = conditioned(REFERENCE, &reads, 2);
        assert!(assembler.is_all_reference());
        assert!(assembler.extract_variants(10, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_nonunique_reference_fails_without_panic() {
        let mut assembler = Assembler::new(4);
        // ACGT repeats
        assembler.insert_reference(b"ACGTACGT");
        assert!(!assembler.is_unique_reference());
        assert!(assembler.extract_variants(10, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_window_shorter_than_k_is_empty_reference() {
        let mut assembler = Assembler::new(4);
        assembler.insert_reference(b"ACG");
        assert!(!assembler.is_unique_reference());
        assert!(assembler.is_empty());
    }

    #[test]
    fn test_snv_bubble() {
        // C->A at offset 5
        let reads: Vec<&[u8]> = vec![b"ACGGTAAGTTGC"; 3];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 2);
        let variants = extract_normalised(&mut assembler);
        assert_eq!(variants, vec![AssemblerVariant::new(5, *b"C", *b"A")]);
    }

    #[test]
    fn test_deletion_bubble() {
        // C at offset 5 deleted
        let reads: Vec<&[u8]> = vec![b"ACGGTAGTTGC"; 3];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 2);
        let variants = extract_normalised(&mut assembler);
        assert_eq!(variants, vec![AssemblerVariant::new(5, *b"C", *b"")]);
    }

    #[test]
    fn test_insertion_bubble() {
        // A inserted after offset 5
        let reads: Vec<&[u8]> = vec![b"ACGGTCAAGTTGC"; 3];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 2);
        let variants = extract_normalised(&mut assembler);
        assert_eq!(variants, vec![AssemblerVariant::new(7, *b"", *b"A")]);
    }

    #[test]
    fn test_low_weight_bubble_is_pruned() {
        let reads: Vec<&[u8]> = vec![b"ACGGTAAGTTGC"];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 2);
        // One observation against min weight 2: the detour is gone
        assert!(assembler.is_all_reference());
        assert!(extract_normalised(&mut assembler).is_empty());
    }

    #[test]
    fn test_bubble_score_threshold_discards_weak_support() {
        let reads: Vec<&[u8]> = vec![b"ACGGTAAGTTGC"; 3];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 2);
        let variants = assembler.extract_variants(10, 100.0).unwrap();
        assert!(variants.is_empty());
    }

    #[test]
    fn test_independent_subgraphs_have_local_budgets() {
        // Two well separated SNVs; max_bubbles = 1 still finds both because
        // the dominator cuts give each cluster its own budget
        let mut reads: Vec<&[u8]> = vec![b"ACGGTAAGTTGC"; 3]; // C->A at 5
        reads.extend(std::iter::repeat(b"TTGCAGCCATGG" as &[u8]).take(3)); // T->G at 13
        let mut assembler = conditioned(REFERENCE, &reads, 2);
        let mut variants = assembler.extract_variants(1, 0.0).unwrap();
        normalise(&mut variants, &DecompositionLimits::default());
        assert_eq!(
            variants,
            vec![
                AssemblerVariant::new(5, *b"C", *b"A"),
                AssemblerVariant::new(13, *b"T", *b"G"),
            ]
        );
    }

    #[test]
    fn test_dangling_branch_recovery_closes_bubble() {
        // Read carries an inserted A after the leading ACGG and then stops
        // before rejoining the reference; the bridge edge closes the bubble
        let reads: Vec<&[u8]> = vec![b"ACGGATCA"; 2];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 1);
        let variants = extract_normalised(&mut assembler);
        assert_eq!(variants, vec![AssemblerVariant::new(4, *b"", *b"A")]);
    }

    #[test]
    fn test_cycle_removal_leaves_acyclic_graph() {
        let mut assembler = Assembler::new(4);
        assembler.insert_reference(&REFERENCE[..12]);
        // GTCA -> TCAG -> CAGT -> AGTC -> GTCA is a cycle
        for _ in 0..3 {
            assembler.insert_read(b"GTCAGTCAGT");
        }
        assembler.try_recover_dangling_branches();
        assembler.prune(2);
        assert!(!assembler.is_acyclic());
        assembler.remove_nonreference_cycles();
        assert!(assembler.is_acyclic());
        assembler.cleanup();
        assert!(assembler.extract_variants(10, 0.0).unwrap().is_empty());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let reads: Vec<&[u8]> = vec![b"ACGGTAAGTTGC"; 3];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 2);
        let kmers_after_one = assembler.num_kmers();
        let path_after_one = assembler.reference_path.len();
        assembler.cleanup();
        assert_eq!(assembler.num_kmers(), kmers_after_one);
        assert_eq!(assembler.reference_path.len(), path_after_one);
    }

    #[test]
    fn test_dominator_tree_diamond() {
        // Fork at CGGT: both branch interiors are dominated by the fork, so
        // only the fork and the join survive as cut vertices
        let reads: Vec<&[u8]> = vec![b"ACGGTAAGTTGC"; 3];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 2);
        assembler.regenerate_vertex_indices();
        let head = assembler.reference_head().unwrap();
        let idom = assembler.build_dominator_tree(head);
        for v in assembler.alive_vertices() {
            if v != head {
                assert!(idom[v].is_some(), "vertex {} has no dominator", v);
            }
        }
        let subgraphs = assembler.find_independent_subgraphs().unwrap();
        // Bubble spans CGGT(1) .. AGTT(6): no reference vertex strictly
        // inside it can be a cut
        for subgraph in &subgraphs {
            let head_offset = assembler.reference_offset(subgraph.head).unwrap();
            assert!(!(2..=5).contains(&head_offset));
        }
    }

    #[test]
    fn test_clear_resets_state() {
        let reads: Vec<&[u8]> = vec![b"ACGGTAAGTTGC"; 3];
        let mut assembler = conditioned(&REFERENCE[..12], &reads, 2);
        assembler.clear();
        assert!(assembler.is_empty());
        assert!(!assembler.is_unique_reference());
        assert_eq!(assembler.num_kmers(), 0);
    }

    #[test]
    fn test_write_dot_shape() {
        let reads: Vec<&[u8]> = vec![b"ACGGTAAGTTGC"; 3];
        let assembler = conditioned(&REFERENCE[..12], &reads, 2);
        let mut out = Vec::new();
        assembler.write_dot(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("digraph"));
        assert!(text.contains("shape=box"));
        assert!(text.trim_end().ends_with('}'));
    }
}
