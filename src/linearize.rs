//! Block linearization.
//!
//! Orders the basic blocks of a graph into the total order the rest of the
//! backend works over: every block's immediate dominator appears before it,
//! all blocks of a natural loop are contiguous with the header first, and
//! the entry block comes first. Lifetime analysis depends on this order to
//! treat positions as a flat axis.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::ir::{BlockId, Graph};

// --- Control-flow graph ---

/// Control-flow graph over the reachable blocks of a procedure, excluding
/// the end block (which holds only the `End` node and emits no code).
pub struct Cfg {
    entry: BlockId,
    blocks: Vec<BlockId>,
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
    index_map: HashMap<BlockId, usize>,
}

impl Cfg {
    pub fn new(graph: &Graph) -> Self {
        // Collect reachable blocks by DFS on successor edges.
        let mut reachable = Vec::new();
        let mut seen = BTreeSet::new();
        let mut stack = vec![graph.entry];
        while let Some(block) = stack.pop() {
            if block == graph.end_block || !seen.insert(block) {
                continue;
            }
            reachable.push(block);
            for succ in graph.succ_blocks(block) {
                stack.push(succ);
            }
        }
        reachable.sort();

        let mut index_map = HashMap::with_capacity(reachable.len());
        for (idx, block) in reachable.iter().enumerate() {
            index_map.insert(*block, idx);
        }

        let mut preds = vec![Vec::new(); reachable.len()];
        let mut succs = vec![Vec::new(); reachable.len()];
        for (idx, block) in reachable.iter().enumerate() {
            for succ in graph.succ_blocks(*block) {
                let Some(&succ_idx) = index_map.get(&succ) else {
                    continue; // end block
                };
                succs[idx].push(succ_idx);
                preds[succ_idx].push(idx);
            }
        }

        Self {
            entry: graph.entry,
            blocks: reachable,
            preds,
            succs,
            index_map,
        }
    }

    pub fn entry_index(&self) -> usize {
        self.index_map[&self.entry]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block_at(&self, idx: usize) -> BlockId {
        self.blocks[idx]
    }

    pub fn preds(&self, idx: usize) -> &[usize] {
        &self.preds[idx]
    }

    pub fn succs(&self, idx: usize) -> &[usize] {
        &self.succs[idx]
    }

    /// Reverse postorder starting at the entry block.
    pub fn rpo(&self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.len());
        let mut visited = vec![false; self.len()];
        self.postorder(self.entry_index(), &mut visited, &mut order);
        order.reverse();
        order
    }

    fn postorder(&self, idx: usize, visited: &mut [bool], order: &mut Vec<usize>) {
        if visited[idx] {
            return;
        }
        visited[idx] = true;
        for succ in &self.succs[idx] {
            self.postorder(*succ, visited, order);
        }
        order.push(idx);
    }
}

// --- Dominators ---

/// Immediate dominators, computed by the standard iterative scheme over
/// reverse postorder.
pub struct Dominators {
    idom: Vec<usize>,
    rpo_number: Vec<usize>,
}

impl Dominators {
    pub fn compute(cfg: &Cfg) -> Self {
        let rpo = cfg.rpo();
        let mut rpo_number = vec![usize::MAX; cfg.len()];
        for (number, idx) in rpo.iter().enumerate() {
            rpo_number[*idx] = number;
        }

        let entry = cfg.entry_index();
        let mut idom = vec![usize::MAX; cfg.len()];
        idom[entry] = entry;

        let mut changed = true;
        while changed {
            changed = false;
            for &b in rpo.iter().skip(1) {
                let mut new_idom = usize::MAX;
                for &p in cfg.preds(b) {
                    if idom[p] == usize::MAX {
                        continue;
                    }
                    new_idom = if new_idom == usize::MAX {
                        p
                    } else {
                        Self::intersect(&idom, &rpo_number, new_idom, p)
                    };
                }
                assert!(
                    new_idom != usize::MAX,
                    "linearize: block {:?} has no processed predecessor",
                    cfg.block_at(b)
                );
                if idom[b] != new_idom {
                    idom[b] = new_idom;
                    changed = true;
                }
            }
        }

        Self { idom, rpo_number }
    }

    fn intersect(idom: &[usize], rpo_number: &[usize], a: usize, b: usize) -> usize {
        let (mut a, mut b) = (a, b);
        while a != b {
            while rpo_number[a] > rpo_number[b] {
                a = idom[a];
            }
            while rpo_number[b] > rpo_number[a] {
                b = idom[b];
            }
        }
        a
    }

    pub fn idom(&self, idx: usize) -> usize {
        self.idom[idx]
    }

    pub fn dominates(&self, a: usize, b: usize) -> bool {
        let mut cursor = b;
        loop {
            if cursor == a {
                return true;
            }
            let up = self.idom[cursor];
            if up == cursor {
                return false;
            }
            cursor = up;
        }
    }

    /// Used by loop detection to walk up toward the entry.
    pub fn rpo_number(&self, idx: usize) -> usize {
        self.rpo_number[idx]
    }
}

// --- Natural loops ---

struct NaturalLoop {
    header: usize,
    /// All member indices including the header and nested loops.
    members: BTreeSet<usize>,
}

fn find_loops(cfg: &Cfg, doms: &Dominators) -> Vec<NaturalLoop> {
    let mut loops: BTreeMap<usize, BTreeSet<usize>> = BTreeMap::new();

    for b in 0..cfg.len() {
        for &h in cfg.succs(b) {
            if !doms.dominates(h, b) {
                continue;
            }
            // Back edge b -> h: collect everything reaching b without
            // passing through h.
            let members = loops.entry(h).or_default();
            members.insert(h);
            let mut work = vec![b];
            while let Some(n) = work.pop() {
                if members.insert(n) {
                    for &p in cfg.preds(n) {
                        work.push(p);
                    }
                }
            }
        }
    }

    loops
        .into_iter()
        .map(|(header, members)| NaturalLoop { header, members })
        .collect()
}

fn is_back_edge(doms: &Dominators, from: usize, to: usize) -> bool {
    doms.dominates(to, from)
}

// --- Linear order ---

#[derive(Debug, Clone)]
pub struct LinearLoop {
    pub header: u32,
    /// Ordinals of every block in the loop, header included, ascending.
    pub members: Vec<u32>,
}

pub struct Linearization {
    pub order: Vec<BlockId>,
    ordinals: HashMap<BlockId, u32>,
    pub loops: Vec<LinearLoop>,
}

impl Linearization {
    /// Builds a linearization from an explicit order, for callers that
    /// assemble block sequences by hand (tests, mostly).
    pub fn new(order: Vec<BlockId>, loops: Vec<LinearLoop>) -> Self {
        let mut ordinals = HashMap::with_capacity(order.len());
        for (ordinal, block) in order.iter().enumerate() {
            ordinals.insert(*block, ordinal as u32);
        }
        Self {
            order,
            ordinals,
            loops,
        }
    }

    pub fn ordinal(&self, block: BlockId) -> u32 {
        *self
            .ordinals
            .get(&block)
            .unwrap_or_else(|| panic!("linearize: block {:?} not in linear order", block))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn loop_with_header(&self, ordinal: u32) -> Option<&LinearLoop> {
        self.loops.iter().find(|l| l.header == ordinal)
    }
}

/// Scheduling unit: a single block or a whole (collapsed) loop.
enum Unit {
    Block(usize),
    Loop { loop_idx: usize },
}

impl Unit {
    fn entry_block(&self, loops: &[NaturalLoop]) -> usize {
        match self {
            Unit::Block(idx) => *idx,
            Unit::Loop { loop_idx } => loops[*loop_idx].header,
        }
    }
}

pub fn linearize(graph: &Graph) -> Linearization {
    let cfg = Cfg::new(graph);
    let doms = Dominators::compute(&cfg);
    let loops = find_loops(&cfg, &doms);

    // Innermost loop per block: the smallest loop containing it.
    let mut innermost: Vec<Option<usize>> = vec![None; cfg.len()];
    for (loop_idx, l) in loops.iter().enumerate() {
        for &member in &l.members {
            match innermost[member] {
                Some(existing) if loops[existing].members.len() <= l.members.len() => {}
                _ => innermost[member] = Some(loop_idx),
            }
        }
    }

    // Parent loop relation: the smallest loop properly containing a header.
    let parent_loop: Vec<Option<usize>> = loops
        .iter()
        .enumerate()
        .map(|(loop_idx, l)| {
            loops
                .iter()
                .enumerate()
                .filter(|(other_idx, other)| {
                    *other_idx != loop_idx
                        && other.members.contains(&l.header)
                        && other.members.len() > l.members.len()
                })
                .min_by_key(|(_, other)| other.members.len())
                .map(|(idx, _)| idx)
        })
        .collect();

    let mut order = Vec::with_capacity(cfg.len());
    schedule_region(&cfg, &doms, &loops, &innermost, &parent_loop, None, &mut order);

    assert_eq!(
        order.len(),
        cfg.len(),
        "linearize: some blocks were not scheduled"
    );

    let mut ordinals = HashMap::with_capacity(order.len());
    let blocks: Vec<BlockId> = order.iter().map(|&idx| cfg.block_at(idx)).collect();
    for (ordinal, block) in blocks.iter().enumerate() {
        ordinals.insert(*block, ordinal as u32);
    }

    // Every non-back edge must point forward in the order.
    if cfg!(debug_assertions) {
        for b in 0..cfg.len() {
            for &s in cfg.succs(b) {
                if !is_back_edge(&doms, b, s) {
                    let ord_b = ordinals[&cfg.block_at(b)];
                    let ord_s = ordinals[&cfg.block_at(s)];
                    debug_assert!(
                        ord_b < ord_s,
                        "linearize: forward edge {:?} -> {:?} not ascending",
                        cfg.block_at(b),
                        cfg.block_at(s)
                    );
                }
            }
        }
    }

    let linear_loops = loops
        .iter()
        .map(|l| {
            let mut members: Vec<u32> = l
                .members
                .iter()
                .map(|&m| ordinals[&cfg.block_at(m)])
                .collect();
            members.sort();
            LinearLoop {
                header: ordinals[&cfg.block_at(l.header)],
                members,
            }
        })
        .collect();

    Linearization {
        order: blocks,
        ordinals,
        loops: linear_loops,
    }
}

/// Emits one region (the whole function, or the body of one loop) as a
/// topological order of its units, expanding nested loops recursively so
/// their blocks stay contiguous.
fn schedule_region(
    cfg: &Cfg,
    doms: &Dominators,
    loops: &[NaturalLoop],
    innermost: &[Option<usize>],
    parent_loop: &[Option<usize>],
    region: Option<usize>,
    order: &mut Vec<usize>,
) {
    // Units directly inside this region: blocks whose innermost loop is the
    // region itself, plus child loops whose parent is the region.
    let mut units: Vec<Unit> = Vec::new();
    let mut unit_of_block: HashMap<usize, usize> = HashMap::new();

    for b in 0..cfg.len() {
        if innermost[b] == region {
            unit_of_block.insert(b, units.len());
            units.push(Unit::Block(b));
        }
    }
    for (loop_idx, _) in loops.iter().enumerate() {
        if parent_loop[loop_idx] == region && Some(loop_idx) != region {
            let unit = units.len();
            units.push(Unit::Loop { loop_idx });
            for &member in &loops[loop_idx].members {
                unit_of_block.entry(member).or_insert(unit);
            }
        }
    }

    // Lift forward CFG edges between member blocks to unit edges.
    let in_region = |b: usize| match region {
        Some(loop_idx) => loops[loop_idx].members.contains(&b),
        None => true,
    };
    let mut pending: Vec<usize> = vec![0; units.len()];
    let mut succ_units: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); units.len()];
    for (&b, &ub) in &unit_of_block {
        for &s in cfg.succs(b) {
            if !in_region(s) || is_back_edge(doms, b, s) {
                continue;
            }
            let us = unit_of_block[&s];
            if us != ub && succ_units[ub].insert(us) {
                pending[us] += 1;
            }
        }
    }

    // Kahn's algorithm; ties broken by the unit's entry block id so the
    // result is stable for identical input.
    let mut ready: BTreeSet<(u32, usize)> = units
        .iter()
        .enumerate()
        .filter(|(u, _)| pending[*u] == 0)
        .map(|(u, unit)| (cfg.block_at(unit.entry_block(loops)).0, u))
        .collect();

    let mut emitted = 0;
    while let Some(&(key, u)) = ready.iter().next() {
        ready.remove(&(key, u));
        emitted += 1;
        match units[u] {
            Unit::Block(b) => order.push(b),
            Unit::Loop { loop_idx } => {
                order.push(loops[loop_idx].header);
                debug_assert_eq!(innermost[loops[loop_idx].header], Some(loop_idx));
                schedule_loop_body(cfg, doms, loops, innermost, parent_loop, loop_idx, order);
            }
        }
        for &us in &succ_units[u] {
            pending[us] -= 1;
            if pending[us] == 0 {
                ready.insert((cfg.block_at(units[us].entry_block(loops)).0, us));
            }
        }
    }

    assert_eq!(emitted, units.len(), "linearize: cyclic forward edges");
}

fn schedule_loop_body(
    cfg: &Cfg,
    doms: &Dominators,
    loops: &[NaturalLoop],
    innermost: &[Option<usize>],
    parent_loop: &[Option<usize>],
    loop_idx: usize,
    order: &mut Vec<usize>,
) {
    // The header has been emitted by the caller; schedule the remaining
    // units of this loop region the same way, skipping the header block.
    let header = loops[loop_idx].header;
    let before = order.len();
    schedule_region(
        cfg,
        doms,
        loops,
        innermost,
        parent_loop,
        Some(loop_idx),
        order,
    );
    // The region scheduling emits the header again (it is a unit of its own
    // region); drop the duplicate while keeping the body order.
    let dup = order[before..]
        .iter()
        .position(|&b| b == header)
        .expect("linearize: loop region must contain its header");
    order.remove(before + dup);
}

#[cfg(test)]
#[path = "tests/t_linearize.rs"]
mod tests;
