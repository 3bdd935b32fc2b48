//! CFG path cover.
//!
//! For one recovered function this computes a finite set of paths that
//! together traverse every edge worth visiting: redundant edges (whose
//! endpoints stay connected without them) are skipped, and loop edges
//! are taken at most once per path, so every path terminates.
//!
//! A path is the list of decisions an executor must make, one
//! `(jump address, taken)` pair per branch encountered.

use crate::error::AnalysisError;
use crate::flow::{is_conditional_jump, is_unconditional_jmp, jump_target, Func};
use carve_emulate::Addr;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Safety threshold: functions whose cover exceeds this many paths are
/// skipped rather than analyzed.
pub const MAX_PATHS: usize = 4096;

/// How a branch leaves its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    /// Taken leg of a conditional jump.
    Conditional,
    /// An unconditional jump.
    Unconditional,
    /// Fall-through past the last conditional of the node.
    Next,
}

/// One outgoing branch of a node.
#[derive(Debug, Clone, Copy)]
pub struct Branch {
    /// Address of the jump instruction deciding this branch.
    pub source: Addr,
    /// Branch destination, snapped to a node head.
    pub dst: Addr,
    /// Kind of branch.
    pub kind: BranchKind,
}

/// A decision node: the head of a run of consecutive jumps.
#[derive(Debug, Clone)]
pub struct Node {
    /// Address of the first jump in the run.
    pub source: Addr,
    /// Outgoing branches, primary branch first.
    pub branches: Vec<Branch>,
}

/// An ordered (src, dst) edge.
pub type Edge = (Addr, Addr);

/// One decision along a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStep {
    /// Address of the jump instruction.
    pub jump: Addr,
    /// Whether the jump is taken.
    pub take: bool,
}

/// A full decision list for one traversal.
pub type Path = Vec<PathStep>;

/// The computed path cover of one function.
#[derive(Debug, Default)]
pub struct PathCover {
    nodes: BTreeMap<Addr, Node>,
    order: HashMap<Addr, usize>,
    ends: HashSet<Addr>,
    loops: HashSet<Edge>,
    useless: HashSet<Edge>,
    paths: Vec<Path>,
}

impl PathCover {
    /// Analyzes a function's CFG.
    ///
    /// Fails when any jump destination cannot be computed, or when the
    /// cover grows past [`MAX_PATHS`].
    pub fn analyze(func: &Func) -> Result<PathCover, AnalysisError> {
        let mut cover = PathCover::default();
        cover.build_nodes(func)?;
        cover.normalize_nodes();
        cover.top_sort(func);
        cover.find_loops();
        cover.find_useless_edges();
        cover.build_paths(func);
        if cover.paths.len() > MAX_PATHS {
            return Err(AnalysisError::PathExplosion {
                entry: func.entry,
                limit: MAX_PATHS,
            });
        }
        Ok(cover)
    }

    /// The paths of the cover.
    pub fn paths(&self) -> &[Path] {
        &self.paths
    }

    /// Loop (back) edges of the CFG.
    pub fn loops(&self) -> &HashSet<Edge> {
        &self.loops
    }

    /// Redundant edges excluded from every path.
    pub fn useless_edges(&self) -> &HashSet<Edge> {
        &self.useless
    }

    /// Decision nodes keyed by address.
    pub fn nodes(&self) -> &BTreeMap<Addr, Node> {
        &self.nodes
    }

    /// Collapses each run of consecutive jumps into a node. Jumps that
    /// leave the function, and RET instructions, become end nodes.
    fn build_nodes(&mut self, func: &Func) -> Result<(), AnalysisError> {
        let instrs: Vec<(Addr, &iced_x86::Instruction)> =
            func.instructions.iter().map(|(&a, i)| (a, i)).collect();
        let mut i = 0;
        while i < instrs.len() {
            let (addr, instr) = instrs[i];
            if crate::flow::is_any_jump(instr) {
                let dst = jump_target(instr)
                    .ok_or(AnalysisError::UnresolvedFlow { address: addr })?;
                if func.is_inside(dst) {
                    let src = addr;
                    let mut branches: Vec<Branch> = Vec::new();
                    let mut next = None;
                    while i < instrs.len() && is_conditional_jump(instrs[i].1) {
                        let (jaddr, jinstr) = instrs[i];
                        let jdst = jump_target(jinstr)
                            .ok_or(AnalysisError::UnresolvedFlow { address: jaddr })?;
                        if !func.is_inside(jdst) {
                            break;
                        }
                        branches.push(Branch {
                            source: jaddr,
                            dst: jdst,
                            kind: BranchKind::Conditional,
                        });
                        next = Some(jaddr + jinstr.len() as u64);
                        i += 1;
                    }
                    if i < instrs.len() {
                        let (taddr, tinstr) = instrs[i];
                        if is_unconditional_jmp(tinstr) {
                            let tdst = jump_target(tinstr)
                                .ok_or(AnalysisError::UnresolvedFlow { address: taddr })?;
                            if func.is_inside(tdst) {
                                branches.insert(
                                    0,
                                    Branch {
                                        source: taddr,
                                        dst: tdst,
                                        kind: BranchKind::Unconditional,
                                    },
                                );
                            }
                        } else if let Some(next) = next {
                            branches.insert(
                                0,
                                Branch {
                                    source: instrs[i - 1].0,
                                    dst: next,
                                    kind: BranchKind::Next,
                                },
                            );
                        }
                    }
                    if !branches.is_empty() {
                        self.nodes.insert(
                            src,
                            Node {
                                source: src,
                                branches,
                            },
                        );
                    }
                    if i >= instrs.len() {
                        break;
                    }
                } else {
                    self.nodes.insert(
                        addr,
                        Node {
                            source: addr,
                            branches: Vec::new(),
                        },
                    );
                    self.ends.insert(addr);
                }
            } else if instr.flow_control() == iced_x86::FlowControl::Return {
                self.nodes.insert(
                    addr,
                    Node {
                        source: addr,
                        branches: Vec::new(),
                    },
                );
                self.ends.insert(addr);
            }
            i += 1;
        }
        Ok(())
    }

    /// Snaps every branch destination to the lowest node address at or
    /// above it, so straight-line runs collapse away.
    fn normalize_nodes(&mut self) {
        let heads: Vec<Addr> = self.nodes.keys().copied().collect();
        for node in self.nodes.values_mut() {
            for branch in &mut node.branches {
                let at = heads.partition_point(|&h| h < branch.dst);
                if at < heads.len() {
                    branch.dst = heads[at];
                }
            }
        }
    }

    /// Reverse DFS finish order from the entry point; tolerates back
    /// edges.
    fn top_sort(&mut self, func: &Func) {
        if self.nodes.is_empty() {
            return;
        }
        let mut finished: Vec<Addr> = Vec::new();
        let mut visited: HashSet<Addr> = HashSet::new();
        self.order_dfs(func.entry, &mut visited, &mut finished);
        for (index, addr) in finished.iter().rev().enumerate() {
            self.order.insert(*addr, index);
        }
    }

    fn order_dfs(&self, at: Addr, visited: &mut HashSet<Addr>, finished: &mut Vec<Addr>) {
        let node = self.nodes.range(at..).next().map(|(_, n)| n);
        let resolved = node.map_or(at, |n| n.source);
        if !visited.insert(resolved) {
            return;
        }
        if let Some(node) = node {
            let branches: Vec<Addr> = node.branches.iter().map(|b| b.dst).collect();
            for dst in branches {
                self.order_dfs(dst, visited, finished);
            }
        }
        finished.push(resolved);
    }

    /// An edge is a loop edge when it does not advance the topological
    /// order.
    fn find_loops(&mut self) {
        for node in self.nodes.values() {
            for branch in &node.branches {
                let (Some(&src), Some(&dst)) =
                    (self.order.get(&node.source), self.order.get(&branch.dst))
                else {
                    continue;
                };
                if dst <= src {
                    self.loops.insert((node.source, branch.dst));
                }
            }
        }
    }

    /// An edge is useless when its destination stays reachable from its
    /// source with the edge (and all loop edges) removed, without ever
    /// crossing a node ordered after the destination.
    fn find_useless_edges(&mut self) {
        let edges: Vec<Edge> = self
            .nodes
            .values()
            .flat_map(|n| n.branches.iter().map(|b| (n.source, b.dst)))
            .collect();
        for edge in edges {
            if self.reaches_without(edge, edge.0, edge.1) {
                self.useless.insert(edge);
            }
        }
    }

    fn reaches_without(&self, blocked: Edge, start: Addr, end: Addr) -> bool {
        let Some(&bound) = self.order.get(&end) else {
            return false;
        };
        let mut visited: HashSet<Addr> = HashSet::new();
        let mut stack = vec![start];
        while let Some(at) = stack.pop() {
            match self.order.get(&at) {
                Some(&o) if o <= bound => {}
                _ => continue,
            }
            if !visited.insert(at) {
                continue;
            }
            let Some(node) = self.nodes.get(&at) else {
                continue;
            };
            for branch in &node.branches {
                let edge = (node.source, branch.dst);
                if edge == blocked || self.loops.contains(&edge) {
                    continue;
                }
                if edge.1 == end {
                    return true;
                }
                if !visited.contains(&edge.1) {
                    stack.push(edge.1);
                }
            }
        }
        false
    }

    /// Depth-first path enumeration. Secondary branches are visited
    /// before the primary branch; loop edges enter a per-path visited
    /// set so each path unrolls a cycle at most once.
    fn build_paths(&mut self, func: &Func) {
        if self.nodes.is_empty() {
            self.paths.push(Path::new());
            return;
        }
        let Some((&start, _)) = self.nodes.range(func.entry..).next() else {
            self.paths.push(Path::new());
            return;
        };
        let mut visited_loops: HashSet<Edge> = HashSet::new();
        let mut path = Path::new();
        let mut paths = Vec::new();
        self.path_dfs(start, &mut visited_loops, &mut path, &mut paths);
        self.paths = paths;
    }

    fn path_dfs(
        &self,
        at: Addr,
        visited_loops: &mut HashSet<Edge>,
        path: &mut Path,
        paths: &mut Vec<Path>,
    ) {
        if paths.len() > MAX_PATHS {
            return;
        }
        if self.ends.contains(&at) || !self.nodes.contains_key(&at) {
            paths.push(path.clone());
            return;
        }
        let node = &self.nodes[&at];
        let mut added = 0usize;
        let branch_order: Vec<usize> = (1..node.branches.len()).chain(std::iter::once(0)).collect();
        for index in branch_order {
            let branch = node.branches[index];
            if index != 0 || added == 0 {
                // Entering a later conditional of the run means the
                // previous one was not taken.
                if index != 0 && added > 0 {
                    if let Some(last) = path.last_mut() {
                        last.take = false;
                    }
                }
                path.push(PathStep {
                    jump: branch.source,
                    take: matches!(
                        branch.kind,
                        BranchKind::Conditional | BranchKind::Unconditional
                    ),
                });
                added += 1;
            } else {
                // Primary branch after the secondaries: the last
                // conditional is simply not taken.
                if let Some(last) = path.last_mut() {
                    last.take = false;
                }
                if branch.kind == BranchKind::Unconditional {
                    path.push(PathStep {
                        jump: branch.source,
                        take: true,
                    });
                    added += 1;
                }
            }

            let edge = (node.source, branch.dst);
            let mut entered_loop = false;
            if self.loops.contains(&edge) {
                if !visited_loops.insert(edge) {
                    continue;
                }
                entered_loop = true;
            }
            if !self.useless.contains(&edge) {
                self.path_dfs(branch.dst, visited_loops, path, paths);
            }
            if entered_loop {
                visited_loops.remove(&edge);
            }
        }
        path.truncate(path.len() - added);
    }
}
