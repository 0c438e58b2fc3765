use std::path::Path;

use anyhow::Context;
use tinyboy_avr::{AddrSet, AnalysisError, ConditionalBranch, ControlFlowGraph, FlashImage};

/// The fraction of some set of coverage targets that has been reached.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Ratio {
    pub covered: usize,
    pub total: usize,
}

impl Ratio {
    /// The covered percentage, or `None` if there is nothing to cover.
    pub fn percent(&self) -> Option<f64> {
        match self.total {
            0 => None,
            total => Some(100.0 * self.covered as f64 / total as f64),
        }
    }

    pub fn is_applicable(&self) -> bool {
        self.total != 0
    }

    /// Returns whether `target` percent has been reached. Always true when there is nothing to
    /// cover.
    pub fn meets(&self, target: f64) -> bool {
        self.percent().map_or(true, |percent| percent >= target)
    }
}

impl std::fmt::Display for Ratio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.percent() {
            Some(percent) => write!(f, "{percent:.2}% ({}/{})", self.covered, self.total),
            None => f.write_str("n/a"),
        }
    }
}

impl serde::Serialize for Ratio {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.percent().serialize(serializer)
    }
}

/// Tracks which of the statically reachable instructions and branches of a firmware image have
/// been executed.
#[derive(Clone)]
pub struct CoverageTracker {
    graph: ControlFlowGraph,
    /// Every code address observed so far, including addresses outside of the reachable set.
    observed: AddrSet,
}

impl CoverageTracker {
    pub fn new(firmware: &FlashImage) -> Result<Self, AnalysisError> {
        Ok(Self::from_graph(ControlFlowGraph::build(firmware)?))
    }

    pub fn from_graph(graph: ControlFlowGraph) -> Self {
        let observed = AddrSet::with_capacity(graph.flash_len());
        Self { graph, observed }
    }

    /// Add the addresses observed during a run to the accumulated coverage.
    pub fn record(&mut self, observed: &AddrSet) {
        self.observed.union_with(observed);
    }

    /// Every byte belonging to a statically reachable instruction.
    pub fn reachable_addresses(&self) -> &AddrSet {
        self.graph.reachable()
    }

    /// Restrict `observed` to reachable instruction bytes.
    pub fn mask(&self, observed: &AddrSet) -> AddrSet {
        observed.intersection(self.reachable_addresses())
    }

    pub fn graph(&self) -> &ControlFlowGraph {
        &self.graph
    }

    /// The raw set of observed addresses.
    pub fn observed(&self) -> &AddrSet {
        &self.observed
    }

    pub fn was_covered(&self, addr: u32) -> bool {
        self.graph.instruction(addr).is_some() && self.observed.contains(addr)
    }

    pub fn is_branch_covered(&self, branch: &ConditionalBranch) -> bool {
        self.observed.contains(branch.fallthrough) && self.observed.contains(branch.taken)
    }

    pub fn instruction_coverage(&self) -> Ratio {
        let covered =
            self.graph.instructions().filter(|(addr, _)| self.observed.contains(*addr)).count();
        Ratio { covered, total: self.graph.instruction_count() }
    }

    pub fn branch_coverage(&self) -> Ratio {
        let branches = self.graph.conditional_branches();
        let covered = branches.iter().filter(|b| self.is_branch_covered(b)).count();
        Ratio { covered, total: branches.len() }
    }

    /// Conditional branches with at least one edge that has not been executed.
    pub fn uncovered_branches(&self) -> impl Iterator<Item = ConditionalBranch> + '_ {
        self.graph.conditional_branches().iter().copied().filter(|b| !self.is_branch_covered(b))
    }

    pub fn report(&self) -> CoverageReport {
        let branches = self
            .graph
            .conditional_branches()
            .iter()
            .map(|b| BranchEntry {
                addr: b.addr,
                fallthrough: self.observed.contains(b.fallthrough),
                taken: self.observed.contains(b.taken),
            })
            .collect();
        CoverageReport {
            instructions: self.instruction_coverage(),
            branches: self.branch_coverage(),
            reachable_instructions: self.graph.instruction_count(),
            covered_addresses: self.mask(&self.observed).iter().collect(),
            branch_edges: branches,
        }
    }

    pub fn save_report(&self, path: &Path) -> anyhow::Result<()> {
        let report = serde_json::to_vec_pretty(&self.report())?;
        std::fs::write(path, report)
            .with_context(|| format!("failed to write coverage to {}", path.display()))
    }
}

#[derive(serde::Serialize)]
struct BranchEntry {
    addr: u32,
    fallthrough: bool,
    taken: bool,
}

/// A serializable summary of the coverage.
#[derive(serde::Serialize)]
pub struct CoverageReport {
    /// Instruction coverage in percent, `null` if there are no reachable instructions.
    pub instructions: Ratio,
    /// Branch coverage in percent, `null` if there are no conditional branches.
    pub branches: Ratio,
    pub reachable_instructions: usize,
    pub covered_addresses: Vec<u32>,
    branch_edges: Vec<BranchEntry>,
}
