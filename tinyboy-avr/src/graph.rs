//! Static reconstruction of the code reachable from the reset vector.
//!
//! The traversal only follows direct control flow. Code reachable only through interrupt vectors
//! or computed jumps is not part of the graph, and any indirect jump or call aborts the analysis.

use hashbrown::HashMap;

use crate::{
    addr_set::AddrSet,
    decode::{decode, DecodeError, Instruction, Opcode},
    firmware::FlashImage,
};

/// A two-way control transfer, counted as covered once both successors have executed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConditionalBranch {
    pub addr: u32,
    pub fallthrough: u32,
    pub taken: u32,
}

#[derive(Debug)]
pub enum AnalysisError {
    Decode(DecodeError),
    /// An indirect jump or call was reached, so the set of successors cannot be enumerated.
    IndirectBranch { addr: u32, instruction: Instruction },
    /// A direct control transfer leaves the flash image.
    TargetOutOfRange { addr: u32, target: i64 },
}

impl std::fmt::Display for AnalysisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Decode(err) => write!(f, "decode error: {err}"),
            Self::IndirectBranch { addr, instruction } => {
                write!(f, "unsupported indirect control flow `{instruction}` at {addr:#06x}")
            }
            Self::TargetOutOfRange { addr, target } => {
                write!(f, "branch at {addr:#06x} targets {target:#x} which is outside of flash")
            }
        }
    }
}

impl std::error::Error for AnalysisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DecodeError> for AnalysisError {
    fn from(err: DecodeError) -> Self {
        Self::Decode(err)
    }
}

/// Where execution may continue after an instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Flow {
    Next(u32),
    Jump(u32),
    Call { target: u32, ret: u32 },
    Branch(ConditionalBranch),
    Return,
}

#[derive(Clone)]
pub struct ControlFlowGraph {
    /// Reachable instructions indexed by word address.
    instructions: Vec<Option<Instruction>>,
    branches: HashMap<u32, ConditionalBranch>,
    /// The values of `branches` ordered by address.
    sorted_branches: Vec<ConditionalBranch>,
    /// Every byte of every reachable instruction.
    reachable: AddrSet,
    flash_len: usize,
}

impl ControlFlowGraph {
    /// Decode every instruction reachable from address zero.
    pub fn build(flash: &FlashImage) -> Result<Self, AnalysisError> {
        let mut graph = Self {
            instructions: vec![None; flash.len() / 2],
            branches: HashMap::new(),
            sorted_branches: vec![],
            reachable: AddrSet::with_capacity(flash.len()),
            flash_len: flash.len(),
        };

        let mut stack = vec![0_u32];
        while let Some(addr) = stack.pop() {
            if graph.instruction(addr).is_some() {
                continue;
            }

            let instruction = decode(flash, addr)?;
            graph.instructions[(addr / 2) as usize] = Some(instruction);
            graph.reachable.insert_range(addr, instruction.width);

            // Successors are pushed in reverse so the fallthrough path is explored first.
            match successors(flash, addr, &instruction)? {
                Flow::Next(next) | Flow::Jump(next) => stack.push(next),
                Flow::Call { target, ret } => stack.extend([ret, target]),
                Flow::Branch(branch) => {
                    stack.extend([branch.taken, branch.fallthrough]);
                    graph.branches.insert(addr, branch);
                }
                Flow::Return => {}
            }
        }

        graph.sorted_branches = graph.branches.values().copied().collect();
        graph.sorted_branches.sort_unstable_by_key(|b| b.addr);

        tracing::debug!(
            "found {} reachable instructions and {} conditional branches",
            graph.instruction_count(),
            graph.branches.len()
        );
        Ok(graph)
    }

    pub fn instruction(&self, addr: u32) -> Option<&Instruction> {
        if addr % 2 != 0 {
            return None;
        }
        self.instructions.get((addr / 2) as usize)?.as_ref()
    }

    /// Iterates reachable instructions in address order.
    pub fn instructions(&self) -> impl Iterator<Item = (u32, &Instruction)> + '_ {
        self.instructions
            .iter()
            .enumerate()
            .filter_map(|(i, insn)| Some(((i * 2) as u32, insn.as_ref()?)))
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.iter().filter(|x| x.is_some()).count()
    }

    pub fn branch(&self, addr: u32) -> Option<&ConditionalBranch> {
        self.branches.get(&addr)
    }

    /// All conditional branches ordered by address.
    pub fn conditional_branches(&self) -> &[ConditionalBranch] {
        &self.sorted_branches
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }

    pub fn reachable(&self) -> &AddrSet {
        &self.reachable
    }

    pub fn flash_len(&self) -> usize {
        self.flash_len
    }
}

fn successors(flash: &FlashImage, addr: u32, insn: &Instruction) -> Result<Flow, AnalysisError> {
    let next = addr + insn.width;
    let relative = |k: i64| -> Result<u32, AnalysisError> {
        let target = next as i64 + 2 * k;
        match target >= 0 && (target as usize) < flash.len() {
            true => Ok(target as u32),
            false => Err(AnalysisError::TargetOutOfRange { addr, target }),
        }
    };
    let absolute = |word: u32| -> Result<u32, AnalysisError> {
        let target = word as i64 * 2;
        match (target as usize) < flash.len() {
            true => Ok(target as u32),
            false => Err(AnalysisError::TargetOutOfRange { addr, target }),
        }
    };

    let flow = match insn.opcode {
        Opcode::Sequential => Flow::Next(next),
        Opcode::Rjmp { k } => Flow::Jump(relative(k as i64)?),
        Opcode::Jmp { target } => Flow::Jump(absolute(target)?),
        Opcode::Rcall { k } => Flow::Call { target: relative(k as i64)?, ret: next },
        Opcode::Call { target } => Flow::Call { target: absolute(target)?, ret: next },
        Opcode::Branch { k, .. } => {
            Flow::Branch(ConditionalBranch { addr, fallthrough: next, taken: relative(k as i64)? })
        }
        Opcode::Skip(_) => {
            let skipped = decode(flash, next)?;
            Flow::Branch(ConditionalBranch { addr, fallthrough: next, taken: next + skipped.width })
        }
        Opcode::Ret | Opcode::Reti => Flow::Return,
        Opcode::Ijmp | Opcode::Eijmp | Opcode::Icall | Opcode::Eicall => {
            return Err(AnalysisError::IndirectBranch { addr, instruction: *insn });
        }
    };
    Ok(flow)
}
