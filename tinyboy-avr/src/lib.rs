pub mod addr_set;
pub mod config;
pub mod decode;
pub mod firmware;
pub mod graph;
pub mod memory;
pub mod pins;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

use crate::{
    memory::{InstrumentedMemory, Memory},
    pins::{BitCursor, BitList, PinBank, PinIo, WiringTable},
};

pub use crate::{
    addr_set::AddrSet,
    firmware::FlashImage,
    graph::{AnalysisError, ConditionalBranch, ControlFlowGraph},
};

/// Raised by an emulator when the program cannot make any further progress (e.g. it executed a
/// `sleep` with interrupts disabled, or jumped to an invalid instruction).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Halted;

/// An emulated AVR microcontroller.
pub trait Mcu {
    type Code: Memory;
    type Data: Memory;

    /// Return to the power-on state.
    fn reset(&mut self);

    /// Replace the contents of program memory with `image`.
    fn upload(&mut self, image: &FlashImage);

    /// Advance the emulator by one clock cycle.
    fn clock(&mut self, pins: &mut PinIo) -> Result<(), Halted>;

    /// Program memory. Instruction fetches must go through [`Memory::read`] so they can be traced.
    fn code(&mut self) -> &mut InstrumentedMemory<Self::Code>;

    fn data(&self) -> &Self::Data;
}

/// The outcome of executing a single input.
#[derive(Clone, Debug)]
pub struct RunResult {
    /// Every program memory address read during the run.
    pub covered: AddrSet,
    /// The contents of data memory at the end of the run.
    pub memory: Vec<u8>,
    pub clocks: u64,
    pub halted: bool,
}

/// An emulator together with the wires it was connected to.
pub struct EmulatorSession<M> {
    mcu: M,
    pins: PinBank,
    cycle_limit: Option<u64>,
}

impl<M: Mcu> EmulatorSession<M> {
    /// Create a new session. `build` constructs the emulator, resolving its pins against a bank
    /// wired with `wiring`.
    pub fn new(wiring: WiringTable, build: impl FnOnce(&mut PinBank) -> M) -> Self {
        let mut pins = PinBank::new(wiring);
        let mcu = build(&mut pins);
        Self { mcu, pins, cycle_limit: None }
    }

    /// Additionally bound the number of clock cycles a single run may take.
    pub fn with_cycle_limit(mut self, cycle_limit: Option<u64>) -> Self {
        self.cycle_limit = cycle_limit;
        self
    }

    pub fn reset(&mut self) {
        self.mcu.reset();
        self.pins.reset();
    }

    pub fn upload(&mut self, image: &FlashImage) {
        self.mcu.upload(image);
    }

    /// Attach `input` to the input wires for a single run.
    pub fn bind<'a>(&'a mut self, input: &'a dyn BitList) -> BoundSession<'a, M> {
        BoundSession { session: self, input: BitCursor::new(input) }
    }

    pub fn run_until_exhausted(&mut self, input: &dyn BitList) -> RunResult {
        self.bind(input).run_until_exhausted()
    }

    pub fn mcu(&self) -> &M {
        &self.mcu
    }

    pub fn mcu_mut(&mut self) -> &mut M {
        &mut self.mcu
    }
}

/// A session with an input attached.
pub struct BoundSession<'a, M> {
    session: &'a mut EmulatorSession<M>,
    input: BitCursor<'a>,
}

impl<'a, M: Mcu> BoundSession<'a, M> {
    /// Clock the emulator once for every bit of input, stopping early if the emulator halts.
    pub fn run_until_exhausted(mut self) -> RunResult {
        let session = &mut *self.session;
        let limit = (self.input.len() as u64).min(session.cycle_limit.unwrap_or(u64::MAX));

        let mut clocks = 0;
        let mut halted = false;
        let mut traced = TracedMcu::attach(&mut session.mcu);
        while self.input.has_next() && clocks < limit {
            if traced.clock(&mut PinIo::new(&mut session.pins, &mut self.input)).is_err() {
                tracing::trace!("halted after {clocks} clocks");
                halted = true;
                break;
            }
            clocks += 1;
        }
        let covered = traced.finish();

        RunResult { covered, memory: memory::snapshot(session.mcu.data()), clocks, halted }
    }
}

/// Keeps a read trace registered on code memory for as long as it is alive.
struct TracedMcu<'a, M: Mcu> {
    mcu: &'a mut M,
}

impl<'a, M: Mcu> TracedMcu<'a, M> {
    fn attach(mcu: &'a mut M) -> Self {
        mcu.code().register();
        Self { mcu }
    }

    fn finish(mut self) -> AddrSet {
        self.mcu.code().unregister().unwrap_or_default()
    }
}

impl<M: Mcu> Drop for TracedMcu<'_, M> {
    fn drop(&mut self) {
        self.mcu.code().unregister();
    }
}

impl<M: Mcu> std::ops::Deref for TracedMcu<'_, M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        &*self.mcu
    }
}

impl<M: Mcu> std::ops::DerefMut for TracedMcu<'_, M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.mcu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        pins::tinyboy_wiring,
        testing::{assemble, op, ScriptedMcu},
    };

    fn session(words: &[u16]) -> EmulatorSession<ScriptedMcu> {
        let mut session = EmulatorSession::new(tinyboy_wiring(), ScriptedMcu::new);
        session.reset();
        session.upload(&assemble(words));
        session
    }

    #[test]
    fn runs_until_input_is_exhausted() {
        // 0: breq 0
        // 2: rjmp 0
        let mut session = session(&[op::breq(-1), op::rjmp(-2)]);
        let input = vec![false, false, false];
        let result = session.run_until_exhausted(&input);
        assert!(!result.halted);
        assert_eq!(result.clocks, 3);
        assert_eq!(result.covered.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(!session.mcu_mut().code().is_registered());
    }

    #[test]
    fn halt_detaches_instrumentation() {
        // 0: breq 4
        // 2: ret
        // 4: nop
        // 6: rjmp 4
        let mut session = session(&[op::breq(1), op::RET, op::NOP, op::rjmp(-2)]);
        let input = vec![false; 16];
        let result = session.run_until_exhausted(&input);
        assert!(result.halted);
        assert_eq!(result.clocks, 1);
        assert_eq!(result.covered.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(!session.mcu_mut().code().is_registered());

        // Reads made outside of a run are not recorded in the next one.
        session.mcu_mut().code().read(6);
        session.reset();
        let result = session.run_until_exhausted(&vec![true, false, false]);
        assert!(!result.halted);
        assert_eq!(result.covered.iter().collect::<Vec<_>>(), vec![0, 1, 4, 5, 6, 7]);
    }

    #[test]
    fn cycle_limit_bounds_runs() {
        let mut session = session(&[op::NOP, op::rjmp(-2)]).with_cycle_limit(Some(5));
        let result = session.run_until_exhausted(&vec![false; 100]);
        assert_eq!(result.clocks, 5);
    }

    #[test]
    fn final_memory_snapshot() {
        let mut session = session(&[op::NOP, op::NOP, op::rjmp(-3)]);
        let result = session.run_until_exhausted(&vec![false; 7]);
        assert_eq!(result.memory.len(), ScriptedMcu::DATA_SIZE);
        assert_eq!(result.memory[0], 7);
    }
}
