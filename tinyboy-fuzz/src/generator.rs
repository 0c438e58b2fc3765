use rand::{rngs::SmallRng, seq::SliceRandom, Rng, SeedableRng};
use rand_distr::Exp1;
use tinyboy_avr::{pins::BitList, AddrSet};

use crate::{
    config::Config,
    input::{Pulse, PulseSequence},
};

/// Produces inputs for the fuzzer and receives feedback about how they executed.
///
/// Both methods are only ever called from the thread driving the engine, so implementations do not
/// need to be thread safe.
pub trait InputGenerator {
    type Input: BitList + Send;

    /// Returns the next input to execute, or `None` once the generator is exhausted.
    fn generate(&mut self) -> Option<Self::Input>;

    /// Called exactly once for every input returned from `generate` that was executed, with the
    /// reachable code addresses the input covered and the final contents of data memory.
    fn record(&mut self, input: Self::Input, coverage: &AddrSet, memory: &[u8]);

    /// Returns whether the generator may produce more inputs.
    fn has_more(&self) -> bool {
        true
    }
}

/// Controls the lambda factor for the exponential distribution used for length extension.
/// (1 / factor) corresponds to the mean value of the distribution.
const EXTENSION_LAMBDA: f64 = 1.0 / 8.0;

/// The probability that an extension pulse presses no button at all.
const IDLE_PULSE_PROBABILITY: f64 = 0.25;

/// Extends inputs that found new coverage by a random number of random pulses.
pub struct RandomExtension {
    rng: SmallRng,
    width: usize,
    lines: usize,
    /// The maximum number of pulses in a generated input.
    max_pulses: usize,
    /// The number of inputs left to generate.
    budget: Option<u64>,
    /// Inputs that reached new code.
    corpus: Vec<PulseSequence>,
    seen: AddrSet,
}

impl RandomExtension {
    pub fn new(seed: u64, width: usize, lines: usize) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            width,
            lines,
            max_pulses: 256,
            budget: None,
            corpus: vec![],
            seen: AddrSet::new(),
        }
    }

    /// Create a generator using the seed, input budget and pulse geometry of `config`.
    pub fn from_config(config: &Config) -> Self {
        let firmware = &config.firmware;
        Self::new(config.fuzzer.seed, firmware.pulse_width as usize, firmware.lines as usize)
            .with_budget(config.fuzzer.max_inputs)
            .with_max_pulses(config.fuzzer.max_pulses)
    }

    /// Stop generating inputs after `budget` inputs.
    pub fn with_budget(mut self, budget: Option<u64>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_max_pulses(mut self, max_pulses: usize) -> Self {
        self.max_pulses = max_pulses.max(1);
        self
    }

    /// Inputs that were found to reach new code, in the order they were found.
    pub fn corpus(&self) -> &[PulseSequence] {
        &self.corpus
    }

    fn random_pulse(&mut self) -> Pulse {
        match self.rng.gen_bool(IDLE_PULSE_PROBABILITY) {
            true => None,
            false => Some(self.rng.gen_range(0..self.lines) as u8),
        }
    }
}

impl InputGenerator for RandomExtension {
    type Input = PulseSequence;

    fn generate(&mut self) -> Option<PulseSequence> {
        if let Some(budget) = self.budget.as_mut() {
            *budget = budget.checked_sub(1)?;
        }

        let empty = PulseSequence::new(self.width, self.lines);
        let parent = match self.corpus.choose(&mut self.rng) {
            Some(parent) if parent.len() < self.max_pulses => parent.clone(),
            _ => empty,
        };

        let extension: f64 = self.rng.sample(Exp1);
        let amount =
            (1 + (extension / EXTENSION_LAMBDA) as usize).min(self.max_pulses - parent.len());
        let pulses: Vec<Pulse> = (0..amount).map(|_| self.random_pulse()).collect();
        Some(parent.append_all(pulses))
    }

    fn record(&mut self, input: PulseSequence, coverage: &AddrSet, _memory: &[u8]) {
        if self.seen.has_new(coverage) {
            let total = self.seen.union_with(coverage);
            tracing::debug!("new coverage ({total} addresses) with: {input}");
            self.corpus.push(input);
        }
    }

    fn has_more(&self) -> bool {
        self.budget.map_or(true, |budget| budget > 0)
    }
}
