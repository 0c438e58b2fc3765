use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use tinyboy_avr::{pins::PinBank, EmulatorSession, FlashImage, Mcu, RunResult};

use crate::{
    config::{Config, CoverageMetric},
    coverage::CoverageTracker,
    generator::InputGenerator,
    monitor::Monitor,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The coverage target was reached.
    TargetMet,
    /// The generator ran out of inputs.
    Exhausted,
    /// The interrupt flag was set.
    Interrupted,
    /// The configured time limit passed.
    TimeLimit,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
}

pub struct FuzzReport {
    pub coverage: CoverageTracker,
    pub stop: StopReason,
    pub executions: u64,
    pub rounds: u64,
}

/// The inputs assigned to a single worker for one round. Slots that could not be filled because
/// the generator was exhausted are left empty.
pub struct WorkerBatch<I> {
    slots: Vec<Option<I>>,
}

impl<I> WorkerBatch<I> {
    fn fill<G: InputGenerator<Input = I>>(generator: &mut G, capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        while slots.len() < capacity && generator.has_more() {
            match generator.generate() {
                Some(input) => slots.push(Some(input)),
                None => break,
            }
        }
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    pub fn inputs(&self) -> usize {
        self.slots.iter().filter(|x| x.is_some()).count()
    }

    pub fn padding(&self) -> usize {
        self.slots.len() - self.inputs()
    }
}

/// Runs inputs from a generator across a pool of emulator sessions until a coverage target is met.
///
/// Execution proceeds in rounds: every worker is handed a batch of inputs, all batches execute in
/// parallel, and the results are fed back to the generator and coverage tracker once every worker
/// has finished.
pub struct FuzzEngine<M, G> {
    firmware: FlashImage,
    sessions: Vec<EmulatorSession<M>>,
    generator: G,
    batch_size: usize,
    metric: CoverageMetric,
    run_for: Option<Duration>,
    interrupt_flag: Arc<AtomicBool>,
    stats_path: Option<std::path::PathBuf>,
    state: EngineState,
}

impl<M, G> FuzzEngine<M, G>
where
    M: Mcu + Send,
    G: InputGenerator,
{
    pub fn new(
        firmware: FlashImage,
        sessions: Vec<EmulatorSession<M>>,
        generator: G,
        batch_size: usize,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!sessions.is_empty(), "at least one worker session is required");
        anyhow::ensure!(batch_size > 0, "batch size must be non-zero");
        Ok(Self {
            firmware,
            sessions,
            generator,
            batch_size,
            metric: CoverageMetric::Branch,
            run_for: None,
            interrupt_flag: Arc::new(AtomicBool::new(false)),
            stats_path: None,
            state: EngineState::Idle,
        })
    }

    /// Create an engine with one session per configured worker, using `build` to construct the
    /// emulator of each session.
    pub fn from_config(
        config: &Config,
        firmware: FlashImage,
        generator: G,
        mut build: impl FnMut(&mut PinBank) -> M,
    ) -> anyhow::Result<Self> {
        config.fuzzer.validate()?;
        let sessions = (0..config.fuzzer.workers)
            .map(|_| {
                EmulatorSession::new(config.firmware.wiring.clone(), &mut build)
                    .with_cycle_limit(config.firmware.cycle_limit)
            })
            .collect();

        let mut engine = Self::new(firmware, sessions, generator, config.fuzzer.batch_size)?
            .with_metric(config.fuzzer.metric)
            .with_time_limit(config.fuzzer.run_for);
        engine.interrupt_flag = config.interrupt_flag.clone();
        if config.fuzzer.save_stats {
            engine.stats_path = Some(config.workdir.join("stats.csv"));
        }
        Ok(engine)
    }

    pub fn with_metric(mut self, metric: CoverageMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_time_limit(mut self, run_for: Option<Duration>) -> Self {
        self.run_for = run_for;
        self
    }

    /// A flag that stops fuzzing at the end of the current round when set.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt_flag.clone()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn generator_mut(&mut self) -> &mut G {
        &mut self.generator
    }

    pub fn workers(&self) -> usize {
        self.sessions.len()
    }

    /// Fuzz until `target` percent coverage is reached or the generator is exhausted.
    pub fn run(&mut self, target: f64) -> anyhow::Result<FuzzReport> {
        anyhow::ensure!((0.0..=100.0).contains(&target), "invalid coverage target: {target}");

        let mut coverage =
            CoverageTracker::new(&self.firmware).context("failed to analyze firmware")?;
        tracing::info!(
            "starting {} workers: target={target}% ({:?}), instructions={}, branches={}",
            self.sessions.len(),
            self.metric,
            coverage.instruction_coverage().total,
            coverage.branch_coverage().total,
        );

        self.state = EngineState::Running;
        let result = self.fuzzing_loop(&mut coverage, target);
        self.state = EngineState::Idle;

        let (stop, monitor) = result?;
        tracing::info!(
            "stopped ({stop:?}) after {} inputs: branch coverage {}, instruction coverage {}",
            monitor.total_executions,
            coverage.branch_coverage(),
            coverage.instruction_coverage(),
        );
        Ok(FuzzReport {
            coverage,
            stop,
            executions: monitor.total_executions,
            rounds: monitor.rounds,
        })
    }

    fn fuzzing_loop(
        &mut self,
        coverage: &mut CoverageTracker,
        target: f64,
    ) -> anyhow::Result<(StopReason, Monitor)> {
        let start = Instant::now();
        let mut monitor = Monitor::new(self.stats_path.clone());

        let stop = loop {
            if let Some(reason) = self.check_stop(coverage, target, start) {
                break reason;
            }

            let batches = self.next_batches();
            if batches.iter().all(|batch| batch.inputs() == 0) {
                break StopReason::Exhausted;
            }

            let mut executions = 0;
            for (input, result) in self.dispatch(batches)?.into_iter().flatten() {
                let masked = coverage.mask(&result.covered);
                self.generator.record(input, &masked, &result.memory);
                coverage.record(&result.covered);
                executions += 1;
            }
            monitor.round(executions, coverage)?;
        };

        monitor.log(coverage)?;
        Ok((stop, monitor))
    }

    fn check_stop(
        &self,
        coverage: &CoverageTracker,
        target: f64,
        start: Instant,
    ) -> Option<StopReason> {
        if self.interrupt_flag.load(Ordering::Relaxed) {
            return Some(StopReason::Interrupted);
        }
        if self.run_for.map_or(false, |limit| start.elapsed() >= limit) {
            return Some(StopReason::TimeLimit);
        }
        let achieved = match self.metric {
            CoverageMetric::Branch => coverage.branch_coverage(),
            CoverageMetric::Instruction => coverage.instruction_coverage(),
        };
        if achieved.meets(target) {
            return Some(StopReason::TargetMet);
        }
        if !self.generator.has_more() {
            return Some(StopReason::Exhausted);
        }
        None
    }

    /// Draw a full round of inputs from the generator, one batch per worker.
    pub(crate) fn next_batches(&mut self) -> Vec<WorkerBatch<G::Input>> {
        (0..self.sessions.len())
            .map(|_| WorkerBatch::fill(&mut self.generator, self.batch_size))
            .collect()
    }

    /// Execute every batch on its own worker thread, returning once all workers are finished.
    fn dispatch(
        &mut self,
        batches: Vec<WorkerBatch<G::Input>>,
    ) -> anyhow::Result<Vec<Vec<(G::Input, RunResult)>>> {
        let firmware = &self.firmware;
        let sessions = &mut self.sessions;

        std::thread::scope(|s| -> anyhow::Result<_> {
            let mut workers = vec![];
            for (id, (session, batch)) in sessions.iter_mut().zip(batches).enumerate() {
                if batch.inputs() == 0 {
                    continue;
                }
                tracing::debug!("dispatching {} inputs to worker-{id}", batch.inputs());
                let handle = std::thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn_scoped(s, move || run_batch(session, firmware, batch))
                    .context("OS failed to spawn worker thread")?;
                workers.push((id, handle));
            }

            let mut results = Vec::with_capacity(workers.len());
            let mut failed = None;
            for (id, handle) in workers {
                match handle.join() {
                    Ok(result) => results.push(result),
                    Err(_) => {
                        tracing::error!("worker-{id} panicked");
                        failed.get_or_insert(id);
                    }
                }
            }
            if let Some(id) = failed {
                anyhow::bail!("worker-{id} panicked while executing its batch");
            }
            Ok(results)
        })
    }
}

fn run_batch<M: Mcu, I: tinyboy_avr::pins::BitList>(
    session: &mut EmulatorSession<M>,
    firmware: &FlashImage,
    batch: WorkerBatch<I>,
) -> Vec<(I, RunResult)> {
    batch
        .slots
        .into_iter()
        .flatten()
        .map(|input| {
            session.reset();
            session.upload(firmware);
            let result = session.run_until_exhausted(&input);
            (input, result)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use tinyboy_avr::{
        pins::{tinyboy_wiring, BitList},
        testing::{assemble, op, ScriptedMcu},
        AddrSet,
    };

    use super::*;
    use crate::input::PulseSequence;

    /// Replays a fixed list of inputs, keeping everything it is told about.
    struct Replay {
        inputs: std::vec::IntoIter<PulseSequence>,
        generated: usize,
        records: Vec<(PulseSequence, AddrSet, Vec<u8>)>,
    }

    impl Replay {
        fn new(inputs: &[&str]) -> Self {
            let inputs: Vec<_> =
                inputs.iter().map(|x| PulseSequence::parse(x, 1, 4).unwrap()).collect();
            Self { inputs: inputs.into_iter(), generated: 0, records: vec![] }
        }
    }

    impl InputGenerator for Replay {
        type Input = PulseSequence;

        fn generate(&mut self) -> Option<PulseSequence> {
            let next = self.inputs.next()?;
            self.generated += 1;
            Some(next)
        }

        fn record(&mut self, input: PulseSequence, coverage: &AddrSet, memory: &[u8]) {
            self.records.push((input, coverage.clone(), memory.to_vec()));
        }

        fn has_more(&self) -> bool {
            self.inputs.len() > 0
        }
    }

    fn new_engine(
        words: &[u16],
        workers: usize,
        batch: usize,
        generator: Replay,
    ) -> FuzzEngine<ScriptedMcu, Replay> {
        let sessions =
            (0..workers).map(|_| EmulatorSession::new(tinyboy_wiring(), ScriptedMcu::new)).collect();
        FuzzEngine::new(assemble(words), sessions, generator, batch).unwrap()
    }

    /// 0: breq 6       (taken when UP is pressed)
    /// 2: nop
    /// 4: rjmp 0
    /// 6: rjmp 0
    /// 8: .word 0xffff (data)
    fn branchy() -> Vec<u16> {
        vec![op::breq(2), op::NOP, op::rjmp(-3), op::rjmp(-4), 0xffff]
    }

    #[test]
    fn partial_round_pads_empty_slots() {
        let mut engine = new_engine(&branchy(), 4, 2, Replay::new(&["D", "D", "D", "D", "D"]));

        let batches = engine.next_batches();
        let inputs: Vec<_> = batches.iter().map(|b| b.inputs()).collect();
        assert_eq!(inputs, vec![2, 2, 1, 0]);
        assert_eq!(batches[2].padding(), 1);
        assert_eq!(engine.generator().generated, 5);

        let results = engine.dispatch(batches).unwrap();
        assert_eq!(results.iter().map(|r| r.len()).sum::<usize>(), 5);
    }

    #[test]
    fn every_input_is_recorded_once() {
        let mut engine = new_engine(&branchy(), 4, 2, Replay::new(&["_", "__", "___", "____", "_____"]));
        let report = engine.run(100.0).unwrap();

        assert_eq!(report.stop, StopReason::Exhausted);
        assert_eq!(report.executions, 5);
        assert_eq!(report.rounds, 1);
        assert_eq!(engine.state(), EngineState::Idle);

        let records = &engine.generator().records;
        assert_eq!(records.len(), 5);
        let mut seen: Vec<_> = records.iter().map(|(input, _, _)| input.to_string()).collect();
        seen.sort();
        assert_eq!(seen, vec!["_", "__", "___", "____", "_____"]);

        // No button is ever pressed, so the branch only ever falls through.
        assert_eq!(report.coverage.branch_coverage().percent(), Some(0.0));
        assert_eq!(report.coverage.instruction_coverage().covered, 3);
    }

    #[test]
    fn forwarded_coverage_is_masked() {
        // 0: breq 6
        // 2: rjmp 0
        // 4: .word 0xffff (data, never executed)
        // 6: lds r16, 0
        // a: rjmp 0
        let words = [op::breq(2), op::rjmp(-2), 0xffff, op::LDS, 0x0000, op::rjmp(-6)];
        let mut engine = new_engine(&words, 2, 3, Replay::new(&["U", "UU", "_U", "U_U"]));
        let report = engine.run(100.0).unwrap();

        let reachable = report.coverage.reachable_addresses();
        assert!(!reachable.contains(4));
        for (_, coverage, memory) in &engine.generator().records {
            assert!(coverage.is_subset(reachable));
            assert_eq!(memory.len(), ScriptedMcu::DATA_SIZE);
        }
        assert_eq!(report.coverage.instruction_coverage().percent(), Some(100.0));
        assert_eq!(report.coverage.branch_coverage().percent(), Some(100.0));
        assert_eq!(report.stop, StopReason::TargetMet);
    }

    #[test]
    fn masking_covers_large_firmware() {
        // 0:   rjmp 602
        // 2:   .word 0xffff x 300 (lookup table)
        // 602: ldi r30, 0x00
        // 604: ldi r31, 0x01
        // 606: lpm             (reads the table at 0x100)
        // 608: breq 602
        // 610: rjmp 602
        let mut words = vec![op::rjmp(300)];
        words.extend(std::iter::repeat(0xffff).take(300));
        words.extend([op::ldi(30, 0x00), op::ldi(31, 0x01), op::LPM, op::breq(-4), op::rjmp(-5)]);
        assert!(words.len() * 2 > 256);

        let mut engine = new_engine(&words, 2, 1, Replay::new(&["U___", "____"]));
        let report = engine.run(100.0).unwrap();

        let reachable = report.coverage.reachable_addresses();
        assert!(!reachable.contains(0x100));
        assert!(reachable.contains(610));
        assert!(report.coverage.observed().contains(0x100));

        let records = &engine.generator().records;
        assert_eq!(records.len(), 2);
        for (_, coverage, _) in records {
            assert!(coverage.iter().all(|addr| reachable.contains(addr)));
            assert!(!coverage.contains(0x100));
            assert!(coverage.contains(606));
        }
        assert_eq!(report.coverage.instruction_coverage().percent(), Some(100.0));
        assert_eq!(report.coverage.branch_coverage().percent(), Some(100.0));
        assert_eq!(report.stop, StopReason::TargetMet);
    }

    #[test]
    fn rejects_empty_worker_pool() {
        let session = || EmulatorSession::new(tinyboy_wiring(), ScriptedMcu::new);
        let firmware = assemble(&branchy());

        let none: Vec<EmulatorSession<ScriptedMcu>> = vec![];
        let err = FuzzEngine::new(firmware.clone(), none, Replay::new(&["_"]), 1).err().unwrap();
        assert!(err.to_string().contains("worker"));
        let err = FuzzEngine::new(firmware, vec![session()], Replay::new(&["_"]), 0).err().unwrap();
        assert!(err.to_string().contains("batch size"));
    }

    #[test]
    fn stops_once_target_is_met() {
        // Each input holds a single pulse and every round handles 2 inputs.
        let inputs = ["_", "_", "U", "_", "_", "_", "_", "_"];
        let mut engine = new_engine(&branchy(), 1, 2, Replay::new(&inputs));
        let report = engine.run(100.0).unwrap();

        assert_eq!(report.stop, StopReason::TargetMet);
        assert_eq!(report.rounds, 2);
        assert_eq!(report.executions, 4);
        assert_eq!(engine.generator().generated, 4);

        // The engine can be reused, continuing with the remaining inputs.
        let report = engine.run(100.0).unwrap();
        assert_eq!(report.stop, StopReason::Exhausted);
        assert_eq!(report.executions, 4);
        assert_eq!(report.coverage.branch_coverage().percent(), Some(0.0));
    }

    #[test]
    fn branchless_firmware_meets_any_target() {
        // 0: nop
        // 2: rjmp 0
        let mut engine = new_engine(&[op::NOP, op::rjmp(-2)], 2, 2, Replay::new(&["U"]));
        let report = engine.run(100.0).unwrap();
        assert!(!report.coverage.branch_coverage().is_applicable());
        assert_eq!(report.stop, StopReason::TargetMet);
        assert_eq!(report.executions, 0);

        let mut engine = engine.with_metric(CoverageMetric::Instruction);
        let report = engine.run(100.0).unwrap();
        assert_eq!(report.stop, StopReason::TargetMet);
        assert_eq!(report.executions, 1);
    }

    #[test]
    fn interrupt_stops_between_rounds() {
        let mut engine = new_engine(&branchy(), 2, 2, Replay::new(&["D"; 8]));
        engine.interrupt_flag().store(true, Ordering::Relaxed);
        let report = engine.run(100.0).unwrap();
        assert_eq!(report.stop, StopReason::Interrupted);
        assert_eq!(report.executions, 0);
    }

    #[test]
    fn analysis_errors_abort_the_run() {
        let mut engine = new_engine(&[op::NOP, op::IJMP], 1, 1, Replay::new(&["U"]));
        let err = engine.run(50.0).err().unwrap();
        assert!(format!("{err:#}").contains("indirect"));
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.generator().generated, 0);
    }

    #[test]
    fn halted_runs_still_count() {
        // 0: breq 4
        // 2: ret       (halts: nothing to return to)
        // 4: rjmp 4
        let words = [op::breq(1), op::RET, op::rjmp(-1)];
        let mut engine = new_engine(&words, 1, 2, Replay::new(&["_", "U"]));
        let report = engine.run(100.0).unwrap();
        assert_eq!(report.executions, 2);
        assert_eq!(report.coverage.branch_coverage().percent(), Some(100.0));

        let (input, coverage, _) = &engine.generator().records[0];
        assert_eq!(input.size(), 4);
        assert_eq!(coverage.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn random_extension_finds_both_edges() {
        let sessions =
            (0..2).map(|_| EmulatorSession::new(tinyboy_wiring(), ScriptedMcu::new)).collect();
        let generator = crate::generator::RandomExtension::new(1, 1, 4).with_budget(Some(1000));
        let mut engine = FuzzEngine::new(assemble(&branchy()), sessions, generator, 4).unwrap();

        let report = engine.run(100.0).unwrap();
        assert_eq!(report.stop, StopReason::TargetMet);
        assert!(report.executions < 1000);
        assert!(!engine.generator().corpus().is_empty());
    }

    #[test]
    fn engine_from_config() {
        let config = Config {
            fuzzer: crate::config::FuzzConfig {
                workers: 3,
                batch_size: 2,
                metric: CoverageMetric::Instruction,
                max_inputs: Some(10),
                ..Default::default()
            },
            workdir: std::env::temp_dir(),
            firmware: tinyboy_avr::config::FirmwareConfig::for_firmware("game.hex".into()),
            interrupt_flag: Arc::new(AtomicBool::new(false)),
        };
        let generator = crate::generator::RandomExtension::from_config(&config);
        let mut engine =
            FuzzEngine::from_config(&config, assemble(&branchy()), generator, ScriptedMcu::new)
                .unwrap();
        assert_eq!(engine.workers(), 3);

        config.interrupt_flag.store(true, Ordering::Relaxed);
        let report = engine.run(100.0).unwrap();
        assert_eq!(report.stop, StopReason::Interrupted);
    }
}
