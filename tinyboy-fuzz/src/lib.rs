pub mod config;
pub mod coverage;
pub mod engine;
pub mod generator;
pub mod input;
mod monitor;
mod utils;

pub use crate::{
    config::{Config, CoverageMetric, FuzzConfig},
    coverage::{CoverageReport, CoverageTracker, Ratio},
    engine::{EngineState, FuzzEngine, FuzzReport, StopReason},
    generator::{InputGenerator, RandomExtension},
    input::{Pulse, PulseSequence},
};
