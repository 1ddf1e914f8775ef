use std::{collections::HashMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::driver::Driver;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    pub settings: Settings,
    pub sweep: SweepAxes,
    pub driver: Box<dyn Driver>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Target device as the driver variant expects it (PCIe address or
    /// bdev name).
    pub device: String,
    pub driver_program: String,
    /// Seconds each trial holds its steady-state window.
    pub steady_time: u64,
    pub sampling: bool,
    pub sampler_program: Option<String>,
    pub sampler_attach: Option<SamplerAttach>,
    pub events: Option<EventMap>,
    pub socket: Option<PathBuf>,
    pub force_reclaim: Option<bool>,
    pub ready_interval_ms: Option<u64>,
    pub ready_attempts: Option<u32>,
    pub workload: Option<String>,
    pub env: Option<HashMap<String, String>>,
}

impl Settings {
    pub fn sampler_program(&self) -> &str {
        self.sampler_program.as_deref().unwrap_or("perf")
    }

    pub fn sampler_attach(&self) -> SamplerAttach {
        self.sampler_attach.unwrap_or(SamplerAttach::Process)
    }

    pub fn events(&self) -> EventMap {
        self.events.clone().unwrap_or_default()
    }

    pub fn force_reclaim(&self) -> bool {
        self.force_reclaim.unwrap_or(false)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms.unwrap_or(500))
    }

    pub fn ready_attempts(&self) -> u32 {
        self.ready_attempts.unwrap_or(20)
    }

    pub fn workload(&self) -> &str {
        self.workload.as_deref().unwrap_or("randread")
    }
}

/// Which scope the counter sampler attaches to during a trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerAttach {
    /// Follow the workload driver process.
    Process,
    /// Watch the trial's assigned cores.
    Cores,
}

/// Hardware event names as the sampler reports them. Events the current
/// hardware cannot count degrade to zero in the parsed output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventMap {
    pub cycles: String,
    pub instructions: String,
    pub llc_misses: String,
    pub dram_reads: String,
    pub dram_writes: String,
    pub energy: String,
}

impl Default for EventMap {
    fn default() -> Self {
        Self {
            cycles: "cycles".to_owned(),
            instructions: "instructions".to_owned(),
            llc_misses: "LLC-load-misses".to_owned(),
            dram_reads: "uncore_imc/cas_count_read/".to_owned(),
            dram_writes: "uncore_imc/cas_count_write/".to_owned(),
            energy: "power/energy-pkg/".to_owned(),
        }
    }
}

impl EventMap {
    pub fn request_list(&self) -> Vec<String> {
        vec![
            self.cycles.clone(),
            self.instructions.clone(),
            self.llc_misses.clone(),
            self.dram_reads.clone(),
            self.dram_writes.clone(),
            self.energy.clone(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepAxes {
    pub io_sizes: Vec<String>,
    pub queue_depths: Vec<u32>,
    pub qpairs: Option<Vec<u32>>,
    pub cores: CoreAxis,
    pub repeats: u32,
}

/// Core assignment axis: explicit per-point core id lists, or counts that
/// auto-select from core 0 upward.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreAxis {
    Ids(Vec<Vec<u32>>),
    Counts(Vec<u32>),
}
