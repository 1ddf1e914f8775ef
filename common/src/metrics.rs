use serde::{Deserialize, Serialize};

use crate::{DRAM_CAS_BYTES, telemetry::ParsedCounters};

/// Per-operation normalizations of one trial's counters. `TOTAL_IOS`
/// (iops x steady time) is the sole denominator; a zero denominator
/// defines every per-op metric as zero.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub total_ios: f64,
    pub cycles_per_io: f64,
    pub instr_per_io: f64,
    pub llc_misses_per_io: f64,
    pub dram_read_bytes_per_io: f64,
    pub dram_write_bytes_per_io: f64,
    pub energy_per_io: f64,
    pub mmio_writes_per_io: f64,
    pub completions_per_call: f64,
    pub scans_per_completion: f64,
    pub submit_logic_ns: f64,
    pub polling_wait_ns: f64,
    pub completion_logic_ns: f64,
    pub total_io_ns: f64,
}

/// Pure derivation from parsed counters and the trial's steady window.
/// Running it twice on identical inputs yields identical outputs.
pub fn derive(counters: &ParsedCounters, steady_time_secs: u64) -> DerivedMetrics {
    let total_ios = counters.iops * steady_time_secs as f64;
    let per_io = |value: f64| if total_ios > 0.0 { value / total_ios } else { 0.0 };
    let ratio = |num: f64, den: f64| if den > 0.0 { num / den } else { 0.0 };

    let stages = &counters.stages;
    let submit_logic_ns = stages.submit_preamble
        + stages.tracker_alloc
        + stages.addr_xlate
        + stages.cmd_construct
        + stages.fence
        + stages.doorbell;
    let completion_logic_ns = stages.cqe_detect + stages.tracker_lookup + stages.state_dealloc;

    DerivedMetrics {
        total_ios,
        cycles_per_io: per_io(counters.cycles),
        instr_per_io: per_io(counters.instructions),
        llc_misses_per_io: per_io(counters.llc_misses),
        dram_read_bytes_per_io: per_io(counters.dram_reads * DRAM_CAS_BYTES),
        dram_write_bytes_per_io: per_io(counters.dram_writes * DRAM_CAS_BYTES),
        energy_per_io: per_io(counters.energy_joules),
        mmio_writes_per_io: per_io(counters.sq_doorbells + counters.cq_doorbells),
        completions_per_call: ratio(counters.completions, counters.polls),
        scans_per_completion: ratio(counters.polls, counters.completions),
        submit_logic_ns,
        polling_wait_ns: stages.polling_wait,
        completion_logic_ns,
        total_io_ns: submit_logic_ns + stages.polling_wait + completion_logic_ns,
    }
}
