use std::{
    fs::File,
    io::Write,
    path::{Path, PathBuf},
};

use eyre::Result;
use tracing::debug;

use crate::{
    error::{SetupError, TrialError},
    metrics::DerivedMetrics,
    sweep::SweepPoint,
    telemetry::ParsedCounters,
};

/// Fixed, versioned column order shared by every sweep variant. Fields a
/// variant cannot produce are zero-filled, never omitted.
pub const RESULT_COLUMNS: [&str; 40] = [
    "QD",
    "Qpairs",
    "IO_Size",
    "Run_ID",
    "Core_Count",
    "IOPS",
    "p50_Latency",
    "p99_Latency",
    "p99.9_Latency",
    "Cycles",
    "Instructions",
    "LLC_Misses",
    "Dram_Read_Bytes",
    "Dram_Write_Bytes",
    "Energy_Joules",
    "Cycles_Per_IO",
    "Instr_Per_IO",
    "LLC_Misses_Per_IO",
    "Dram_Read_Bytes_Per_IO",
    "Dram_Write_Bytes_Per_IO",
    "Energy_Per_IO",
    "Polls",
    "Completions",
    "Scans_Per_Completion",
    "Completions_Per_Call",
    "MMIO_Writes_Per_IO",
    "Completions_Per_Poll_Hist",
    "Submit_Preamble_ns",
    "Tracker_Alloc_ns",
    "Addr_Xlate_ns",
    "Cmd_Construct_ns",
    "Fence_ns",
    "Doorbell_ns",
    "CQE_Detect_ns",
    "Tracker_Lookup_ns",
    "State_Dealloc_ns",
    "Submit_Logic_ns",
    "Polling_Wait_ns",
    "Completion_Logic_ns",
    "Total_IO_ns",
];

/// Append-only dataset writer plus the companion error log. Every row is
/// flushed and synced before the next trial starts, so an interrupted
/// sweep leaves a valid prefix of completed rows.
pub struct ResultSink {
    writer: csv::Writer<File>,
    /// Second handle onto the dataset, for syncing what the writer
    /// flushed.
    dataset_sync: File,
    errors: File,
    dataset_path: PathBuf,
    error_path: PathBuf,
}

impl ResultSink {
    pub fn create(dir: &Path, tag: &str) -> Result<Self, SetupError> {
        let dataset_path = dir.join(format!("{tag}_results.csv"));
        let error_path = dir.join(format!("{tag}_errors.log"));
        let dataset = File::create(&dataset_path)?;
        let dataset_sync = dataset.try_clone()?;
        let mut writer = csv::Writer::from_writer(dataset);
        writer.write_record(RESULT_COLUMNS)?;
        writer.flush()?;
        let errors = File::create(&error_path)?;
        debug!("Dataset at {}", dataset_path.display());
        Ok(Self {
            writer,
            dataset_sync,
            errors,
            dataset_path,
            error_path,
        })
    }

    pub fn dataset_path(&self) -> &Path {
        &self.dataset_path
    }

    pub fn error_path(&self) -> &Path {
        &self.error_path
    }

    /// Appends one flattened row in [`RESULT_COLUMNS`] order and makes it
    /// durable.
    pub fn append(
        &mut self,
        point: &SweepPoint,
        counters: &ParsedCounters,
        metrics: &DerivedMetrics,
    ) -> Result<()> {
        let s = &counters.stages;
        let row: [String; 40] = [
            point.queue_depth.to_string(),
            point.qpairs.to_string(),
            point.io_size.to_string(),
            point.run.to_string(),
            point.cores.len().to_string(),
            counters.iops.to_string(),
            counters.p50_us.to_string(),
            counters.p99_us.to_string(),
            counters.p999_us.to_string(),
            counters.cycles.to_string(),
            counters.instructions.to_string(),
            counters.llc_misses.to_string(),
            counters.dram_reads.to_string(),
            counters.dram_writes.to_string(),
            counters.energy_joules.to_string(),
            metrics.cycles_per_io.to_string(),
            metrics.instr_per_io.to_string(),
            metrics.llc_misses_per_io.to_string(),
            metrics.dram_read_bytes_per_io.to_string(),
            metrics.dram_write_bytes_per_io.to_string(),
            metrics.energy_per_io.to_string(),
            counters.polls.to_string(),
            counters.completions.to_string(),
            metrics.scans_per_completion.to_string(),
            metrics.completions_per_call.to_string(),
            metrics.mmio_writes_per_io.to_string(),
            counters.cpl_hist.clone(),
            s.submit_preamble.to_string(),
            s.tracker_alloc.to_string(),
            s.addr_xlate.to_string(),
            s.cmd_construct.to_string(),
            s.fence.to_string(),
            s.doorbell.to_string(),
            s.cqe_detect.to_string(),
            s.tracker_lookup.to_string(),
            s.state_dealloc.to_string(),
            metrics.submit_logic_ns.to_string(),
            metrics.polling_wait_ns.to_string(),
            metrics.completion_logic_ns.to_string(),
            metrics.total_io_ns.to_string(),
        ];
        self.writer.write_record(&row)?;
        self.writer.flush()?;
        self.dataset_sync.sync_data()?;
        Ok(())
    }

    /// Records one failure block with the point coordinates and a pointer
    /// to the retained raw output.
    pub fn record_failure(
        &mut self,
        point: &SweepPoint,
        reason: &TrialError,
        raw_log: &Path,
    ) -> Result<()> {
        writeln!(
            self.errors,
            "FAILED {}\n  reason: {reason}\n  raw: {}",
            point.coordinates(),
            raw_log.display()
        )?;
        self.errors.sync_data()?;
        Ok(())
    }
}
