use std::{path::Path, process::ExitStatus};

use common::{
    config::Settings,
    driver::{Driver, WorkloadReply, classify_exit},
    error::TrialError,
    telemetry::{self, TOTALS_MARKER},
    trial::{STAGE_TABLE, TrialSpec},
    util::core_mask,
};
use serde::{Deserialize, Serialize};

/// PCIe-attached NVMe workload driver in the SPDK `perf` mold: commanded
/// through CLI flags, no control socket, textual reply with a totals
/// line and inline latency percentile lines.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SpdkPerf {
    /// Per-IO latency tracking (`-L`), required for percentile lines.
    /// On by default.
    pub latency_tracking: Option<bool>,
    /// Ask an instrumented driver build to dump its per-stage timing
    /// table into the trial directory.
    pub stage_stats: Option<bool>,
    pub extra_args: Option<Vec<String>>,
}

#[typetag::serde(name = "spdk_perf")]
impl Driver for SpdkPerf {
    fn name(&self) -> &'static str {
        "spdk_perf"
    }

    fn args(&self, settings: &Settings, spec: &TrialSpec) -> Vec<String> {
        let point = &spec.point;
        let mut args = vec![
            "-q".to_owned(),
            point.queue_depth.to_string(),
            "-o".to_owned(),
            point.io_size.to_string(),
            "-w".to_owned(),
            settings.workload().to_owned(),
            "-t".to_owned(),
            spec.steady_time.to_string(),
            "-c".to_owned(),
            core_mask(&point.cores),
            "-P".to_owned(),
            point.qpairs.to_string(),
            "-r".to_owned(),
            format!("trtype=PCIe traddr={}", settings.device),
        ];
        if self.latency_tracking.unwrap_or(true) {
            args.push("-L".to_owned());
        }
        args.push("--transport-stats".to_owned());
        if let Some(extra) = &self.extra_args {
            args.extend(extra.iter().cloned());
        }
        args
    }

    fn add_path_args(&self, args: &mut Vec<String>, dir: &Path) {
        if self.stage_stats.unwrap_or(false) {
            args.push("--stage-dump".to_owned());
            args.push(dir.join(STAGE_TABLE).to_string_lossy().into_owned());
        }
    }

    fn classify(&self, status: ExitStatus, output: &str) -> Result<(), TrialError> {
        classify_exit(status)?;
        if telemetry::totals_line(output, TOTALS_MARKER).is_none() {
            return Err(TrialError::MissingMarker(TOTALS_MARKER));
        }
        Ok(())
    }

    fn parse_reply(&self, output: &str) -> WorkloadReply {
        let totals = telemetry::totals_line(output, TOTALS_MARKER).unwrap_or_default();
        let percentiles = telemetry::parse_percentiles(output);
        WorkloadReply {
            iops: totals.iops,
            avg_us: totals.avg_us,
            min_us: totals.min_us,
            max_us: totals.max_us,
            p50_us: percentiles.p50_us,
            p99_us: percentiles.p99_us,
            p999_us: percentiles.p999_us,
            status: None,
        }
    }
}
