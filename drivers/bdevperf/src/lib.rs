use std::{
    path::PathBuf,
    process::ExitStatus,
};

use common::{
    config::Settings,
    driver::{Driver, WorkloadReply, classify_exit},
    error::TrialError,
    trial::TrialSpec,
    util::core_mask,
};
use serde::{Deserialize, Serialize};

/// Control socket the driver brings up when none is configured.
pub const DEFAULT_SOCKET: &str = "/var/tmp/bdevperf.sock";

/// In-memory (malloc bdev) workload driver: commanded over an RPC
/// control socket, reports a structured JSON summary with an explicit
/// status field instead of a textual totals line. The qpairs axis does
/// not apply to this variant; its dataset columns stay zero-filled.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BdevPerf {
    /// Bdev configuration file handed through to the driver (`--json`).
    pub config_file: Option<String>,
    pub extra_args: Option<Vec<String>>,
}

/// End-of-run summary object, the last JSON line of the output stream.
#[derive(Debug, Default, Clone, Deserialize)]
struct Summary {
    status: String,
    #[serde(default)]
    iops: f64,
    #[serde(default)]
    avg_latency_us: f64,
    #[serde(default)]
    min_latency_us: f64,
    #[serde(default)]
    max_latency_us: f64,
}

fn summary(output: &str) -> Option<Summary> {
    output
        .lines()
        .rev()
        .find_map(|line| serde_json::from_str(line.trim()).ok())
}

#[typetag::serde(name = "bdevperf")]
impl Driver for BdevPerf {
    fn name(&self) -> &'static str {
        "bdevperf"
    }

    fn args(&self, settings: &Settings, spec: &TrialSpec) -> Vec<String> {
        let point = &spec.point;
        let socket = settings
            .socket
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET));
        let mut args = vec![
            "-q".to_owned(),
            point.queue_depth.to_string(),
            "-o".to_owned(),
            point.io_size.to_string(),
            "-w".to_owned(),
            settings.workload().to_owned(),
            "-t".to_owned(),
            spec.steady_time.to_string(),
            "-m".to_owned(),
            core_mask(&point.cores),
            "-b".to_owned(),
            settings.device.clone(),
            "-r".to_owned(),
            socket.to_string_lossy().into_owned(),
            "--summary-json".to_owned(),
        ];
        if let Some(config_file) = &self.config_file {
            args.push("--json".to_owned());
            args.push(config_file.clone());
        }
        if let Some(extra) = &self.extra_args {
            args.extend(extra.iter().cloned());
        }
        args
    }

    fn control_socket(&self, settings: &Settings) -> Option<PathBuf> {
        Some(
            settings
                .socket
                .clone()
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET)),
        )
    }

    fn classify(&self, status: ExitStatus, output: &str) -> Result<(), TrialError> {
        classify_exit(status)?;
        let Some(summary) = summary(output) else {
            return Err(TrialError::MissingMarker("summary"));
        };
        if summary.status != "finished" {
            return Err(TrialError::BadStatus(summary.status));
        }
        Ok(())
    }

    fn parse_reply(&self, output: &str) -> WorkloadReply {
        let summary = summary(output).unwrap_or_default();
        WorkloadReply {
            iops: summary.iops,
            avg_us: summary.avg_latency_us,
            min_us: summary.min_latency_us,
            max_us: summary.max_latency_us,
            // percentiles are not part of the structured reply
            p50_us: 0.0,
            p99_us: 0.0,
            p999_us: 0.0,
            status: Some(summary.status),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;

    use common::sweep::SweepPoint;

    use super::*;

    fn settings(socket: Option<&str>) -> Settings {
        let socket = socket
            .map(|s| format!("socket: {s}\n"))
            .unwrap_or_default();
        serde_yml::from_str(&format!(
            "device: Malloc0\ndriver_program: bdevperf\nsteady_time: 30\nsampling: false\n{socket}"
        ))
        .unwrap()
    }

    fn spec() -> TrialSpec {
        TrialSpec {
            point: SweepPoint {
                io_size: 4096,
                queue_depth: 16,
                qpairs: 1,
                cores: vec![0],
                run: 1,
            },
            steady_time: 30,
            sampling: false,
            out_dir: "raw/s4096_q16_p1_c1_r1".into(),
        }
    }

    const FINISHED: &str = r#"starting bdev run
{"status": "finished", "iops": 250000.5, "avg_latency_us": 63.9, "min_latency_us": 8.1, "max_latency_us": 910.4}
"#;

    #[test]
    fn socket_defaults_and_overrides() {
        let driver = BdevPerf::default();
        assert_eq!(
            driver.control_socket(&settings(None)).unwrap(),
            PathBuf::from(DEFAULT_SOCKET)
        );
        assert_eq!(
            driver
                .control_socket(&settings(Some("/tmp/rpc.sock")))
                .unwrap(),
            PathBuf::from("/tmp/rpc.sock")
        );
    }

    #[test]
    fn args_use_core_mask_and_socket() {
        let driver = BdevPerf::default();
        let joined = driver.args(&settings(None), &spec()).join(" ");
        assert!(joined.contains("-q 16"));
        assert!(joined.contains("-o 4096"));
        assert!(joined.contains("-m 0x1"));
        assert!(joined.contains("-b Malloc0"));
        assert!(joined.contains(&format!("-r {DEFAULT_SOCKET}")));
        assert!(joined.contains("--summary-json"));
    }

    #[test]
    fn classify_requires_finished_status() {
        let driver = BdevPerf::default();
        let ok = ExitStatus::from_raw(0);
        assert!(driver.classify(ok, FINISHED).is_ok());

        let aborted = "{\"status\": \"failed\", \"iops\": 0.0}\n";
        assert!(matches!(
            driver.classify(ok, aborted),
            Err(TrialError::BadStatus(status)) if status == "failed"
        ));
        assert!(matches!(
            driver.classify(ok, "no summary\n"),
            Err(TrialError::MissingMarker("summary"))
        ));
    }

    #[test]
    fn reply_reads_the_structured_summary() {
        let driver = BdevPerf::default();
        let reply = driver.parse_reply(FINISHED);
        assert_eq!(reply.iops, 250000.5);
        assert_eq!(reply.avg_us, 63.9);
        assert_eq!(reply.status.as_deref(), Some("finished"));
        // percentile fields degrade to zero, never a sentinel
        assert_eq!(reply.p50_us, 0.0);
        assert_eq!(reply.p999_us, 0.0);
    }

    #[test]
    fn last_json_line_wins() {
        let output = "{\"status\": \"running\", \"iops\": 1.0}\n\
                      {\"status\": \"finished\", \"iops\": 2.0}\n";
        assert_eq!(summary(output).unwrap().iops, 2.0);
    }
}
