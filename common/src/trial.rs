use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use eyre::{Context, Result};
use flume::{Receiver, Sender};
use tokio::{
    fs::{create_dir_all, read_to_string, write},
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    signal::ctrl_c,
};
use tracing::{debug, warn};

use crate::{
    config::{SamplerAttach, Settings},
    driver::Driver,
    error::TrialError,
    metrics::{self, DerivedMetrics},
    sampler::{AttachMode, SamplerReply, SamplerRequest},
    sweep::SweepPoint,
    telemetry::{self, ParsedCounters, RawMeasurement},
    util::wait_for_path,
};

/// Captured driver output filename inside a trial's retained directory.
pub const DRIVER_LOG: &str = "driver.log";
/// Auxiliary per-operation timing table the instrumented driver may dump.
pub const STAGE_TABLE: &str = "stages.csv";

/// Everything one trial needs, resolved from the sweep point and the
/// sweep-wide configuration. Read-only during execution.
#[derive(Debug, Clone)]
pub struct TrialSpec {
    pub point: SweepPoint,
    pub steady_time: u64,
    pub sampling: bool,
    pub out_dir: PathBuf,
}

impl TrialSpec {
    pub fn new(point: SweepPoint, settings: &Settings, raw_root: &Path) -> Self {
        let out_dir = raw_root.join(point.tag());
        Self {
            point,
            steady_time: settings.steady_time,
            sampling: settings.sampling,
            out_dir,
        }
    }
}

#[derive(Debug)]
pub enum TrialResult {
    Success {
        counters: ParsedCounters,
        metrics: DerivedMetrics,
    },
    Failure {
        reason: TrialError,
        raw_log: PathBuf,
    },
}

pub struct SamplerChannels {
    pub requests: Sender<SamplerRequest>,
    pub replies: Receiver<SamplerReply>,
}

pub struct TrialRunner<'a> {
    pub settings: &'a Settings,
    pub driver: &'a dyn Driver,
    pub sampler: Option<&'a SamplerChannels>,
}

impl TrialRunner<'_> {
    /// Executes exactly one trial. Per-trial failures come back as
    /// [`TrialResult::Failure`]; `Err` means the sweep must stop (an
    /// external interrupt arrived and both children were terminated).
    pub async fn run(&self, spec: &TrialSpec) -> Result<TrialResult> {
        create_dir_all(&spec.out_dir).await?;
        let raw_log = spec.out_dir.join(DRIVER_LOG);

        let mut args = self.driver.args(self.settings, spec);
        self.driver.add_path_args(&mut args, &spec.out_dir);
        debug!(
            "point={} program={} args={}",
            spec.point.tag(),
            self.settings.driver_program,
            args.join(" ")
        );

        let mut cmd = Command::new(&self.settings.driver_program);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = &self.settings.env {
            cmd.envs(env);
        }
        let mut child = cmd.spawn().context("Spawn workload driver")?;

        // The control socket is exclusive and sweep-global: reclaim the
        // path on every exit from this scope, aborts included.
        let _socket_guard = self.driver.control_socket(self.settings).map(SocketGuard);

        if let Some(socket) = self.driver.control_socket(self.settings) {
            let attempts = self.settings.ready_attempts();
            let ready = tokio::select! {
                ready = wait_for_path(&socket, self.settings.ready_interval(), attempts) => ready,
                _ = ctrl_c() => return self.interrupt(child).await,
            };
            if !ready {
                _ = child.start_kill();
                _ = child.wait().await;
                write(&raw_log, drain_output(&mut child).await).await?;
                return Ok(TrialResult::Failure {
                    reason: TrialError::ReadyTimeout { socket, attempts },
                    raw_log,
                });
            }
        }

        let active_sampler = if spec.sampling { self.sampler } else { None };
        if let Some(sampler) = active_sampler {
            let attach = match self.settings.sampler_attach() {
                SamplerAttach::Process => match child.id() {
                    Some(pid) => AttachMode::Pid(pid),
                    None => AttachMode::Cores(spec.point.cores.clone()),
                },
                SamplerAttach::Cores => AttachMode::Cores(spec.point.cores.clone()),
            };
            sampler
                .requests
                .send_async(SamplerRequest::Start {
                    attach,
                    dir: spec.out_dir.clone(),
                    duration_secs: spec.steady_time,
                })
                .await?;
        }

        // drain the pipes concurrently so a chatty driver cannot block
        // on a full pipe before exiting
        let out_task = tokio::spawn(read_stream(child.stdout.take()));
        let err_task = tokio::spawn(read_stream(child.stderr.take()));

        let status = tokio::select! {
            status = child.wait() => status.context("Wait for workload driver")?,
            _ = ctrl_c() => return self.interrupt(child).await,
        };

        let driver_output = match (out_task.await?, err_task.await?) {
            (Ok(stdout), Ok(stderr)) => format!("{stdout}{stderr}"),
            (Err(err), _) | (_, Err(err)) => {
                write(&raw_log, format!("capture error: {err}")).await?;
                return Ok(TrialResult::Failure {
                    reason: TrialError::RawUnreadable(err.to_string()),
                    raw_log,
                });
            }
        };
        // retained for post-hoc debugging regardless of outcome
        write(&raw_log, &driver_output).await?;

        let sampler_output = match active_sampler {
            Some(sampler) => {
                let reply = tokio::select! {
                    reply = sampler.replies.recv_async() => reply?,
                    _ = ctrl_c() => return self.interrupt(child).await,
                };
                let SamplerReply::Finished(path) = reply;
                read_to_string(&path).await.ok()
            }
            None => None,
        };

        if let Err(reason) = self.driver.classify(status, &driver_output) {
            warn!("Trial {} failed: {reason}", spec.point.tag());
            return Ok(TrialResult::Failure { reason, raw_log });
        }

        let reply = self.driver.parse_reply(&driver_output);
        debug!(
            "point={} iops={} avg={}us",
            spec.point.tag(),
            reply.iops,
            reply.avg_us
        );
        let stage_path = spec.out_dir.join(STAGE_TABLE);
        let raw = RawMeasurement {
            driver_output,
            sampler_output,
            stage_table: stage_path.exists().then_some(stage_path),
        };
        let counters = telemetry::collect(&raw, &reply, &self.settings.events());
        let metrics = metrics::derive(&counters, spec.steady_time);
        Ok(TrialResult::Success { counters, metrics })
    }

    /// Terminates the driver and the sampler before propagating an
    /// external interrupt. The socket guard runs on unwind from here.
    async fn interrupt(&self, mut child: Child) -> Result<TrialResult> {
        warn!("Interrupted: terminating workload driver and counter sampler");
        _ = child.start_kill();
        _ = child.wait().await;
        if let Some(sampler) = self.sampler {
            _ = sampler.requests.send_async(SamplerRequest::Quit).await;
        }
        Err(TrialError::Interrupted.into())
    }
}

/// Removes the exclusive control socket when the trial scope ends.
struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if self.0.exists() {
            if let Err(err) = std::fs::remove_file(&self.0) {
                warn!("Could not remove control socket {}: {err}", self.0.display());
            }
        }
    }
}

async fn read_stream<R>(stream: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn drain_output(child: &mut Child) -> String {
    let mut text = String::new();
    for stream in [
        read_stream(child.stdout.take()).await,
        read_stream(child.stderr.take()).await,
    ] {
        if let Ok(part) = stream {
            text.push_str(&part);
        }
    }
    text
}
