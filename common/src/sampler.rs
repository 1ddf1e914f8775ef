use std::{path::PathBuf, process::Stdio};

use eyre::Result;
use flume::{Receiver, Sender};
use tokio::{process::Command, spawn, task::JoinHandle};
use tracing::{debug, error, warn};

use crate::util::core_list;

/// Sampler output filename inside a trial's retained directory.
pub const SAMPLER_FILENAME: &str = "counters.txt";

/// What the counter sampler attaches to for one trial.
#[derive(Debug, Clone)]
pub enum AttachMode {
    Pid(u32),
    Cores(Vec<u32>),
}

#[derive(Debug)]
pub enum SamplerRequest {
    Start {
        attach: AttachMode,
        dir: PathBuf,
        duration_secs: u64,
    },
    /// Quit the spawned [`tokio::task`], killing any in-flight child.
    Quit,
}

pub enum SamplerReply {
    /// The counter report is on disk at the given path. Sent even when
    /// the sampler failed; an unusable report parses to all-zero
    /// counters downstream.
    Finished(PathBuf),
}

/// Starts the counter-sampler task. One request per trial: the sampler
/// runs for the trial's steady window attached to the driver's pid or
/// the trial's cores, dumps its report, and replies.
pub fn start_sampler(
    program: String,
    events: Vec<String>,
    rx: Receiver<SamplerRequest>,
    tx: Sender<SamplerReply>,
) -> JoinHandle<Result<()>> {
    spawn(async move {
        debug!("Spawning counter sampler ({program})");
        loop {
            match rx.recv_async().await {
                Ok(SamplerRequest::Start {
                    attach,
                    dir,
                    duration_secs,
                }) => {
                    let report = sample_once(&program, &events, &attach, duration_secs, &rx).await;
                    let path = dir.join(SAMPLER_FILENAME);
                    let text = match report {
                        Ok(Some(text)) => text,
                        Ok(None) => {
                            // quit raced the trial; no reply expected
                            break;
                        }
                        Err(err) => {
                            error!("Counter sampler failed: {err:#?}");
                            format!("sampler error: {err}")
                        }
                    };
                    if let Err(err) = tokio::fs::write(&path, &text).await {
                        error!("Could not write {}: {err}", path.display());
                    }
                    tx.send_async(SamplerReply::Finished(path)).await?;
                }
                Ok(SamplerRequest::Quit) | Err(_) => break,
            }
        }
        debug!("Exiting counter sampler");
        Ok(())
    })
}

/// One bounded sampling window. Returns Ok(None) when a quit request
/// arrived mid-window and the child was killed.
async fn sample_once(
    program: &str,
    events: &[String],
    attach: &AttachMode,
    duration_secs: u64,
    rx: &Receiver<SamplerRequest>,
) -> Result<Option<String>> {
    let mut cmd = Command::new(program);
    cmd.args(["stat", "-x", ";", "-e", &events.join(",")]);
    match attach {
        AttachMode::Pid(pid) => {
            cmd.args(["-p", &pid.to_string()]);
        }
        AttachMode::Cores(cores) => {
            cmd.args(["-a", "-C", &core_list(cores)]);
        }
    }
    cmd.args(["--", "sleep", &duration_secs.to_string()]);
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    tokio::select! {
        status = child.wait() => {
            let status = status?;
            if !status.success() {
                warn!("Counter sampler exited with {status}");
            }
        }
        req = rx.recv_async() => {
            debug!("Counter sampler interrupted by {req:?}");
            _ = child.start_kill();
            _ = child.wait().await;
            return Ok(None);
        }
    }

    // the counter report is small; reading after exit cannot block
    let mut text = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        use tokio::io::AsyncReadExt;
        stdout.read_to_string(&mut text).await?;
    }
    if let Some(mut stderr) = child.stderr.take() {
        use tokio::io::AsyncReadExt;
        stderr.read_to_string(&mut text).await?;
    }
    Ok(Some(text))
}
