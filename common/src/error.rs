use std::path::PathBuf;

use thiserror::Error;

/// Fatal problems detected before any trial runs. These abort the sweep
/// and are the only errors reflected in the process exit status.
#[derive(Error, Debug)]
pub enum SetupError {
    #[error("workload driver executable not found: {0}")]
    MissingDriver(PathBuf),
    #[error("counter sampler executable not found: {0}")]
    MissingSampler(PathBuf),
    #[error("control socket {socket} is held by pid {pid}; set force_reclaim to kill it")]
    SocketBusy { socket: PathBuf, pid: i32 },
    #[error("control socket {0} exists but no owning process was found; remove it manually")]
    SocketStale(PathBuf),
    #[error("could not create result dataset: {0}")]
    Sink(#[from] std::io::Error),
    #[error("could not write dataset header: {0}")]
    Header(#[from] csv::Error),
    #[error("could not reclaim control socket: {0}")]
    Reclaim(std::io::Error),
}

/// Per-trial failures. Recorded in the error log; the sweep continues.
#[derive(Error, Debug, Clone)]
pub enum TrialError {
    #[error("driver exited with status {0}")]
    DriverExit(i32),
    #[error("driver was terminated by a signal")]
    DriverSignalled,
    #[error("driver output is missing the {0:?} marker line")]
    MissingMarker(&'static str),
    #[error("driver reported status {0:?}, expected \"finished\"")]
    BadStatus(String),
    #[error("control socket {socket} did not appear after {attempts} attempts")]
    ReadyTimeout { socket: PathBuf, attempts: u32 },
    #[error("driver output could not be captured: {0}")]
    RawUnreadable(String),
    #[error("trial interrupted")]
    Interrupted,
}
