use core::fmt::Debug;
use std::{path::PathBuf, process::ExitStatus};

use downcast_rs::{Downcast, impl_downcast};
use dyn_clone::{DynClone, clone_trait_object};
use serde::{Deserialize, Serialize};

use crate::{config::Settings, error::TrialError, trial::TrialSpec};

/// Typed summary a workload driver reports for one trial. Fields the
/// driver variant does not report stay zero.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadReply {
    pub iops: f64,
    pub avg_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    pub p50_us: f64,
    pub p99_us: f64,
    pub p999_us: f64,
    /// Explicit run status, for drivers that report one.
    pub status: Option<String>,
}

/// A workload driver variant: how to invoke the external generator for a
/// trial and how to read back what it measured.
#[typetag::serde(tag = "type")]
pub trait Driver: Debug + DynClone + Downcast + Send + Sync {
    fn name(&self) -> &'static str;

    /// Command line for one trial.
    fn args(&self, settings: &Settings, spec: &TrialSpec) -> Vec<String>;

    /// Extra arguments pointing the driver's file outputs (auxiliary stage
    /// timing table and the like) into the trial's retained directory.
    fn add_path_args(&self, _args: &mut Vec<String>, _dir: &std::path::Path) {}

    /// Control socket the driver brings up when it is commanded over RPC.
    /// Trials wait for it to appear before the steady window counts.
    fn control_socket(&self, _settings: &Settings) -> Option<PathBuf> {
        None
    }

    /// Success classification per the driver's reporting convention: exit
    /// status, success marker line, or explicit status field.
    fn classify(&self, status: ExitStatus, output: &str) -> Result<(), TrialError>;

    /// Extracts the typed reply from the captured output. Absent fields
    /// degrade to zero; this never fails on malformed text.
    fn parse_reply(&self, output: &str) -> WorkloadReply;
}
clone_trait_object!(Driver);
impl_downcast!(Driver);

/// Exit-status half of trial classification, shared by driver variants.
pub fn classify_exit(status: ExitStatus) -> Result<(), TrialError> {
    if status.success() {
        return Ok(());
    }
    match status.code() {
        Some(code) => Err(TrialError::DriverExit(code)),
        None => Err(TrialError::DriverSignalled),
    }
}
