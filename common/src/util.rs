use std::{path::Path, time::Duration};

use eyre::{Context, Result, bail};
use tokio::time::sleep;
use tracing::debug;

pub fn parse_request_size(request_size: &str) -> Result<u64> {
    let request_size = request_size.to_lowercase();
    if request_size.contains("k") {
        Ok(request_size
            .replace("k", "")
            .parse::<u64>()
            .context(format!("Parse request size: {request_size}"))?
            * 1024)
    } else if request_size.contains("m") {
        Ok(request_size
            .replace("m", "")
            .parse::<u64>()
            .context(format!("Parse request size: {request_size}"))?
            * 1024
            * 1024)
    } else if request_size.chars().all(|c| c.is_ascii_digit()) && !request_size.is_empty() {
        Ok(request_size
            .parse::<u64>()
            .context(format!("Parse request size: {request_size}"))?)
    } else {
        bail!("Unsupported request size {request_size}")
    }
}

/// Hex core mask for drivers taking `-c`/`-m` style arguments.
pub fn core_mask(cores: &[u32]) -> String {
    let mask = cores.iter().fold(0u64, |mask, core| mask | 1u64 << core);
    format!("0x{mask:x}")
}

/// Comma-separated core list for samplers taking `-C` style arguments.
pub fn core_list(cores: &[u32]) -> String {
    cores
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// Picks the first `count` online cores for count-based assignments.
pub fn auto_select_cores(count: u32) -> Result<Vec<u32>> {
    let available = num_cpus::get() as u32;
    if count == 0 {
        bail!("Core count must be at least 1");
    }
    if count > available {
        bail!("Requested {count} cores, only {available} available");
    }
    Ok((0..count).collect())
}

/// Bounded poll for a readiness path (e.g. a control socket brought up by
/// the driver). Returns false once the attempts are exhausted.
pub async fn wait_for_path(path: &Path, interval: Duration, attempts: u32) -> bool {
    for attempt in 0..attempts {
        if path.exists() {
            debug!("{} ready after {attempt} attempts", path.display());
            return true;
        }
        sleep(interval).await;
    }
    false
}
