use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Local;
use common::{
    config::{Config, Settings},
    driver::Driver,
    error::SetupError,
    sampler::{SamplerRequest, start_sampler},
    sink::ResultSink,
    sweep,
    trial::{SamplerChannels, TrialResult, TrialRunner, TrialSpec},
};
use console::style;
use eyre::Result;
use flume::unbounded;
use indicatif::{ProgressBar, ProgressStyle};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use tokio::{
    fs::{copy, create_dir_all, read_to_string},
    task::JoinHandle,
};
use tracing::{debug, error, warn};

pub async fn run_sweep(config_file: String, no_progress: bool) -> Result<()> {
    let config: Config = serde_yml::from_str(&read_to_string(&config_file).await?)?;
    let settings = &config.settings;

    // setup problems are fatal before any trial runs
    setup_checks(settings, &*config.driver)?;

    let file_prefix = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    println!(
        "Results created in folder: results/{}-{file_prefix}",
        config.name
    );
    let results_path = PathBuf::from("results").join(format!("{}-{file_prefix}", config.name));
    let raw_path = results_path.join("raw");
    create_dir_all(&raw_path).await?;
    copy(&config_file, results_path.join("config.yaml")).await?;

    let mut sink = ResultSink::create(&results_path, &config.name)?;

    let mut sampler_handle = None;
    let sampler = if settings.sampling {
        let (req_tx, req_rx) = unbounded();
        let (rep_tx, rep_rx) = unbounded();
        sampler_handle = Some(start_sampler(
            settings.sampler_program().to_owned(),
            settings.events().request_list(),
            req_rx,
            rep_tx,
        ));
        Some(SamplerChannels {
            requests: req_tx,
            replies: rep_rx,
        })
    } else {
        None
    };

    let points = sweep::enumerate(&config.sweep)?;
    debug!("Enumerated {} sweep points", points.len());
    let bar = if no_progress {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(points.len() as u64)
    };
    bar.set_style(ProgressStyle::with_template(
        "{bar:40} {pos}/{len} {msg}",
    )?);

    let runner = TrialRunner {
        settings,
        driver: &*config.driver,
        sampler: sampler.as_ref(),
    };

    let mut failures = 0usize;
    for point in points {
        let spec = TrialSpec::new(point, settings, &raw_path);
        bar.set_message(spec.point.tag());
        match runner.run(&spec).await {
            Ok(TrialResult::Success { counters, metrics }) => {
                sink.append(&spec.point, &counters, &metrics)?;
            }
            Ok(TrialResult::Failure { reason, raw_log }) => {
                failures += 1;
                warn!("{} failed: {reason}", spec.point.tag());
                sink.record_failure(&spec.point, &reason, &raw_log)?;
            }
            Err(err) => {
                error!("Sweep stopped: {err:#?}");
                _ = shutdown_sampler(sampler.as_ref(), sampler_handle.take()).await;
                return Err(err);
            }
        }
        bar.inc(1);
    }
    bar.finish();

    shutdown_sampler(sampler.as_ref(), sampler_handle).await?;

    if failures > 0 {
        println!(
            "{} {failures} failed trial(s); see {}",
            style("warning:").yellow().bold(),
            sink.error_path().display()
        );
    }
    debug!("Exiting");
    Ok(())
}

async fn shutdown_sampler(
    sampler: Option<&SamplerChannels>,
    handle: Option<JoinHandle<Result<()>>>,
) -> Result<()> {
    if let Some(sampler) = sampler {
        _ = sampler.requests.send_async(SamplerRequest::Quit).await;
    }
    if let Some(handle) = handle {
        handle.await??;
    }
    Ok(())
}

fn setup_checks(settings: &Settings, driver: &dyn Driver) -> Result<(), SetupError> {
    // bare program names resolve through PATH at spawn time; only
    // explicit paths can be checked up front
    let program = Path::new(&settings.driver_program);
    if program.components().count() > 1 && !program.exists() {
        return Err(SetupError::MissingDriver(program.to_path_buf()));
    }
    if settings.sampling {
        let sampler = Path::new(settings.sampler_program());
        if sampler.components().count() > 1 && !sampler.exists() {
            return Err(SetupError::MissingSampler(sampler.to_path_buf()));
        }
    }
    if let Some(socket) = driver.control_socket(settings) {
        if socket.exists() {
            reclaim_socket(&socket, &settings.driver_program, settings.force_reclaim())?;
        }
    }
    Ok(())
}

/// The control socket is exclusive: a leftover from a crashed run must
/// be dealt with before the first trial. A live owner is killed only
/// with force_reclaim; a socket nobody owns is never reclaimed
/// automatically since the crashed run may still hold device resources.
fn reclaim_socket(socket: &Path, driver_program: &str, force: bool) -> Result<(), SetupError> {
    let name = Path::new(driver_program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(driver_program);
    match find_process(name) {
        Some(pid) if force => {
            warn!(
                "Reclaiming {}: killing stale driver pid {pid}",
                socket.display()
            );
            if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                warn!("Could not kill stale driver {pid}: {err}");
            }
            std::thread::sleep(Duration::from_millis(200));
            std::fs::remove_file(socket).map_err(SetupError::Reclaim)?;
            Ok(())
        }
        Some(pid) => Err(SetupError::SocketBusy {
            socket: socket.to_path_buf(),
            pid,
        }),
        None => Err(SetupError::SocketStale(socket.to_path_buf())),
    }
}

/// Scans /proc for a process whose comm matches `name`. comm is
/// truncated to 15 bytes by the kernel.
fn find_process(name: &str) -> Option<i32> {
    let short = &name[..name.len().min(15)];
    for entry in std::fs::read_dir("/proc").ok()?.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<i32>() else {
            continue;
        };
        let Ok(comm) = std::fs::read_to_string(entry.path().join("comm")) else {
            continue;
        };
        if comm.trim() == short {
            return Some(pid);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_driver_executable_is_fatal() {
        let settings: Settings = serde_yml::from_str(
            "device: 0000:00:04.0\ndriver_program: /nonexistent/perf\nsteady_time: 30\nsampling: false\n",
        )
        .unwrap();
        let driver = default_drivers::SpdkPerf::default();
        assert!(matches!(
            setup_checks(&settings, &driver),
            Err(SetupError::MissingDriver(_))
        ));
    }

    #[test]
    fn bare_program_names_pass_setup() {
        let settings: Settings = serde_yml::from_str(
            "device: 0000:00:04.0\ndriver_program: \"true\"\nsteady_time: 30\nsampling: false\n",
        )
        .unwrap();
        let driver = default_drivers::SpdkPerf::default();
        assert!(setup_checks(&settings, &driver).is_ok());
    }

    #[test]
    fn unowned_stale_socket_is_fatal_even_with_force() {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("rpc.sock");
        std::fs::write(&socket, b"").unwrap();
        let settings: Settings = serde_yml::from_str(&format!(
            "device: Malloc0\ndriver_program: no-such-driver-name\nsteady_time: 30\nsampling: false\nsocket: {}\nforce_reclaim: true\n",
            socket.display()
        ))
        .unwrap();
        let driver = default_drivers::BdevPerf::default();
        assert!(matches!(
            setup_checks(&settings, &driver),
            Err(SetupError::SocketStale(_))
        ));
        // the file is left for the operator to inspect
        assert!(socket.exists());
    }
}
