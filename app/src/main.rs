use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use common::{config::Config, driver::Driver as _, trial::TrialSpec};
use eyre::Result;
use tokio::fs::{create_dir_all, read_dir, read_to_string};
use tracing::error;
use tracing_subscriber::{
    EnvFilter,
    fmt::{layer, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

mod run;

#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, default_value_t = false)]
    no_progress: bool,
    #[arg(short, long)]
    log: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// List completed sweep runs
    Ls,
    /// Run a sweep
    Bench {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
    },
    /// Print the generated driver commands without running them
    Print {
        #[arg(short, long, default_value = "config.yaml")]
        config_file: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let modules = ["common", "spdk_perf", "bdevperf"];
    let log_level = std::env::var("RUST_LOG").unwrap_or("warn".to_owned());
    let args = Cli::parse();
    let file_appender = tracing_appender::rolling::never(".", "log.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let mut env_filter = EnvFilter::new(format!("nvme_sweep={log_level}"));

    if !args.log.is_empty() {
        for log in &args.log {
            env_filter = env_filter.add_directive(log.parse()?);
        }
    }

    for module in modules {
        if !args.log.iter().any(|x| x.starts_with(module)) {
            env_filter = env_filter.add_directive(format!("{module}={log_level}").parse()?);
        }
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            layer()
                .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
                .compact(),
        )
        .with(layer().with_writer(non_blocking))
        .init();

    default_drivers::init_drivers();

    create_dir_all("results").await?;
    match args.command {
        Commands::Ls => list_runs().await?,
        Commands::Bench { config_file } => {
            if let Err(err) = run::run_sweep(config_file, args.no_progress).await {
                error!("{err:#?}");
                return Err(err);
            }
        }
        Commands::Print { config_file } => print_commands(&config_file).await?,
    };

    Ok(())
}

async fn list_runs() -> Result<()> {
    for (name, folder) in get_runs().await? {
        println!(
            "{} -> {}",
            name,
            folder.file_name().unwrap().to_str().unwrap()
        );
    }
    Ok(())
}

async fn get_runs() -> Result<Vec<(String, PathBuf)>> {
    let mut items = read_dir("results").await?;
    let mut results = Vec::new();
    while let Ok(Some(entry)) = items.next_entry().await {
        if entry.file_type().await?.is_dir() {
            let config_file = entry.path().join("config.yaml");
            if config_file.exists() {
                let config: Config = serde_yml::from_str(&read_to_string(config_file).await?)?;
                results.push((config.name, entry.path()));
            }
        }
    }
    Ok(results)
}

async fn print_commands(config_file: &str) -> Result<()> {
    let config: Config = serde_yml::from_str(&read_to_string(config_file).await?)?;
    for point in common::sweep::enumerate(&config.sweep)? {
        let spec = TrialSpec::new(point, &config.settings, Path::new("raw"));
        let mut args = config.driver.args(&config.settings, &spec);
        config.driver.add_path_args(&mut args, &spec.out_dir);
        println!("{} {}", config.settings.driver_program, args.join(" "));
    }
    Ok(())
}
