use anyhow::Result;
use clap::Parser;
use prettytable::{cell, row, Table};
use slcd_config::{Config, Settings, Workspace};
use std::{
    env,
    path::PathBuf,
};
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
/// SLCD experiment configuration tool
enum Opts {
    /// Print the aggregated settings
    Info {
        /// configuration file
        config_file: PathBuf,
        /// code directory of the experiment, defaults to the working directory
        #[clap(long)]
        code_dir: Option<PathBuf>,
    },
    /// Create the output directories and append the options log
    Setup {
        /// configuration file
        config_file: PathBuf,
        /// code directory of the experiment, defaults to the working directory
        #[clap(long)]
        code_dir: Option<PathBuf>,
    },
    /// Print the learning rate schedule
    Schedule {
        /// configuration file
        config_file: PathBuf,
        /// code directory of the experiment, defaults to the working directory
        #[clap(long)]
        code_dir: Option<PathBuf>,
    },
    /// Print the default configuration
    DefaultConfig,
}

fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    match Opts::parse() {
        Opts::Info {
            config_file,
            code_dir,
        } => {
            print_info(load_settings(config_file, code_dir)?)?;
        }
        Opts::Setup {
            config_file,
            code_dir,
        } => {
            setup(config_file, code_dir)?;
        }
        Opts::Schedule {
            config_file,
            code_dir,
        } => {
            print_schedule(load_settings(config_file, code_dir)?);
        }
        Opts::DefaultConfig => {
            let text = serde_json::to_string_pretty(&Config::default())?;
            println!("{}", text);
        }
    }

    Ok(())
}

fn open_workspace(code_dir: Option<PathBuf>) -> Result<Workspace> {
    match code_dir {
        Some(dir) => {
            let dir = if dir.is_absolute() {
                dir
            } else {
                env::current_dir()?.join(dir)
            };
            Workspace::from_code_dir(dir)
        }
        None => Workspace::current(),
    }
}

fn load_settings(config_file: PathBuf, code_dir: Option<PathBuf>) -> Result<Settings> {
    let config = Config::open(config_file)?;
    let workspace = open_workspace(code_dir)?;
    Settings::aggregate(config, &workspace)
}

fn print_info(settings: Settings) -> Result<()> {
    let mut table = Table::new();
    table.add_row(row!["key", "value"]);

    settings.entries()?.iter().for_each(|(key, value)| {
        table.add_row(row![key, value]);
    });

    table.printstd();
    Ok(())
}

fn setup(config_file: PathBuf, code_dir: Option<PathBuf>) -> Result<()> {
    let config = Config::open(config_file)?;
    let workspace = open_workspace(code_dir)?;
    let settings = Settings::setup(config, &workspace)?;
    let paths = settings.paths();

    info!("experiment {}", settings.exp());
    info!("visualization dir {}", paths.viz_dir.display());
    info!("weight dir {}", paths.save_folder.display());
    info!("options log {}", settings.log_path().display());
    Ok(())
}

fn print_schedule(settings: Settings) {
    let epochs = settings.config().training.epochs;
    let backbone_segments = settings.backbone_schedule().segments(epochs);
    let segments = settings.schedule().segments(epochs);

    let mut table = Table::new();
    table.add_row(row!["epochs", "backbone lr", "lr"]);

    backbone_segments
        .iter()
        .zip(segments.iter())
        .for_each(|(backbone, other)| {
            table.add_row(row![
                format!("{}..{}", other.epochs.start, other.epochs.end),
                format!("{:e}", backbone.lr),
                format!("{:e}", other.lr)
            ]);
        });

    table.printstd();
}
