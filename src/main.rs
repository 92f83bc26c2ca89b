#[macro_use]
extern crate tracing;

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;
use virt_tuner::libvirt::host_topology;
use virt_tuner::merge_config;
use virt_tuner::settings::{Settings, DEFAULT_LOG_LEVEL};
use virt_tuner::template::{find_template, list_templates};

/// VM definition tuner
#[derive(Parser, Debug)]
#[command(name = "virt-tuner", version, about, after_help = list_templates())]
struct Cli {
    /// Show debug messages
    #[arg(short, long)]
    debug: bool,

    /// libvirt connection URI, overrides the configured one
    #[arg(short = 'c', long)]
    connect: Option<String>,

    /// The template to apply to tune the virtual machine
    #[arg(long)]
    template: String,

    /// Path to virtual machine XML to tune or '-' to read it from standard input
    #[arg(value_name = "INPUT_PATH")]
    input: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let _ = dotenv::dotenv();
    let settings = Settings::load();

    let log_level = match (&settings, cli.debug) {
        (_, true) => "debug",
        (Ok(s), false) => s.log_level.as_str(),
        (Err(_), false) => DEFAULT_LOG_LEVEL,
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            EnvFilter::try_new(format!("virt_tuner={log_level}"))
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
        )
        .init();
    debug!(
        "virt-tuner {} {}",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );

    let result = settings
        .context("failed to load settings")
        .and_then(|settings| run(&cli, &settings));
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, settings: &Settings) -> Result<()> {
    let Some(template) = find_template(&cli.template) else {
        eprint!("{}", list_templates());
        bail!("Unknown template: {}", cli.template);
    };

    let definition = if cli.input == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read the definition from standard input")?;
        buf
    } else if Path::new(&cli.input).is_file() {
        std::fs::read_to_string(&cli.input)
            .with_context(|| format!("failed to read {}", cli.input))?
    } else {
        bail!("Input path has to point to a readable file");
    };

    let uri = cli.connect.as_deref().unwrap_or(&settings.libvirt_uri);
    let cells = host_topology(uri)?;
    info!("Applying template {}", template.name);
    let config = (template.function)(&cells)?;
    debug!("{config:#?}");

    let merged = merge_config(&definition, &config)?;
    let mut stdout = io::stdout().lock();
    stdout.write_all(&merged)?;
    writeln!(stdout)?;
    Ok(())
}
