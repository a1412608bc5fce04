//! pandoc-unwasm CLI entry point.
//!
//! Converts documents with the Pandoc WebAssembly module, or prints the
//! bundled version and formats.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pandoc_unwasm_common::ConfigFile;
use pandoc_unwasm_converter::{ConversionOptions, ModuleSource, Pandoc};

/// Module location used when neither the flag, the environment, nor the
/// config file names one.
const DEFAULT_MODULE: &str = "./pandoc.wasm";

#[derive(Parser, Debug)]
#[command(name = "pandoc-unwasm", version, about = "Run the Pandoc WebAssembly build natively")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path or http(s) URL of the module. Overrides the config file.
    #[arg(long, global = true, env = "PANDOC_UNWASM_MODULE")]
    module: Option<String>,

    /// Forward the module's console output to the log.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert a document.
    Convert(ConvertArgs),
    /// Print the bundled version and supported formats.
    Info {
        /// Print as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Input format.
    #[arg(short, long)]
    from: String,

    /// Output format.
    #[arg(short, long)]
    to: String,

    #[arg(short, long)]
    standalone: bool,

    #[arg(long)]
    toc: bool,

    #[arg(long)]
    template: Option<String>,

    /// Template variable as KEY=VALUE. Repeatable.
    #[arg(short = 'V', long = "variable", value_parser = key_value)]
    variables: Vec<(String, String)>,

    /// Long option as KEY=VALUE, passed as `--KEY VALUE`. Repeatable.
    #[arg(long = "option", value_parser = key_value)]
    options: Vec<(String, String)>,

    /// Bare long option, passed as `--NAME`. Repeatable.
    #[arg(long = "flag")]
    flags: Vec<String>,

    /// Filter name. Repeatable, applied in order.
    #[arg(long = "filter")]
    filters: Vec<String>,

    /// Metadata field as KEY=VALUE. Repeatable.
    #[arg(short = 'M', long = "metadata", value_parser = key_value)]
    metadata: Vec<(String, String)>,

    /// Write output here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Input file. Reads stdin when absent or `-`.
    input: Option<PathBuf>,
}

impl ConvertArgs {
    fn to_options(&self) -> ConversionOptions {
        let mut options = ConversionOptions::new(&self.from, &self.to)
            .standalone(self.standalone)
            .toc(self.toc);
        if let Some(template) = &self.template {
            options = options.template(template);
        }
        for (key, value) in &self.variables {
            options = options.variable(key, value.as_str());
        }
        for (key, value) in &self.options {
            options = options.option(key, value.as_str());
        }
        for flag in &self.flags {
            options = options.option(flag, true);
        }
        for filter in &self.filters {
            options = options.filter(filter);
        }
        for (key, value) in &self.metadata {
            options = options.metadata(key, value.as_str());
        }
        options
    }

    fn read_input(&self) -> anyhow::Result<String> {
        match self.input.as_deref() {
            Some(path) if path.as_os_str() != "-" => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read input file '{}'", path.display())),
            _ => {
                let mut input = String::new();
                std::io::stdin()
                    .read_to_string(&mut input)
                    .context("Failed to read stdin")?;
                Ok(input)
            }
        }
    }
}

fn key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Logs go to stderr so converted output on stdout stays clean.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,pandoc_unwasm=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match &cli.command {
        Command::Info { json } => {
            print_info(*json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Convert(args) => convert(&cli, args).await,
    }
}

fn print_info(json: bool) -> anyhow::Result<()> {
    let info = pandoc_unwasm_converter::PandocInfo::bundled();
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        println!("pandoc {}", info.version);
        println!("input formats: {}", info.input_formats.join(", "));
        println!("output formats: {}", info.output_formats.join(", "));
    }
    Ok(())
}

async fn convert(cli: &Cli, args: &ConvertArgs) -> anyhow::Result<ExitCode> {
    let file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };
    let mut runtime = file.runtime;
    runtime.guest.debug |= cli.debug;

    let location = cli
        .module
        .clone()
        .or(file.module.source)
        .unwrap_or_else(|| DEFAULT_MODULE.to_string());
    let source = ModuleSource::parse(&location);
    info!(module = %source, "Configuration loaded");

    let options = args.to_options();
    if options.options.values().any(|v| matches!(v, Value::String(s) if s.is_empty())) {
        bail!("--option values must not be empty; use --flag for bare options");
    }
    let input = args.read_input()?;

    let pandoc = Pandoc::new(runtime, source)?;
    let result = pandoc
        .convert_detailed(&input, &options)
        .await
        .with_context(|| format!("Conversion from {} to {} failed", args.from, args.to))?;
    pandoc.dispose().await;

    for line in &result.log {
        eprintln!("{line}");
    }

    match &args.output {
        Some(path) => std::fs::write(path, &result.output)
            .with_context(|| format!("Failed to write output file '{}'", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(result.output.as_bytes())?;
            stdout.flush()?;
        }
    }

    debug!(exit_code = result.exit_code, "Done");
    if result.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        // Statuses outside 1..=255 still report failure.
        Ok(ExitCode::from(u8::try_from(result.exit_code).ok().filter(|c| *c != 0).unwrap_or(1)))
    }
}
