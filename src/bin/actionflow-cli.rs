//! actionflow CLI - run and check action programs from the command line

use actionflow::runtime::loader::FileProgramSource;
use actionflow::runtime::response::Format;
use actionflow::runtime::services::BufferedExchange;
use actionflow::runtime::storage::Storage;
use actionflow::{Engine, EngineConfig, SubRequest};
use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "actionflow")]
#[command(about = "Interpreter for declarative action programs", long_about = None)]
struct Cli {
    /// Engine root directory (programs/, cache/, config.json)
    #[arg(short, long, default_value = ".actionflow")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize an engine root
    Init {
        /// Maximum sub-program nesting
        #[arg(long, default_value = "32")]
        max_call_depth: usize,

        /// Default output format (json, xml, xml-debug)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Run a program and print the response
    Run {
        /// Program id (path below programs/ without extension)
        program: String,

        /// Request parameter, `name=value` (repeatable)
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Request header, `Name: value` (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Print response header lines before the body
        #[arg(short, long)]
        include: bool,
    },

    /// Run a batch described by a JSON file (`{"key": {"program": ..., "params": {...}}}`)
    Batch {
        /// Batch description file
        file: PathBuf,
    },

    /// Parse and validate programs (all of them when none are named)
    Check {
        /// Program ids
        programs: Vec<String>,
    },

    /// List registered instructions
    Instructions,
}

fn open_engine(root: &Path) -> Result<Engine> {
    if Storage::new(root.to_path_buf()).config_path().exists() {
        Engine::load(root.to_path_buf())
    } else {
        Ok(Engine::new(EngineConfig::with_root(root)))
    }
}

fn parse_params(pairs: &[String]) -> Result<Map<String, Value>> {
    let mut params = Map::new();
    for pair in pairs {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("parameter '{pair}' is not name=value");
        };
        params.insert(name.trim().to_string(), Value::String(value.to_string()));
    }
    Ok(params)
}

fn exchange_with(headers: &[String]) -> Result<BufferedExchange> {
    let mut exchange = BufferedExchange::new();
    for line in headers {
        let Some((name, value)) = line.split_once(':') else {
            bail!("header '{line}' is not `Name: value`");
        };
        exchange = exchange.with_request_header(name.trim(), value.trim());
    }
    Ok(exchange)
}

fn print_exchange(exchange: &BufferedExchange, include_headers: bool) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    if include_headers {
        for line in exchange.headers() {
            writeln!(stdout, "{line}")?;
        }
        writeln!(stdout)?;
    }
    stdout.write_all(exchange.body())?;
    writeln!(stdout)?;
    Ok(())
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            max_call_depth,
            format,
        } => {
            let default_format: Format = serde_json::from_value(Value::String(format.clone()))
                .with_context(|| format!("unknown format '{format}'"))?;
            let config = EngineConfig {
                max_call_depth,
                default_format,
                ..EngineConfig::with_root(&cli.root)
            };
            Engine::init(&config)?;
            println!("Initialized actionflow root at {:?}", cli.root);
        }

        Commands::Run {
            program,
            params,
            headers,
            include,
        } => {
            let engine = open_engine(&cli.root)?;
            let mut exchange = exchange_with(&headers)?;
            engine.handle(&program, parse_params(&params)?, &mut exchange)?;
            print_exchange(&exchange, include)?;
        }

        Commands::Batch { file } => {
            let engine = open_engine(&cli.root)?;
            let data = std::fs::read(&file).with_context(|| format!("Failed to read {:?}", file))?;
            let requests: Map<String, Value> =
                serde_json::from_slice(&data).context("Batch file must be a JSON object")?;
            let mut batch = Vec::with_capacity(requests.len());
            for (key, request) in requests {
                let request: SubRequest = serde_json::from_value(request)
                    .with_context(|| format!("Invalid batch entry '{key}'"))?;
                batch.push((key, request));
            }
            let mut exchange = BufferedExchange::new();
            engine.handle_batch(batch, &mut exchange)?;
            print_exchange(&exchange, false)?;
        }

        Commands::Check { programs } => {
            let engine = open_engine(&cli.root)?;
            let programs = if programs.is_empty() {
                FileProgramSource::new(engine.config().program_root()).list()?
            } else {
                programs
            };
            let mut failures = 0;
            for id in &programs {
                match engine.load_program(id) {
                    Ok(program) => println!("ok      {id} ({} nodes)", program.nodes.len()),
                    Err(err) => {
                        failures += 1;
                        println!("FAILED  {id}: {err}");
                    }
                }
            }
            if failures > 0 {
                bail!("{failures} of {} programs failed validation", programs.len());
            }
        }

        Commands::Instructions => {
            let engine = open_engine(&cli.root)?;
            for name in engine.registry().list_instructions() {
                println!("{name}");
            }
        }
    }

    Ok(())
}
