use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use faultline::ir::Program;
use faultline::plugin::{PluginRegistry, parse_descriptor, plugin_from_descriptor};
use faultline::report::CollectingReporter;
use faultline::sarif::{build_invocation, build_sarif};
use faultline::session::{AnalysisSession, EngineOptions, core_plugin, detector_constructors};

/// CLI arguments for faultline execution.
#[derive(Parser, Debug)]
#[command(
    name = "faultline",
    about = "Dataflow-based defect finder for JVM program models, with SARIF output.",
    version
)]
struct Cli {
    /// JSON program model to analyze.
    #[arg(long, value_name = "PATH")]
    input: PathBuf,
    /// Additional plugin descriptor files.
    #[arg(long, value_name = "PATH")]
    plugin: Vec<PathBuf>,
    #[arg(long, value_name = "PATH")]
    output: Option<PathBuf>,
    /// Widen detector scope to referenced (non-application) classes.
    #[arg(long)]
    referenced_classes: bool,
    #[arg(long)]
    parallel: bool,
    /// Do not surface detector failures caused by unresolved methods.
    #[arg(long)]
    suppress_missing_class_warnings: bool,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();
    let cli = Cli::parse();
    run(cli)
}

fn run(cli: Cli) -> Result<()> {
    if !cli.input.exists() {
        anyhow::bail!("input not found: {}", cli.input.display());
    }

    let started_at = Instant::now();
    let text = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("failed to read {}", cli.input.display()))?;
    let program: Program = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse program model {}", cli.input.display()))?;
    let class_count = program.classes.len();

    let mut registry = PluginRegistry::with_core(core_plugin());
    let constructors = detector_constructors();
    for path in &cli.plugin {
        let descriptor_text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let descriptor = parse_descriptor(&descriptor_text)
            .with_context(|| format!("invalid plugin descriptor {}", path.display()))?;
        let plugin = plugin_from_descriptor(descriptor, &constructors)
            .with_context(|| format!("failed to load plugin {}", path.display()))?;
        registry.load(plugin)?;
    }

    let mut options = EngineOptions::default();
    options.analyze_referenced_classes = cli.referenced_classes;
    options.parallel = cli.parallel;
    options.suppress_missing_class_warnings = cli.suppress_missing_class_warnings;
    let session = AnalysisSession::new(Arc::new(program), &registry, options)?;
    let reporter = CollectingReporter::new();
    session.run(&reporter)?;
    if !cli.quiet {
        for message in reporter.messages() {
            eprintln!("{message}");
        }
    }
    let defects = reporter.into_defects();
    let defect_count = defects.len();

    let sarif = build_sarif(&defects, build_invocation());
    let mut writer = output_writer(cli.output.as_deref())?;
    serde_json::to_writer_pretty(&mut writer, &sarif)
        .context("failed to serialize SARIF output")?;
    writer
        .write_all(b"\n")
        .context("failed to write SARIF output")?;

    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} classes={} defects={}",
            started_at.elapsed().as_millis(),
            class_count,
            defect_count
        );
    }

    Ok(())
}

fn output_writer(output: Option<&Path>) -> Result<Box<dyn Write>> {
    match output {
        Some(path) if path == Path::new("-") => Ok(Box::new(io::stdout())),
        Some(path) => Ok(Box::new(
            File::create(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Ok(Box::new(io::stdout())),
    }
}
