use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_dataset_downloader::app::{App, ProgressSink, RunParameters};
use kira_dataset_downloader::catalog::Catalog;
use kira_dataset_downloader::config::{ConfigLoader, Overrides};
use kira_dataset_downloader::domain::{PathTemplate, Selection, Split, SubsetTier, parse_scoped};
use kira_dataset_downloader::error::KiraError;
use kira_dataset_downloader::extract::Extractor;
use kira_dataset_downloader::filter::{ChunkStripe, SelectionCriteria};
use kira_dataset_downloader::output::{ConsoleOutput, JsonOutput, OutputMode};
use kira_dataset_downloader::pipeline::{Pipeline, PipelineOptions};
use kira_dataset_downloader::store::Store;
use kira_dataset_downloader::transfer::{TransferCoordinator, TransferMode, TransferSession};

#[derive(Parser)]
#[command(name = "kira-dd")]
#[command(about = "Download, verify and extract partitioned dataset archives through aria2")]
#[command(version, author)]
struct Cli {
    /// Domains to fetch (e.g. rgb normal), or `all`
    #[arg(required = true, num_args = 1..)]
    domains: Vec<String>,

    #[arg(long)]
    catalog: Option<String>,

    /// Components to fetch, or `all`
    #[arg(long, num_args = 1.., default_value = "all")]
    components: Vec<String>,

    #[arg(long, default_value = "debug")]
    subset: String,

    #[arg(long, default_value = "all")]
    split: String,

    #[arg(long)]
    dest: Option<PathBuf>,

    #[arg(long)]
    dest_compressed: Option<PathBuf>,

    /// Comma separated fields naming the extracted directory, e.g. domain,component,model
    #[arg(long)]
    output_structure: Option<PathTemplate>,

    #[arg(long)]
    keep_compressed: bool,

    #[arg(long)]
    only_download: bool,

    #[arg(long)]
    max_tries_per_model: Option<u32>,

    #[arg(long)]
    connections_total: Option<u32>,

    #[arg(long)]
    connections_per_server_per_download: Option<u32>,

    #[arg(long)]
    workers: Option<usize>,

    #[arg(long, default_value_t = 0)]
    chunk_index: usize,

    #[arg(long, default_value_t = 1)]
    total_chunks: usize,

    /// Download archives without checksums and skip verification
    #[arg(long)]
    ignore_checksum: bool,

    #[arg(long)]
    dry_run: bool,

    /// `none` runs a one-shot aria2c per archive instead of a daemon
    #[arg(long)]
    aria2_uri: Option<String>,

    #[arg(long)]
    aria2_secret: Option<String>,

    #[arg(long, allow_hyphen_values = true)]
    aria2_cmdline_opts: Option<String>,

    /// Connect to an already running aria2 daemon
    #[arg(long)]
    no_aria2_server: bool,

    #[arg(long)]
    config: Option<String>,

    #[arg(long)]
    non_interactive: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(kira) = report.downcast_ref::<KiraError>() {
            return ExitCode::from(map_exit_code(kira));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &KiraError) -> u8 {
    match error {
        KiraError::MissingChecksums { .. } => 1,
        KiraError::InvalidCatalog(_)
        | KiraError::MissingCatalog
        | KiraError::CatalogRead(_)
        | KiraError::InvalidChecksum(_)
        | KiraError::InvalidIdentifier(_)
        | KiraError::InvalidPathTemplate(_)
        | KiraError::InvalidChunk { .. }
        | KiraError::ConfigRead(_)
        | KiraError::ConfigParse(_) => 2,
        KiraError::Aria2Rpc(_) | KiraError::Aria2Status { .. } | KiraError::MissingTool(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.non_interactive {
        OutputMode::NonInteractive
    } else {
        OutputMode::Interactive
    };

    let config = ConfigLoader::load(cli.config.as_deref())?;
    let resolved = ConfigLoader::resolve_config(config, build_overrides(&cli))?;

    let criteria = SelectionCriteria {
        domains: Selection::from_values(&cli.domains),
        components: Selection::from_values(&cli.components),
        subset: parse_scoped::<SubsetTier>(&cli.subset)?,
        split: parse_scoped::<Split>(&cli.split)?,
    };
    let stripe = ChunkStripe::new(cli.chunk_index, cli.total_chunks)?;
    let verify_checksums = !cli.ignore_checksum;

    let app = App::new(Catalog::load(&resolved.catalog)?);
    let archives = app.select(&criteria, stripe, verify_checksums)?;

    let store = Store::from_std_paths(
        &resolved.dest,
        &resolved.dest_compressed,
        resolved.template.clone(),
    )?;
    let options = PipelineOptions {
        workers: resolved.workers.max(1),
        keep_compressed: cli.keep_compressed,
        download_only: cli.only_download,
        dry_run: cli.dry_run,
    };
    let parameters = RunParameters {
        catalog: resolved.catalog.clone(),
        criteria,
        stripe,
        dest: store.dataset_root().to_string(),
        dest_compressed: store.compressed_root().to_string(),
        output_structure: resolved.template.to_string(),
        budget: resolved.budget,
        max_attempts: resolved.max_attempts,
        verify_checksums,
        transfer: describe_transfer(&resolved.transfer),
        pipeline: options,
    };

    if matches!(output_mode, OutputMode::Interactive) {
        ConsoleOutput::print_banner(&parameters);
    }

    let extractor = Extractor::new(store);
    let (pipeline, daemon) = if cli.dry_run {
        (Pipeline::planner(extractor, options), None)
    } else {
        let (backend, daemon) =
            TransferSession::open(&resolved.transfer, resolved.budget, resolved.ready_timeout)?
                .into_parts();
        let coordinator =
            TransferCoordinator::new(backend, resolved.max_attempts, verify_checksums);
        (Pipeline::new(coordinator, extractor, options), daemon)
    };

    let sink: &dyn ProgressSink = match output_mode {
        OutputMode::Interactive => &ConsoleOutput,
        OutputMode::NonInteractive => &JsonOutput,
    };
    let summary = app.run(&pipeline, &archives, parameters, sink);
    if let Some(daemon) = daemon {
        daemon.stop();
    }
    let summary = summary?;

    match output_mode {
        OutputMode::Interactive => ConsoleOutput::print_recap(&summary),
        OutputMode::NonInteractive => {
            JsonOutput::print_summary(&summary).into_diagnostic()?
        }
    }
    Ok(())
}

fn build_overrides(cli: &Cli) -> Overrides {
    Overrides {
        catalog: cli.catalog.clone(),
        dest: cli.dest.clone(),
        dest_compressed: cli.dest_compressed.clone(),
        output_structure: cli.output_structure.clone(),
        connections_total: cli.connections_total,
        connections_per_server_per_download: cli.connections_per_server_per_download,
        workers: cli.workers,
        max_tries_per_model: cli.max_tries_per_model,
        aria2_uri: cli.aria2_uri.clone(),
        aria2_secret: cli.aria2_secret.clone(),
        aria2_cmdline_opts: cli.aria2_cmdline_opts.clone(),
        no_aria2_server: cli.no_aria2_server,
    }
}

fn describe_transfer(mode: &TransferMode) -> String {
    match mode {
        TransferMode::Direct { .. } => "aria2c per archive".to_string(),
        TransferMode::Daemon(settings) if settings.create_server => {
            format!("aria2 daemon at {} (spawned)", settings.uri)
        }
        TransferMode::Daemon(settings) => format!("aria2 daemon at {}", settings.uri),
    }
}
