//! Charforge CLI
//!
//! Validates parameter sets, previews prompts and runs character image
//! generations against the configured providers.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use charforge_orchestrator::{
    Config, GenerationOrchestrator, GenerationRecord, GenerationStatus, Pagination,
    ProviderStatus, RecordFilter, StatusView, SubmitResponse,
};
use charforge_prompt::{
    validate, Catalog, FrameType, ParameterSet, PromptAssembler, ValidationOutcome,
};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

/// Poll interval while waiting for a generation (in milliseconds).
const POLL_INTERVAL_MS: u64 = 250;

/// Exit code for a rejected parameter set.
const EXIT_INVALID: u8 = 2;

/// Charforge - Character Image Generation
///
/// Turns a pose, outfit, footwear, accessory and narrative frame into a
/// prompt and generates the image through the configured providers.
#[derive(Parser, Debug)]
#[command(name = "charforge")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (default: charforge.json in current directory)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<String>,

    /// Enable verbose output (sets log level to debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List every catalog id
    Catalog,
    /// Check a parameter set for compatibility
    Validate(ParamArgs),
    /// Print the prompts a parameter set assembles to
    Prompt(ParamArgs),
    /// Generate an image and wait for the result
    Generate {
        #[command(flatten)]
        params: ParamArgs,

        /// User the generation is recorded for
        #[arg(short, long, default_value = "local")]
        user: String,

        /// Seconds to wait for a terminal state
        #[arg(long, default_value_t = 600)]
        wait_secs: u64,
    },
    /// Show one generation record
    Status {
        /// Image id returned by `generate`
        image_id: String,
    },
    /// List a user's generation records, newest first
    List {
        /// Owner of the records
        #[arg(short, long)]
        user: String,

        /// Only show records in this status
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        /// Records to skip
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Maximum records to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Probe providers and show their health
    Providers,
}

/// Parameter set flags shared by several commands.
#[derive(ClapArgs, Debug)]
struct ParamArgs {
    /// Pose id
    #[arg(long)]
    pose: String,

    /// Outfit id
    #[arg(long)]
    outfit: String,

    /// Footwear id
    #[arg(long)]
    footwear: String,

    /// Accessory id
    #[arg(long)]
    accessory: Option<String>,

    /// Narrative frame type
    #[arg(long, value_enum)]
    frame_type: Option<FrameArg>,

    /// Frame id (required for onboarding and sequence frames)
    #[arg(long)]
    frame_id: Option<String>,
}

impl ParamArgs {
    fn to_params(&self) -> ParameterSet {
        ParameterSet {
            pose: self.pose.clone(),
            outfit: self.outfit.clone(),
            footwear: self.footwear.clone(),
            accessory: self.accessory.clone(),
            frame_type: self.frame_type.map(FrameType::from),
            frame_id: self.frame_id.clone(),
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FrameArg {
    Standard,
    Onboarding,
    Sequence,
}

impl From<FrameArg> for FrameType {
    fn from(arg: FrameArg) -> Self {
        match arg {
            FrameArg::Standard => Self::Standard,
            FrameArg::Onboarding => Self::Onboarding,
            FrameArg::Sequence => Self::Sequence,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StatusArg {
    Pending,
    Complete,
    Failed,
}

impl From<StatusArg> for GenerationStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => Self::Pending,
            StatusArg::Complete => Self::Complete,
            StatusArg::Failed => Self::Failed,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(config = ?args.config, "Config file");

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config = load_config(args.config.as_deref())?;
    let json = args.json;

    match args.command {
        Command::Catalog => {
            let catalog = load_catalog(&config)?;
            print_catalog(&catalog, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate(params) => {
            let catalog = load_catalog(&config)?;
            let outcome = validate(&params.to_params(), &catalog);
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            Ok(outcome_exit_code(&outcome))
        }
        Command::Prompt(params) => {
            let catalog = load_catalog(&config)?;
            let params = params.to_params();
            let outcome = validate(&params, &catalog);
            if !outcome.is_valid {
                print_outcome(&outcome);
                return Ok(ExitCode::from(EXIT_INVALID));
            }
            let prompt = PromptAssembler::new(&catalog).assemble(&params)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&prompt)?);
            } else {
                println!("=== Positive Prompt ===");
                println!("{}", prompt.positive);
                println!();
                println!("=== Negative Prompt ===");
                println!("{}", prompt.negative);
                println!();
                println!("Parameters hash: {}", prompt.parameters_hash);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Generate {
            params,
            user,
            wait_secs,
        } => generate(&config, &params.to_params(), &user, wait_secs, json).await,
        Command::Status { image_id } => {
            let orchestrator = GenerationOrchestrator::from_config(&config).await?;
            let view = orchestrator.get_status(&image_id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&view)?);
            } else {
                print_status(&view);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::List {
            user,
            status,
            offset,
            limit,
        } => {
            let orchestrator = GenerationOrchestrator::from_config(&config).await?;
            let records = orchestrator
                .list_by_user(
                    &user,
                    RecordFilter {
                        status: status.map(GenerationStatus::from),
                    },
                    Pagination { offset, limit },
                )
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Providers => {
            let orchestrator = GenerationOrchestrator::from_config(&config).await?;
            orchestrator.registry().run_health_checks().await;
            let statuses = orchestrator.registry().snapshot().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                print_providers(&statuses);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Submits one generation and waits for it to finish.
async fn generate(
    config: &Config,
    params: &ParameterSet,
    user: &str,
    wait_secs: u64,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let orchestrator = GenerationOrchestrator::from_config(config).await?;

    let accepted = match orchestrator.submit(params.clone(), user).await? {
        SubmitResponse::Accepted(accepted) => accepted,
        SubmitResponse::Rejected(outcome) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                print_outcome(&outcome);
            }
            return Ok(ExitCode::from(EXIT_INVALID));
        }
    };

    if !json {
        println!("Accepted: {}", accepted.image_id);
        println!(
            "  Estimated completion: {}",
            accepted.estimated_completion.to_rfc3339()
        );
        println!("Waiting for generation...");
    }

    let record = orchestrator
        .wait_for_terminal(
            &accepted.image_id,
            Duration::from_millis(POLL_INTERVAL_MS),
            Duration::from_secs(wait_secs),
        )
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        println!();
        print_record(&record);
    }

    Ok(if record.status == GenerationStatus::Complete {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    })
}

/// Loads configuration from file or defaults.
fn load_config(config_path: Option<&str>) -> anyhow::Result<Config> {
    let config = match config_path {
        Some(path) => {
            tracing::info!(path = %path, "Loading config from specified path");
            Config::load_from_file(Path::new(path))?
        }
        None => {
            tracing::debug!("Loading config from current directory");
            Config::load()?
        }
    };
    Ok(config)
}

/// Loads the configured catalog, or the built-in one.
fn load_catalog(config: &Config) -> anyhow::Result<Catalog> {
    match &config.catalog {
        Some(path) => {
            tracing::debug!(path = %path, "Loading catalog file");
            Ok(Catalog::from_json_file(Path::new(path))?)
        }
        None => Ok(Catalog::builtin()),
    }
}

fn outcome_exit_code(outcome: &ValidationOutcome) -> ExitCode {
    if outcome.is_valid {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_INVALID)
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_catalog(catalog: &Catalog, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&catalog.to_file_data())?);
        return Ok(());
    }

    print_section("Poses", catalog.poses().map(|e| (&e.id, &e.name)));
    print_section("Outfits", catalog.outfits().map(|e| (&e.id, &e.name)));
    print_section("Footwear", catalog.all_footwear().map(|e| (&e.id, &e.name)));
    print_section("Accessories", catalog.accessories().map(|e| (&e.id, &e.name)));

    println!("Frames:");
    for frame in catalog.frames() {
        println!("  {:<28} {} ({})", frame.id, frame.name, frame.frame_type);
    }
    Ok(())
}

fn print_section<'a>(title: &str, entries: impl Iterator<Item = (&'a String, &'a String)>) {
    println!("{title}:");
    for (id, name) in entries {
        println!("  {id:<28} {name}");
    }
    println!();
}

fn print_outcome(outcome: &ValidationOutcome) {
    if outcome.is_valid {
        println!("Valid parameter set");
    } else {
        println!("Invalid parameter set");
    }

    for issue in &outcome.errors {
        println!("  [{}] {}: {}", issue.severity, issue.field, issue.message);
        if let Some(suggestion) = &issue.suggestion {
            println!("      Suggestion: {suggestion}");
        }
    }

    for alternatives in &outcome.alternative_options {
        println!(
            "  Compatible {}: {}",
            alternatives.field,
            alternatives.options.join(", ")
        );
    }
}

fn print_status(view: &StatusView) {
    print_record(&view.record);
    if let Some(estimate) = view.estimated_completion {
        println!("  Estimated completion: {}", estimate.to_rfc3339());
    }
}

fn print_record(record: &GenerationRecord) {
    println!("=== Generation {} ===", record.image_id);
    println!("Status: {}", record.status);
    println!("User: {}", record.user_id);
    println!("Created: {}", record.created_at.to_rfc3339());
    if let Some(provider) = &record.service_used {
        println!("Provider: {provider}");
    }
    if let Some(url) = &record.public_url {
        println!("Image: {url}");
    }
    if let Some(ms) = record.generation_time_ms {
        println!("Generation time: {ms}ms");
    }
    if let Some(message) = &record.error_message {
        println!("Error: {message}");
    }
}

fn print_records(records: &[GenerationRecord]) {
    if records.is_empty() {
        println!("No generations found");
        return;
    }
    for record in records {
        println!(
            "{}  {:<8}  {}  {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.status.to_string(),
            record.image_id,
            record
                .public_url
                .as_deref()
                .or(record.error_message.as_deref())
                .unwrap_or("-")
        );
    }
}

fn print_providers(statuses: &[ProviderStatus]) {
    if statuses.is_empty() {
        println!("No providers configured");
        return;
    }
    for status in statuses {
        let state = if !status.enabled {
            "disabled"
        } else if status.health.is_healthy {
            "healthy"
        } else {
            "unhealthy"
        };
        println!(
            "{:<20} priority {:<4} {:<10} circuit {:<10} requests {} ({:.0}% ok, avg {:.0}ms)",
            status.name,
            status.priority,
            state,
            status.circuit.state.to_string(),
            status.health.total_requests,
            status.health.success_rate() * 100.0,
            status.health.average_response_time_ms
        );
    }
}
