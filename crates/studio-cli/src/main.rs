use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use studio_core::ObjectStore;
use studio_runner::{
    artifact_store_keys, create_environment, list_environments, list_episodes, load_environment,
    load_episode, write_cancel_request, EnvironmentCreate, EpisodeConfig, EpisodeOrchestrator,
    HttpGateway, InjectionStrategy, LanguageHint, StudioConfig,
};

#[derive(Parser)]
#[command(name = "studio", version = "0.3.0", about = "Self-play bug injection and repair studio")]
struct Cli {
    /// Studio data directory (also SSR_STUDIO_DIR).
    #[arg(long, global = true)]
    studio_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StrategyArg {
    #[value(name = "direct")]
    Direct,
    #[value(name = "removal_only")]
    RemovalOnly,
    #[value(name = "history_aware")]
    HistoryAware,
}

impl From<StrategyArg> for InjectionStrategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Direct => InjectionStrategy::Direct,
            StrategyArg::RemovalOnly => InjectionStrategy::RemovalOnly,
            StrategyArg::HistoryAware => InjectionStrategy::HistoryAware,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LanguageArg {
    #[value(name = "unknown")]
    Unknown,
    #[value(name = "python")]
    Python,
    #[value(name = "javascript")]
    Javascript,
    #[value(name = "typescript")]
    Typescript,
    #[value(name = "go")]
    Go,
    #[value(name = "rust")]
    Rust,
    #[value(name = "java")]
    Java,
    #[value(name = "cpp")]
    Cpp,
}

impl From<LanguageArg> for LanguageHint {
    fn from(value: LanguageArg) -> Self {
        match value {
            LanguageArg::Unknown => LanguageHint::Unknown,
            LanguageArg::Python => LanguageHint::Python,
            LanguageArg::Javascript => LanguageHint::Javascript,
            LanguageArg::Typescript => LanguageHint::Typescript,
            LanguageArg::Go => LanguageHint::Go,
            LanguageArg::Rust => LanguageHint::Rust,
            LanguageArg::Java => LanguageHint::Java,
            LanguageArg::Cpp => LanguageHint::Cpp,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Manage target environments.
    #[command(subcommand)]
    Env(EnvCommands),
    /// Run one complete episode against an environment.
    Run {
        #[arg(long)]
        env: String,
        /// Episode config JSON file; flags below override its fields.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
        #[arg(long)]
        attempts: Option<u32>,
        #[arg(long)]
        alpha: Option<f64>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        json: bool,
    },
    /// Inspect recorded episodes.
    #[command(subcommand)]
    Episode(EpisodeCommands),
    /// Show the validation report of an episode.
    Validation {
        episode_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show the solver attempts of an episode.
    Attempts {
        episode_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Export an episode's artifact blobs as a zip bundle.
    Artifact {
        episode_id: String,
        #[arg(long)]
        out: PathBuf,
    },
    /// Request cooperative cancellation of a running episode.
    Cancel { episode_id: String },
}

#[derive(Subcommand)]
enum EnvCommands {
    Create {
        #[arg(long)]
        name: String,
        /// Docker image reference, or a local directory for process sandboxes.
        #[arg(long)]
        image: String,
        #[arg(long, value_enum, default_value = "unknown")]
        language: LanguageArg,
        #[arg(long)]
        notes: Option<String>,
    },
    List,
    Show { env_id: String },
}

#[derive(Subcommand)]
enum EpisodeCommands {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Show {
        episode_id: String,
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

fn resolve_studio_dir(cli_dir: &Option<PathBuf>) -> PathBuf {
    if let Some(dir) = cli_dir {
        return dir.clone();
    }
    if let Ok(dir) = std::env::var("SSR_STUDIO_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".ssr-studio")
}

fn run(cli: Cli) -> Result<()> {
    let studio_dir = resolve_studio_dir(&cli.studio_dir);
    let config = StudioConfig::from_env(&studio_dir)?;
    let paths = config.paths();

    match cli.command {
        Commands::Env(EnvCommands::Create {
            name,
            image,
            language,
            notes,
        }) => {
            let environment = create_environment(
                &paths,
                EnvironmentCreate {
                    name,
                    image_ref: image,
                    language_hint: language.into(),
                    notes,
                },
            )?;
            println!("{}", environment.env_id);
        }
        Commands::Env(EnvCommands::List) => {
            for environment in list_environments(&paths)? {
                println!(
                    "{}  {}  {}",
                    environment.env_id, environment.name, environment.image_ref
                );
            }
        }
        Commands::Env(EnvCommands::Show { env_id }) => {
            let environment = load_environment(&paths, &env_id)?;
            println!("{}", serde_json::to_string_pretty(&environment)?);
        }
        Commands::Run {
            env,
            config: config_file,
            strategy,
            attempts,
            alpha,
            seed,
            json,
        } => {
            let environment = load_environment(&paths, &env)?;
            let episode_config = resolve_episode_config(
                config_file.as_deref(),
                strategy.map(Into::into),
                attempts,
                alpha,
                seed,
            )?;
            let gateway = HttpGateway::new(config.gateway.clone()).map_err(|e| {
                anyhow!(
                    "{}; set SSR_STUDIO_GATEWAY_URL to an OpenAI-compatible endpoint",
                    e
                )
            })?;
            let orchestrator = EpisodeOrchestrator::new(config, Arc::new(gateway));
            let episode = orchestrator.run_episode(&environment, episode_config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&episode)?);
            } else {
                print_episode_summary_text(&serde_json::to_value(&episode)?);
            }
        }
        Commands::Episode(EpisodeCommands::List { status }) => {
            for summary in list_episodes(&paths)? {
                let value = serde_json::to_value(&summary)?;
                let summary_status = value["status"].as_str().unwrap_or("").to_string();
                if let Some(filter) = &status {
                    if &summary_status != filter {
                        continue;
                    }
                }
                println!(
                    "{}  {}  {}  valid={}  s={}  r_inject={}",
                    summary.episode_id,
                    summary_status,
                    summary.env_id,
                    render_opt(&value["artifact_valid"]),
                    render_opt(&value["solve_rate"]),
                    render_opt(&value["r_inject"]),
                );
            }
        }
        Commands::Episode(EpisodeCommands::Show { episode_id, json }) => {
            let episode = load_episode(&paths, &episode_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&episode)?);
            } else {
                print_episode_summary_text(&serde_json::to_value(&episode)?);
            }
        }
        Commands::Validation { episode_id, json } => {
            let episode = load_episode(&paths, &episode_id)?;
            let report = episode
                .validation_report
                .ok_or_else(|| anyhow!("episode {} has no validation report", episode_id))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("artifact: {}", report.artifact_id);
                println!("valid: {}", report.valid);
                for step in &report.steps {
                    let verdict = if step.passed { "pass" } else { "FAIL" };
                    let detail = step.error_message.as_deref().unwrap_or("");
                    println!(
                        "  {:<26} {}  {}ms  {}",
                        step.name.as_str(),
                        verdict,
                        step.duration_ms,
                        detail
                    );
                }
            }
        }
        Commands::Attempts { episode_id, json } => {
            let episode = load_episode(&paths, &episode_id)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&episode.solver_attempts)?);
            } else {
                for attempt in &episode.solver_attempts {
                    println!(
                        "#{} {}  success={}  passed={}  failed={}  steps={}  tokens={}",
                        attempt.attempt_number,
                        attempt.attempt_id,
                        attempt.success,
                        attempt.test_summary.passed,
                        attempt.test_summary.failed,
                        attempt.total_tool_steps,
                        attempt.total_tokens_used,
                    );
                }
            }
        }
        Commands::Artifact { episode_id, out } => {
            let episode = load_episode(&paths, &episode_id)?;
            let artifact_id = episode
                .artifact_id
                .ok_or_else(|| anyhow!("episode {} has no artifact", episode_id))?;
            export_artifact_bundle(&ObjectStore::new(&paths.store_dir), &artifact_id, &out)?;
            println!("wrote {}", out.display());
        }
        Commands::Cancel { episode_id } => {
            // Existence check first so a typo does not create a stray record.
            let _ = load_episode(&paths, &episode_id)?;
            write_cancel_request(&paths.episode_control(&episode_id))?;
            println!("cancellation requested for {}", episode_id);
        }
    }
    Ok(())
}

fn resolve_episode_config(
    config_file: Option<&std::path::Path>,
    strategy: Option<InjectionStrategy>,
    attempts: Option<u32>,
    alpha: Option<f64>,
    seed: Option<u64>,
) -> Result<EpisodeConfig> {
    let mut episode_config = match config_file {
        Some(path) => {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?;
            let value: Value = serde_json::from_str(&raw)?;
            studio_schemas::validate_episode_config(&value)?;
            serde_json::from_value(value)?
        }
        None => EpisodeConfig::default(),
    };
    if let Some(strategy) = strategy {
        episode_config.injection_strategy = strategy;
    }
    if let Some(attempts) = attempts {
        if attempts == 0 {
            return Err(anyhow!("--attempts must be at least 1"));
        }
        episode_config.solver_attempts = attempts;
    }
    if let Some(alpha) = alpha {
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(anyhow!("--alpha must lie in (0, 1]"));
        }
        episode_config.reward_alpha = alpha;
    }
    if let Some(seed) = seed {
        episode_config.random_seed = Some(seed);
    }
    Ok(episode_config)
}

fn render_opt(value: &Value) -> String {
    match value {
        Value::Null => "-".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_episode_summary_text(episode: &Value) {
    println!("episode: {}", episode["episode_id"].as_str().unwrap_or(""));
    println!("status: {}", episode["status"].as_str().unwrap_or(""));
    if let Some(message) = episode["error_message"].as_str() {
        println!("error: {}", message);
    }
    println!("artifact: {}", render_opt(&episode["artifact_id"]));
    if let Some(valid) = episode["validation_report"]["valid"].as_bool() {
        println!("artifact valid: {}", valid);
    }
    let attempts = episode["solver_attempts"].as_array().map(|a| a.len()).unwrap_or(0);
    println!("solver attempts: {}", attempts);
    println!("solve rate: {}", render_opt(&episode["solve_rate"]));
    println!("r_inject: {}", render_opt(&episode["r_inject"]));
    println!("r_solve_avg: {}", render_opt(&episode["r_solve_avg"]));
}

fn export_artifact_bundle(
    store: &ObjectStore,
    artifact_id: &str,
    out: &std::path::Path,
) -> Result<()> {
    if let Some(parent) = out.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = fs::File::create(out)
        .with_context(|| format!("cannot create bundle {}", out.display()))?;
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, key) in artifact_store_keys(artifact_id) {
        let bytes = store
            .read(&key)
            .with_context(|| format!("artifact blob missing: {}", key))?;
        zip.start_file(format!("artifact/{}", name), options)?;
        zip.write_all(&bytes)?;
    }
    zip.finish()?;
    Ok(())
}
