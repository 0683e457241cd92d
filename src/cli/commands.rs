//! CLI command definitions for taskrelay.
//!
//! Every command builds its store, queue and generator from `Settings`, so
//! the same binary acts as producer, worker or inspector.

use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use uuid::Uuid;

use crate::client::{Dispatcher, Poller, DEFAULT_MAX_ATTEMPTS};
use crate::config::{ConfigError, Settings};
use crate::error::PollError;
use crate::generation::{Generator, LlmGenerator};
use crate::llm::OpenAiCompatibleClient;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{MemoryWorkQueue, RedisWorkQueue, WorkQueue, WorkerPool};
use crate::store::{MemoryTaskStore, RedisTaskStore, TaskStore};
use crate::task::{Metadata, Task, TaskStatus};

/// Width of the separator lines in human-readable output.
const RULE_WIDTH: usize = 70;

/// Asynchronous text generation relay.
#[derive(Parser)]
#[command(name = "taskrelay")]
#[command(about = "Submit text generation tasks, run workers and poll results")]
#[command(version)]
#[command(
    long_about = "taskrelay dispatches text generation tasks through a work queue to a pool of workers and stores results in Redis.\n\nExample usage:\n  taskrelay worker --workers 2\n  taskrelay submit \"Write a haiku about Rust\" --wait"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL (overrides REDIS_URL and REDIS_HOST/PORT/PASSWORD/DB).
    #[arg(long, global = true)]
    pub redis_url: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Submit a prompt and print its task id.
    Submit(SubmitArgs),

    /// Print the current state of a task as JSON.
    Status(StatusArgs),

    /// Poll a task until it completes or fails.
    Wait(WaitArgs),

    /// Run a worker pool until Ctrl-C.
    Worker(WorkerArgs),

    /// Run the sample client scenarios.
    Demo(DemoArgs),

    /// Show queue statistics and dead letters.
    Stats(StatsArgs),

    /// Verify the Redis connection.
    Check,
}

/// Polling options shared by `submit --wait` and `wait`.
#[derive(clap::Args, Debug, Clone)]
pub struct PollArgs {
    /// Seconds between status reads.
    #[arg(long, default_value = "1.0")]
    pub interval: f64,

    /// Maximum number of status reads.
    #[arg(long, default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,
}

impl PollArgs {
    fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval.max(0.0))
    }
}

/// Arguments for `taskrelay submit`.
#[derive(Parser, Debug)]
pub struct SubmitArgs {
    /// Prompt text.
    pub prompt: String,

    /// Metadata as a JSON object.
    #[arg(short, long)]
    pub metadata: Option<String>,

    /// Wait for the result after submitting.
    #[arg(short, long)]
    pub wait: bool,

    #[command(flatten)]
    pub poll: PollArgs,
}

/// Arguments for `taskrelay status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    pub task_id: Uuid,
}

/// Arguments for `taskrelay wait`.
#[derive(Parser, Debug)]
pub struct WaitArgs {
    pub task_id: Uuid,

    #[command(flatten)]
    pub poll: PollArgs,
}

/// Which generator a worker uses.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorKind {
    /// Random delay, echoed prompt.
    Mock,
    /// OpenAI-compatible endpoint from LLM_API_BASE.
    Llm,
}

/// Arguments for `taskrelay worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Number of workers (overrides NUM_WORKERS).
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Deliveries per worker (overrides PREFETCH_COUNT).
    #[arg(long)]
    pub prefetch: Option<usize>,

    /// Generator backend.
    #[arg(short, long, value_enum, default_value = "mock")]
    pub generator: GeneratorKind,
}

/// Demo scenarios.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoMode {
    /// One request, then poll for its result.
    Single,
    /// Several requests submitted together, then polled in order.
    Multiple,
    /// Submit the sample API requests without waiting.
    Api,
    /// Read prompts from stdin.
    Interactive,
}

/// Arguments for `taskrelay demo`.
#[derive(Parser, Debug)]
pub struct DemoArgs {
    #[arg(short, long, value_enum, default_value = "single")]
    pub mode: DemoMode,

    /// Run store, queue and a mock worker pool in this process.
    #[arg(long)]
    pub in_memory: bool,

    #[command(flatten)]
    pub poll: PollArgs,
}

/// Arguments for `taskrelay stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Number of dead-letter entries to show.
    #[arg(short, long, default_value = "10")]
    pub dead_letters: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::from_env()?;
    if let Some(url) = cli.redis_url {
        settings = settings.with_redis_url(url);
    }

    match cli.command {
        Commands::Submit(args) => run_submit_command(&settings, args).await,
        Commands::Status(args) => run_status_command(&settings, args).await,
        Commands::Wait(args) => run_wait_command(&settings, args).await,
        Commands::Worker(args) => run_worker_command(settings, args).await,
        Commands::Demo(args) => run_demo_command(settings, args).await,
        Commands::Stats(args) => run_stats_command(&settings, args).await,
        Commands::Check => run_check_command(&settings).await,
    }
}

// ============================================================================
// Backends
// ============================================================================

/// Store and queue handles used by one command.
struct Backends {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
}

impl Backends {
    async fn redis(settings: &Settings) -> anyhow::Result<Self> {
        let url = settings.redis_url();
        let store = RedisTaskStore::connect(&url)
            .await
            .with_context(|| format!("connecting task store to {}", url))?
            .with_prefix(settings.task_prefix.clone())
            .with_ttl(settings.task_ttl);
        let queue = RedisWorkQueue::connect(&url, settings.queue_config())
            .await
            .with_context(|| format!("connecting work queue to {}", url))?;

        Ok(Self {
            store: Arc::new(store),
            queue: Arc::new(queue),
        })
    }

    fn in_memory(settings: &Settings) -> Self {
        Self {
            store: Arc::new(MemoryTaskStore::new(settings.task_ttl)),
            queue: Arc::new(MemoryWorkQueue::new(settings.queue_config())),
        }
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.store), Arc::clone(&self.queue))
    }

    fn poller(&self) -> Poller {
        Poller::new(Arc::clone(&self.store))
    }
}

fn build_generator(settings: &Settings, kind: GeneratorKind) -> anyhow::Result<Arc<dyn Generator>> {
    match kind {
        GeneratorKind::Mock => Ok(Arc::new(settings.mock_generator())),
        GeneratorKind::Llm => {
            let api_base = settings
                .llm_api_base
                .clone()
                .ok_or_else(|| ConfigError::MissingEnvVar("LLM_API_BASE".to_string()))?;
            let client = OpenAiCompatibleClient::new(
                api_base,
                settings.llm_api_key.clone(),
                settings.llm_model.clone(),
            )?;
            Ok(Arc::new(LlmGenerator::new(client, settings.llm_settings())))
        }
    }
}

fn parse_metadata(raw: Option<&str>) -> anyhow::Result<Metadata> {
    let Some(raw) = raw else {
        return Ok(Metadata::new());
    };
    match serde_json::from_str::<serde_json::Value>(raw).context("parsing --metadata")? {
        serde_json::Value::Object(map) => Ok(map),
        other => anyhow::bail!("--metadata must be a JSON object, got {}", other),
    }
}

fn metadata_from(value: serde_json::Value) -> Metadata {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

// ============================================================================
// Client commands
// ============================================================================

async fn run_submit_command(settings: &Settings, args: SubmitArgs) -> anyhow::Result<()> {
    let metadata = parse_metadata(args.metadata.as_deref())?;
    let backends = Backends::redis(settings).await?;

    let task_id = backends.dispatcher().submit(&args.prompt, metadata).await?;
    println!("{}", task_id);

    if args.wait {
        let task = wait_verbose(&backends.poller(), task_id, &args.poll).await?;
        display_result(&task);
    }
    Ok(())
}

async fn run_status_command(settings: &Settings, args: StatusArgs) -> anyhow::Result<()> {
    let backends = Backends::redis(settings).await?;
    let view = backends.poller().status(args.task_id).await?;
    println!("{}", serde_json::to_string_pretty(&view)?);
    Ok(())
}

async fn run_wait_command(settings: &Settings, args: WaitArgs) -> anyhow::Result<()> {
    let backends = Backends::redis(settings).await?;
    let task = wait_verbose(&backends.poller(), args.task_id, &args.poll).await?;
    display_result(&task);
    Ok(())
}

/// Polls with progress output, one line per status read.
async fn wait_verbose(poller: &Poller, task_id: Uuid, poll: &PollArgs) -> anyhow::Result<Task> {
    println!("\nPolling for result (task: {})...", short_id(task_id));

    let max_attempts = poll.max_attempts.max(1);
    for attempt in 1..=max_attempts {
        // One read per attempt keeps the progress lines honest
        match poller.wait(task_id, Duration::ZERO, 1).await {
            Ok(task) => {
                println!("   [{}/{}] Status: {}", attempt, max_attempts, task.status);
                return Ok(task);
            }
            Err(PollError::Timeout { last_status, .. }) => {
                println!("   [{}/{}] Status: {}", attempt, max_attempts, last_status);
            }
            Err(e) => return Err(e.into()),
        }
        if attempt < max_attempts {
            tokio::time::sleep(poll.interval()).await;
        }
    }

    anyhow::bail!("task {} not finished after {} attempts", task_id, max_attempts)
}

fn short_id(id: Uuid) -> String {
    let text = id.to_string();
    format!("{}...", &text[..8])
}

fn rule(ch: char) -> String {
    std::iter::repeat(ch).take(RULE_WIDTH).collect()
}

fn display_result(task: &Task) {
    println!("\n{}", rule('='));
    println!("RESULT");
    println!("{}", rule('='));
    println!("Task ID: {}", task.id);
    println!("Status: {}", task.status);
    println!("Prompt: {}", task.prompt);

    match task.status {
        TaskStatus::Completed => {
            println!("\nGenerated Text:");
            println!("{}", rule('-'));
            println!("{}", task.result.as_deref().unwrap_or("N/A"));
            println!("{}", rule('-'));
            let secs = task.processing_time().num_milliseconds() as f64 / 1000.0;
            println!("\nProcessing time: {:.2} seconds", secs);
        }
        TaskStatus::Failed => {
            println!("\nError: {}", task.error.as_deref().unwrap_or("Unknown error"));
        }
        _ => {}
    }

    println!("{}", rule('='));
}

// ============================================================================
// Worker command
// ============================================================================

async fn run_worker_command(mut settings: Settings, args: WorkerArgs) -> anyhow::Result<()> {
    if let Some(workers) = args.workers {
        settings.num_workers = workers;
    }
    if let Some(prefetch) = args.prefetch {
        settings.prefetch_count = prefetch;
    }
    settings.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics disabled");
    }

    let generator = build_generator(&settings, args.generator)?;
    let backends = Backends::redis(&settings).await?;

    let mut pool = WorkerPool::new(
        settings.pool_config(),
        backends.store,
        backends.queue,
        generator,
    );
    pool.start().await?;
    info!(queue = %settings.queue_name, "Waiting for tasks, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("listening for Ctrl-C")?;

    pool.shutdown().await?;

    let stats = pool.stats();
    info!(
        completed = stats.tasks_completed,
        failed = stats.tasks_failed,
        skipped = stats.deliveries_skipped,
        handed_back = stats.deliveries_handed_back,
        average_ms = stats.average_job_duration.as_millis() as u64,
        "Worker pool finished"
    );
    print!("{}", export_metrics());

    Ok(())
}

// ============================================================================
// Demo command
// ============================================================================

const API_PROMPTS: [&str; 4] = [
    "Write a short story about a robot learning to paint",
    "Explain quantum computing in simple terms",
    "Create a Python function to validate email addresses",
    "Write a haiku about artificial intelligence",
];

const BATCH_PROMPTS: [&str; 3] = [
    "Explain deep learning in one paragraph",
    "Write a function to calculate fibonacci numbers",
    "What is the future of artificial intelligence?",
];

async fn run_demo_command(settings: Settings, args: DemoArgs) -> anyhow::Result<()> {
    let backends = if args.in_memory {
        Backends::in_memory(&settings)
    } else {
        Backends::redis(&settings).await?
    };

    // In-memory demos need a worker in this process
    let mut pool = if args.in_memory {
        let mut pool = WorkerPool::new(
            settings.pool_config(),
            Arc::clone(&backends.store),
            Arc::clone(&backends.queue),
            Arc::new(settings.mock_generator()),
        );
        pool.start().await?;
        Some(pool)
    } else {
        None
    };

    let outcome = match args.mode {
        DemoMode::Single => demo_single(&backends, &args.poll).await,
        DemoMode::Multiple => demo_multiple(&backends, &args.poll).await,
        DemoMode::Api => demo_api(&backends).await,
        DemoMode::Interactive => demo_interactive(&backends, &args.poll).await,
    };

    if let Some(pool) = pool.as_mut() {
        pool.shutdown().await?;
    }
    outcome
}

fn banner(title: &str) {
    println!("\n{}", rule('='));
    println!("{}", title);
    println!("{}", rule('='));
}

async fn demo_single(backends: &Backends, poll: &PollArgs) -> anyhow::Result<()> {
    banner("TEST 1: Single Request with Polling");

    let prompt = "Write a short poem about machine learning";
    println!("\nSubmitting request...\n   Prompt: {}", prompt);
    let task_id = backends
        .dispatcher()
        .submit(prompt, metadata_from(json!({ "test_id": 1 })))
        .await?;
    println!("   Task ID: {}", task_id);

    let task = wait_verbose(&backends.poller(), task_id, poll).await?;
    display_result(&task);
    Ok(())
}

async fn demo_multiple(backends: &Backends, poll: &PollArgs) -> anyhow::Result<()> {
    banner("TEST 2: Multiple Concurrent Requests");

    let dispatcher = backends.dispatcher();
    let mut task_ids = Vec::with_capacity(BATCH_PROMPTS.len());
    for (i, prompt) in BATCH_PROMPTS.iter().enumerate() {
        let metadata = metadata_from(json!({ "batch_id": "test2", "order": i + 1 }));
        let task_id = dispatcher.submit(prompt, metadata).await?;
        println!("   Submitted {}: {}", task_id, prompt);
        task_ids.push(task_id);
    }
    println!("\nSubmitted {} requests", task_ids.len());

    let poller = backends.poller();
    let mut results = Vec::with_capacity(task_ids.len());
    for (i, task_id) in task_ids.iter().enumerate() {
        println!("\n--- Waiting for task {}/{} ---", i + 1, task_ids.len());
        match wait_verbose(&poller, *task_id, poll).await {
            Ok(task) => results.push(task),
            Err(e) => println!("   {}", e),
        }
    }

    for (i, task) in results.iter().enumerate() {
        println!("\nRESULT {}/{}", i + 1, results.len());
        display_result(task);
    }
    Ok(())
}

async fn demo_api(backends: &Backends) -> anyhow::Result<()> {
    banner("Text Generation API (Simulation)");

    let dispatcher = backends.dispatcher();
    let mut task_ids = Vec::with_capacity(API_PROMPTS.len());
    for (i, prompt) in API_PROMPTS.iter().enumerate() {
        println!("\n[Request {}] Creating task...", i + 1);
        let metadata = metadata_from(json!({ "request_number": i + 1, "source": "api_test" }));
        let task_id = dispatcher.submit(prompt, metadata).await?;
        println!("   Task created: {} | Prompt: {}", short_id(task_id), prompt);
        task_ids.push(task_id);
    }

    println!("\n{}", rule('='));
    println!("Total {} tasks created and queued", task_ids.len());
    println!("{}", rule('='));
    println!("\nTask IDs:");
    for (i, task_id) in task_ids.iter().enumerate() {
        println!("  {}. {}", i + 1, task_id);
    }
    println!("\nStart a worker with: taskrelay worker");
    Ok(())
}

async fn demo_interactive(backends: &Backends, poll: &PollArgs) -> anyhow::Result<()> {
    banner("Interactive Mode");
    println!("Enter prompts to generate text (or 'quit' to exit)");

    let dispatcher = backends.dispatcher();
    let poller = backends.poller();
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\nEnter prompt: ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let prompt = line.trim();

        if matches!(prompt.to_lowercase().as_str(), "quit" | "exit" | "q") {
            println!("Exiting...");
            break;
        }
        if prompt.is_empty() {
            println!("Please enter a valid prompt");
            continue;
        }

        let task_id = dispatcher.submit(prompt, Metadata::new()).await?;
        match wait_verbose(&poller, task_id, poll).await {
            Ok(task) => display_result(&task),
            Err(e) => println!("   {}", e),
        }
    }
    Ok(())
}

// ============================================================================
// Inspection commands
// ============================================================================

async fn run_stats_command(settings: &Settings, args: StatsArgs) -> anyhow::Result<()> {
    let queue = RedisWorkQueue::connect(&settings.redis_url(), settings.queue_config()).await?;
    let stats = queue.stats().await?;
    let dead_letters = queue.dead_letters(args.dead_letters).await?;

    if args.json {
        let output = json!({
            "queue": stats.queue_name,
            "pending": stats.pending,
            "in_flight": stats.in_flight,
            "dead_lettered": stats.dead_lettered,
            "dead_letters": dead_letters,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Queue: {}", stats.queue_name);
    println!("  Pending:       {}", stats.pending);
    println!("  In flight:     {}", stats.in_flight);
    println!("  Dead-lettered: {}", stats.dead_lettered);

    if !dead_letters.is_empty() {
        println!("\nDead letters:");
        for entry in &dead_letters {
            println!(
                "  {} task={} redeliveries={} reason={}",
                entry.dead_lettered_at.to_rfc3339(),
                entry.message.task_id,
                entry.message.redelivery_count,
                entry.reason
            );
        }
    }
    Ok(())
}

async fn run_check_command(settings: &Settings) -> anyhow::Result<()> {
    let url = settings.redis_url();
    let client = redis::Client::open(url.as_str()).context("parsing Redis URL")?;
    let mut conn = client
        .get_multiplexed_tokio_connection()
        .await
        .with_context(|| format!("connecting to {}", url))?;

    let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
    println!("✓ Redis connection established ({})", pong);

    let test_key = "taskrelay:check";
    let test_value = "Hello Redis!";
    redis::cmd("SET")
        .arg(test_key)
        .arg(test_value)
        .query_async::<_, ()>(&mut conn)
        .await?;
    let retrieved: String = redis::cmd("GET").arg(test_key).query_async(&mut conn).await?;
    println!("✓ Set and retrieved '{}' = '{}'", test_key, retrieved);

    let temp_key = "taskrelay:check:temp";
    redis::cmd("SETEX")
        .arg(temp_key)
        .arg(10)
        .arg("This expires in 10 seconds")
        .query_async::<_, ()>(&mut conn)
        .await?;
    let ttl: i64 = redis::cmd("TTL").arg(temp_key).query_async(&mut conn).await?;
    println!("✓ Created temporary key with TTL: {} seconds", ttl);

    redis::cmd("DEL")
        .arg(test_key)
        .arg(temp_key)
        .query_async::<_, ()>(&mut conn)
        .await?;
    println!("✓ Cleaned up test keys");

    let info: String = redis::cmd("INFO").arg("server").query_async(&mut conn).await?;
    let version = info
        .lines()
        .find_map(|line| line.strip_prefix("redis_version:"))
        .unwrap_or("unknown");
    println!("\n✓ Redis connection successful!");
    println!("Redis version: {}", version.trim());

    Ok(())
}
