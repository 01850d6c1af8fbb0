//! CLI binary for page-explainer.
//!
//! A thin shim over the library crate: flags map onto
//! `ExplainerConfig`, each subcommand calls one library operation.

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use page_explainer::pipeline::llm::client_from_config;
use page_explainer::pipeline::render::render;
use page_explainer::{
    cleanup, explain_file, explain_to_file, intake, status, BatchPolicy, BatchProgressCallback,
    Context, ExplainOptions, ExplainerConfig, OutputFormat, PageSeparator, ProgressCallback,
    Upload, Worker,
};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress bar for `explain`. Pages finish out of order, so
/// start times are tracked per page.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
    errors: AtomicUsize,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Reading document…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
            errors: AtomicUsize::new(0),
        })
    }

    fn activate_bar(&self, total: usize) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        self.bar.set_length(total as u64);
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Rewriting");
        self.bar.reset_eta();
    }

    fn elapsed_secs(&self, page_num: usize) -> f64 {
        let started = match self.start_times.lock() {
            Ok(mut times) => times.remove(&page_num),
            Err(_) => None,
        };
        started
            .map(|t| t.elapsed().as_millis() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

impl BatchProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total_pages: usize) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Rewriting {total_pages} pages…"))
        ));
    }

    fn on_page_start(&self, page_num: usize, _total: usize) {
        if let Ok(mut times) = self.start_times.lock() {
            times.insert(page_num, Instant::now());
        }
        self.bar.set_message(format!("page {page_num}"));
    }

    fn on_page_complete(&self, page_num: usize, total: usize, content_len: usize) {
        let secs = self.elapsed_secs(page_num);
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {:<8}  {}",
            green("✓"),
            page_num,
            total,
            dim(&format!("{content_len:>5} chars")),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page_num: usize, total: usize, error: &str) {
        let secs = self.elapsed_secs(page_num);
        self.errors.fetch_add(1, Ordering::SeqCst);

        let msg: String = if error.chars().count() > 80 {
            let mut cut: String = error.chars().take(79).collect();
            cut.push('\u{2026}');
            cut
        } else {
            error.to_string()
        };

        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}  {}",
            red("✗"),
            page_num,
            total,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total_pages: usize, success_count: usize) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();

        if failed == 0 {
            eprintln!(
                "{} {} pages rewritten",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} pages rewritten  ({} failed)",
                if failed == total_pages {
                    red("✘")
                } else {
                    cyan("⚠")
                },
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the background worker (Ctrl-C stops it after the in-flight job)
  explainer worker

  # Queue a deck and poll for its status
  explainer submit deck.pptx --email ada@example.com
  explainer status 3f0c9a8e-...

  # One-shot rewrite without the queue
  explainer explain slides.pdf -o slides.md

  # Export a finished job as DOCX
  explainer status 3f0c9a8e-... --format docx

  # Remove a job, or a user and all their jobs
  explainer cleanup 3f0c9a8e-...
  explainer remove-user ada@example.com

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY          API key (API_KEY is also accepted)
  EXPLAINER_DATA_ROOT     Directory holding uploads/, outputs/ and db/
  EXPLAINER_API_BASE      OpenAI-compatible base URL
  EXPLAINER_MODEL         Model identifier
  EXPLAINER_PROVIDER      Route calls through an edgequake-llm provider
                          ("auto" detects one from the variables below)
  EDGEQUAKE_LLM_PROVIDER  Provider picked by auto-detection (with EDGEQUAKE_MODEL)
  EDGEQUAKE_MODEL         Model used with EDGEQUAKE_LLM_PROVIDER
  PDFIUM_LIB_PATH         Path to libpdfium (file or directory)
"#;

/// Rewrite slide decks and PDFs page by page with an LLM.
#[derive(Parser, Debug)]
#[command(
    name = "explainer",
    version,
    about = "Rewrite slide decks and PDFs page by page with an LLM",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding uploads/, outputs/ and db/.
    #[arg(long, global = true, env = "EXPLAINER_DATA_ROOT")]
    data_root: Option<PathBuf>,

    /// Uploads directory (overrides --data-root).
    #[arg(long, global = true, env = "EXPLAINER_UPLOADS_DIR")]
    uploads: Option<PathBuf>,

    /// Outputs directory (overrides --data-root).
    #[arg(long, global = true, env = "EXPLAINER_OUTPUTS_DIR")]
    outputs: Option<PathBuf>,

    /// SQLite database file (overrides --data-root).
    #[arg(long, global = true, env = "EXPLAINER_DATABASE")]
    database: Option<PathBuf>,

    /// OpenAI-compatible API base URL.
    #[arg(long, global = true, env = "EXPLAINER_API_BASE")]
    api_base: Option<String>,

    /// API key for the chat-completions endpoint.
    #[arg(long, global = true, env = "OPENAI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Model identifier (default: gpt-3.5-turbo).
    #[arg(long, global = true, env = "EXPLAINER_MODEL")]
    model: Option<String>,

    /// edgequake-llm provider: openai, anthropic, gemini, ollama, ... or "auto".
    #[arg(long, global = true, env = "EXPLAINER_PROVIDER")]
    provider: Option<String>,

    /// Max output tokens per page.
    #[arg(long, global = true, env = "EXPLAINER_MAX_TOKENS", default_value_t = 512)]
    max_tokens: usize,

    /// Per-call timeout in seconds.
    #[arg(long, global = true, env = "EXPLAINER_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Seconds between two worker polling cycles.
    #[arg(long, global = true, env = "EXPLAINER_POLL_INTERVAL", default_value_t = 10)]
    poll_interval: u64,

    /// What one failed page means for the batch.
    #[arg(long, global = true, env = "EXPLAINER_POLICY", value_enum, default_value = "all-or-nothing")]
    policy: PolicyArg,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "EXPLAINER_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "EXPLAINER_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the job store and process pending jobs until Ctrl-C.
    Worker {
        /// Run a single cycle and exit.
        #[arg(long)]
        once: bool,
    },

    /// Queue a document as a pending job and print its id.
    Submit {
        file: PathBuf,
        /// Owner of the job.
        #[arg(long)]
        email: Option<String>,
        /// Instruction replacing the default rewrite request.
        #[arg(long)]
        instruction: Option<String>,
    },

    /// Show the status of a job.
    Status {
        id: String,
        /// Print the full status document as JSON.
        #[arg(long)]
        json: bool,
        /// Export a finished job in this format and print the file path.
        #[arg(long, value_enum)]
        format: Option<FormatArg>,
    },

    /// Rewrite a document directly, bypassing the queue.
    Explain {
        file: PathBuf,
        /// Output file; format from its extension. Plain text on stdout otherwise.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(long)]
        instruction: Option<String>,
        /// Disable progress bar.
        #[arg(long)]
        no_progress: bool,
    },

    /// Delete a job, its upload and its outputs.
    Cleanup { id: String },

    /// Delete a user together with all their jobs and files.
    RemoveUser { email: String },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum PolicyArg {
    AllOrNothing,
    Partial,
}

impl From<PolicyArg> for BatchPolicy {
    fn from(v: PolicyArg) -> Self {
        match v {
            PolicyArg::AllOrNothing => BatchPolicy::AllOrNothing,
            PolicyArg::Partial => BatchPolicy::Partial,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum FormatArg {
    Json,
    Txt,
    Md,
    Docx,
    Pdf,
}

impl From<FormatArg> for OutputFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Json => OutputFormat::Json,
            FormatArg::Txt => OutputFormat::Txt,
            FormatArg::Md => OutputFormat::Md,
            FormatArg::Docx => OutputFormat::Docx,
            FormatArg::Pdf => OutputFormat::Pdf,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs for `explain`; the worker logs.
    let show_progress = matches!(
        cli.command,
        Command::Explain { no_progress: false, .. }
    ) && !cli.quiet;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let config = build_config(&cli)?;

    match cli.command {
        Command::Worker { once } => run_worker(config, once).await,
        Command::Submit {
            ref file,
            ref email,
            ref instruction,
        } => {
            let ctx = open_local(config)?;
            let mut upload = Upload::from_path(file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if let Some(email) = email {
                upload = upload.with_owner(email);
            }
            if let Some(instruction) = instruction {
                upload = upload.with_instruction(instruction);
            }
            let id = intake::submit(&ctx, upload)
                .await
                .context("Submission failed")?;
            println!("{id}");
            Ok(())
        }
        Command::Status {
            ref id,
            json,
            format,
        } => {
            let ctx = open_local(config)?;
            if let Some(format) = format {
                return match status::output_artifact(&ctx, id, format.into()).await? {
                    Some(path) => {
                        println!("{}", path.display());
                        Ok(())
                    }
                    None => anyhow::bail!("Job {id} has no output yet"),
                };
            }
            let Some(report) = status::query(&ctx, id).await? else {
                anyhow::bail!("Job {id} not found");
            };
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&report).context("Failed to serialise status")?
                );
            } else {
                println!("Job:       {}", report.uid);
                println!("File:      {}", report.filename);
                println!("Status:    {}", report.status);
                println!("Uploaded:  {}", report.upload_time.to_rfc3339());
                if let Some(finished) = report.finish_time {
                    println!("Finished:  {}", finished.to_rfc3339());
                }
                if let Some(pages) = report.explanation {
                    println!("Pages:     {}", pages.len());
                }
            }
            Ok(())
        }
        Command::Explain {
            ref file,
            ref output,
            ref instruction,
            ..
        } => {
            let progress: Option<ProgressCallback> = if show_progress {
                Some(CliProgressCallback::new_dynamic() as Arc<dyn BatchProgressCallback>)
            } else {
                None
            };
            let options = ExplainOptions {
                instruction: instruction.clone(),
                progress,
                extractor: None,
            };
            let client = client_from_config(&config).context("No generation client")?;
            let start = Instant::now();

            if let Some(output_path) = output {
                let results = explain_to_file(file, output_path, &config, client, &options)
                    .await
                    .context("Rewrite failed")?;
                if !cli.quiet {
                    let failed = results.iter().filter(|r| !r.is_ok()).count();
                    eprintln!(
                        "{}  {}/{} pages  {}ms  →  {}",
                        if failed == 0 { green("✔") } else { cyan("⚠") },
                        results.len() - failed,
                        results.len(),
                        start.elapsed().as_millis(),
                        bold(&output_path.display().to_string()),
                    );
                }
            } else {
                let results = explain_file(file, &config, client, &options)
                    .await
                    .context("Rewrite failed")?;
                let text = render(&results, OutputFormat::Txt, &PageSeparator::default())
                    .context("Failed to render pages")?;
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                handle
                    .write_all(&text)
                    .context("Failed to write to stdout")?;
                if !text.ends_with(b"\n") {
                    handle.write_all(b"\n").ok();
                }
                if !cli.quiet && !show_progress {
                    eprintln!(
                        "Rewrote {} pages in {}ms",
                        results.len(),
                        start.elapsed().as_millis()
                    );
                }
            }
            Ok(())
        }
        Command::Cleanup { ref id } => {
            let ctx = open_local(config)?;
            match cleanup::remove_job(&ctx, id).await? {
                Some(removal) => {
                    eprintln!("{} removed job {id} ({} files)", green("✔"), removal.files);
                    Ok(())
                }
                None => anyhow::bail!("Job {id} not found"),
            }
        }
        Command::RemoveUser { ref email } => {
            let ctx = open_local(config)?;
            match cleanup::remove_user(&ctx, email).await? {
                Some(removal) => {
                    eprintln!(
                        "{} removed {email}: {} jobs, {} files",
                        green("✔"),
                        removal.jobs,
                        removal.files
                    );
                    Ok(())
                }
                None => anyhow::bail!("User {email} not found"),
            }
        }
    }
}

async fn run_worker(config: ExplainerConfig, once: bool) -> Result<()> {
    let ctx = Context::open(config).context("Failed to start worker")?;
    let worker = Worker::new(ctx);
    let shutdown = CancellationToken::new();

    if once {
        let report = worker.run_cycle(&shutdown).await;
        eprintln!(
            "{} processed, {} failed",
            bold(&report.processed.to_string()),
            report.failed
        );
        return Ok(());
    }

    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, stopping worker");
            signal.cancel();
        }
    });

    worker.run(shutdown).await;
    Ok(())
}

/// A context for commands that never call the generation service.
fn open_local(config: ExplainerConfig) -> Result<Context> {
    let client = client_from_config(&config).or_else(|_| {
        // Intake, status and cleanup work without an API key.
        page_explainer::OpenAiClient::new(&config, String::new())
            .map(|c| Arc::new(c) as Arc<dyn page_explainer::GenerationClient>)
    })?;
    Context::open_with_client(config, client).context("Failed to open job store")
}

/// Map CLI args to `ExplainerConfig`.
fn build_config(cli: &Cli) -> Result<ExplainerConfig> {
    let mut builder = ExplainerConfig::builder()
        .max_tokens(cli.max_tokens)
        .api_timeout_secs(cli.api_timeout)
        .poll_interval(Duration::from_secs(cli.poll_interval))
        .batch_policy(cli.policy.into());

    if let Some(ref root) = cli.data_root {
        builder = builder.data_root(root);
    }
    if let Some(ref dir) = cli.uploads {
        builder = builder.uploads_dir(dir);
    }
    if let Some(ref dir) = cli.outputs {
        builder = builder.outputs_dir(dir);
    }
    if let Some(ref path) = cli.database {
        builder = builder.database_path(path);
    }
    if let Some(ref url) = cli.api_base {
        builder = builder.api_base(url);
    }
    if let Some(ref key) = cli.api_key {
        builder = builder.api_key(key);
    }
    if let Some(ref model) = cli.model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = cli.provider {
        builder = builder.provider_name(provider);
    }

    builder.build().context("Invalid configuration")
}
