use crate::{
    config::Config,
    extract,
    pipeline::Pipeline,
    summarize,
    supervisor::Supervisor,
    util::{ensure_dir, input_descriptor, now_rfc3339, sha256_hex},
    worker::HttpWorker,
};
use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "ocr-foreman")]
#[command(about = "OCR worker supervisor and batch page-to-text pipeline")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./ocr-foreman.toml if present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the worker, wait for readiness, report the endpoint, stop it.
    Doctor {},
    /// Pre-scan only: per-file page counts and the batch total.
    Pages {
        #[arg(long, required = true)]
        input: Vec<PathBuf>,
    },
    /// Full batch: start worker, OCR every page, write corpus and report.
    Run {
        #[arg(long, required = true)]
        input: Vec<PathBuf>,
        #[arg(long)]
        out_dir: Option<PathBuf>,
        /// Also summarize the aggregated corpus.
        #[arg(long)]
        summarize: bool,
    },
    /// Run the chunked summarizer over an existing text file.
    Summarize {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        prompt: Option<String>,
    },
}

pub async fn dispatch(args: Args) -> Result<()> {
    let cfg_path = resolve_config_path(args.config.as_deref())?;
    let cfg = Config::load(&cfg_path)?;

    match &args.cmd {
        Command::Doctor {} => {
            let log_path = resolve_log_path(&cfg, None);
            let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
            doctor(&cfg).await
        }
        Command::Pages { input } => {
            let log_path = resolve_log_path(&cfg, None);
            let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
            pages(&cfg, input).await
        }
        Command::Run {
            input,
            out_dir,
            summarize,
        } => run(&args, &cfg, input, out_dir.as_deref(), *summarize).await,
        Command::Summarize { input, prompt } => {
            let log_path = resolve_log_path(&cfg, None);
            let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
            summarize_file(&cfg, input, prompt.as_deref()).await
        }
    }
}

fn resolve_config_path(user: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = user {
        return Ok(p.to_path_buf());
    }
    let default = PathBuf::from("ocr-foreman.toml");
    if default.exists() {
        Ok(default)
    } else {
        Ok(PathBuf::from("ocr-foreman.example.toml"))
    }
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

async fn doctor(cfg: &Config) -> Result<()> {
    let mut supervisor = Supervisor::new(cfg);
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    spawn_cancel_on_signal(cancel_tx);
    let started = Instant::now();

    match supervisor.start_cancellable(&mut cancel_rx).await {
        Ok(endpoint) => {
            let ready_after_ms = started.elapsed().as_millis() as u64;
            let diag = serde_json::json!({
                "ok": true,
                "endpoint": endpoint.base_url(),
                "port": endpoint.port,
                "pid": supervisor.pid(),
                "ready_after_ms": ready_after_ms,
                "ready_since": endpoint.ready_since,
            });
            supervisor.stop().await;
            println!("{}", serde_json::to_string_pretty(&diag)?);
            Ok(())
        }
        Err(err) => {
            let diag = serde_json::json!({
                "ok": false,
                "error": err.to_string(),
            });
            println!("{}", serde_json::to_string_pretty(&diag)?);
            Err(err.into())
        }
    }
}

async fn pages(cfg: &Config, inputs: &[PathBuf]) -> Result<()> {
    let mut files = Vec::new();
    let mut total_pages = 0u32;

    for input in inputs {
        validate_input(cfg, input)?;
        match extract::page_count(&cfg.extraction, input).await {
            Ok(count) => {
                total_pages += count;
                files.push(serde_json::json!({
                    "path": input,
                    "pages": count,
                }));
            }
            Err(err) => files.push(serde_json::json!({
                "path": input,
                "error": err.to_string(),
            })),
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "files": files,
            "total_pages": total_pages,
        }))?
    );
    Ok(())
}

async fn run(
    args: &Args,
    cfg: &Config,
    inputs: &[PathBuf],
    out_override: Option<&Path>,
    want_summary: bool,
) -> Result<()> {
    for input in inputs {
        validate_input(cfg, input)?;
    }

    let cfg_hash = sha256_hex(cfg.normalized_for_hash().as_bytes());
    let descriptors: Vec<String> = inputs.iter().map(|p| input_descriptor(p)).collect();
    let job_id = sha256_hex(format!("{}:{}", cfg_hash, descriptors.join(",")).as_bytes());

    let out_root = out_override
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(&cfg.paths.out_dir));
    let job_dir = out_root.join(&job_id);

    ensure_dir(&job_dir)?;
    ensure_dir(&job_dir.join("final"))?;
    ensure_dir(&job_dir.join("logs"))?;

    let log_path = resolve_log_path(cfg, Some(&job_dir));
    let _guard = init_logging(args, cfg, log_path.as_deref())?;

    info!("job_id={job_id} out={}", job_dir.display());

    if cfg.debug.dump_effective_config {
        let raw = toml::to_string(cfg).unwrap_or_default();
        std::fs::write(job_dir.join("effective-config.toml"), raw)?;
    }

    let started = now_rfc3339();

    // The signal listener goes in before the worker is spawned, so a Ctrl-C
    // or SIGTERM during the readiness wait still tears the worker down.
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    spawn_cancel_on_signal(cancel_tx);

    let mut supervisor = Supervisor::new(cfg);
    let endpoint = supervisor
        .start_cancellable(&mut cancel_rx)
        .await
        .context("worker failed to start")?;

    // Everything that needs the live worker runs here; the shutdown path
    // below runs whether or not it succeeded.
    let job_result: Result<(crate::pipeline::BatchOutput, &'static str)> = async {
        let worker = HttpWorker::new(&cfg.endpoints, &endpoint.base_url())?;
        let pipeline = Pipeline::new(cfg, worker)?;

        let output = pipeline
            .run_batch(inputs, cancel_rx, |progress| {
                info!(
                    "progress {:.0}% ({}/{} pages, file {}/{})",
                    progress.percent(),
                    progress.processed_pages,
                    progress.total_pages,
                    progress.file_index + 1,
                    inputs.len()
                );
            })
            .await;

        if cfg.output.write_corpus {
            std::fs::write(
                job_dir.join("final").join(&cfg.output.corpus_filename),
                &output.corpus,
            )?;
        }
        if cfg.output.write_report_json {
            std::fs::write(
                job_dir.join("final").join(&cfg.output.report_filename),
                serde_json::to_string_pretty(&output.report)?,
            )?;
        }

        let mut summary_state = "skipped";
        if want_summary && !output.report.cancelled && !output.corpus.is_empty() {
            match summarize::summarize(
                &cfg.summarize,
                pipeline.worker(),
                &output.corpus,
                &cfg.summarize.prompt,
                &cfg.summarize.language_preference,
            )
            .await
            {
                Ok(summary) => {
                    info!(chunks = summary.chunk_count, "summary complete");
                    std::fs::write(
                        job_dir.join("final").join(&cfg.output.summary_filename),
                        &summary.summary,
                    )?;
                    summary_state = "ok";
                }
                Err(abort) => {
                    error!("{}", abort.error);
                    if !abort.completed.is_empty() {
                        // Keep what we got; the corpus itself is untouched.
                        std::fs::write(
                            job_dir.join("final").join(&cfg.output.summary_filename),
                            abort.completed.join("\n\n"),
                        )?;
                        summary_state = "partial";
                    } else {
                        summary_state = "failed";
                    }
                }
            }
        }

        Ok((output, summary_state))
    }
    .await;

    supervisor.stop().await;
    let (output, summary_state) = job_result?;

    if cfg.output.write_index_json {
        let index = serde_json::json!({
            "job_id": job_id,
            "started": started,
            "finished": now_rfc3339(),
            "corpus": format!("final/{}", cfg.output.corpus_filename),
            "report": format!("final/{}", cfg.output.report_filename),
            "summary": summary_state,
            "cancelled": output.report.cancelled,
        });
        std::fs::write(
            job_dir.join("index.json"),
            serde_json::to_string_pretty(&index)?,
        )?;
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "job_id": job_id,
            "job_dir": job_dir,
            "processed_pages": output.report.processed_pages,
            "total_pages": output.report.total_pages,
            "failures": output.report.failures.len(),
            "cancelled": output.report.cancelled,
        }))?
    );

    Ok(())
}

async fn summarize_file(cfg: &Config, input: &Path, prompt: Option<&str>) -> Result<()> {
    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading text file: {}", input.display()))?;

    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    spawn_cancel_on_signal(cancel_tx);

    let mut supervisor = Supervisor::new(cfg);
    let endpoint = supervisor
        .start_cancellable(&mut cancel_rx)
        .await
        .context("worker failed to start")?;
    let worker = match HttpWorker::new(&cfg.endpoints, &endpoint.base_url()) {
        Ok(worker) => worker,
        Err(err) => {
            supervisor.stop().await;
            return Err(err.into());
        }
    };

    let work = summarize::summarize(
        &cfg.summarize,
        &worker,
        &text,
        prompt.unwrap_or(&cfg.summarize.prompt),
        &cfg.summarize.language_preference,
    );
    tokio::pin!(work);
    let result = tokio::select! {
        res = &mut work => Some(res),
        _ = cancelled(&mut cancel_rx) => None,
    };

    supervisor.stop().await;

    match result {
        Some(Ok(summary)) => {
            println!("{}", summary.summary);
            Ok(())
        }
        Some(Err(abort)) => {
            if !abort.completed.is_empty() {
                warn!(
                    "{} of the chunk summaries completed before the failure",
                    abort.completed.len()
                );
                println!("{}", abort.completed.join("\n\n"));
            }
            Err(abort.error.into())
        }
        None => Err(anyhow!("terminated before summarization finished")),
    }
}

fn validate_input(cfg: &Config, input: &Path) -> Result<()> {
    let input_str = input.display().to_string();

    if cfg.security.reject_url_inputs && looks_like_url(&input_str) {
        return Err(anyhow!("URL inputs are disabled: {input_str}"));
    }

    if !input.exists() {
        return Err(anyhow!("input does not exist: {}", input.display()));
    }

    if !extract::is_pdf(input) && !extract::is_image(&cfg.extraction, input) {
        return Err(anyhow!(
            "unsupported input type (expected PDF or image): {}",
            input.display()
        ));
    }

    Ok(())
}

fn looks_like_url(s: &str) -> bool {
    let s = s.to_ascii_lowercase();
    s.starts_with("http://") || s.starts_with("https://") || s.starts_with("file://")
}

fn resolve_log_path(cfg: &Config, job_dir: Option<&Path>) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }

    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }

    if let Some(job_dir) = job_dir {
        return Some(job_dir.join("logs").join("ocr-foreman.log"));
    }

    Some(PathBuf::from(&cfg.paths.out_dir).join("ocr-foreman.log"))
}

/// Resolve once the cancel flag flips to true; never resolves when the
/// sending side is gone (no signal can arrive anymore).
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|flag| *flag).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Flip the cancel flag when the host receives Ctrl-C or, on unix, SIGTERM.
/// The batch stops at the next page boundary and the normal shutdown path
/// still runs.
fn spawn_cancel_on_signal(cancel_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        if wait_for_termination().await {
            warn!("termination signal received; cancelling batch");
            let _ = cancel_tx.send(true);
        }
    });
}

#[cfg(unix)]
async fn wait_for_termination() -> bool {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            error!("could not install SIGTERM handler: {e}");
            return tokio::signal::ctrl_c().await.is_ok();
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.is_ok(),
        _ = term.recv() => true,
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> bool {
    tokio::signal::ctrl_c().await.is_ok()
}
