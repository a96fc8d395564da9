//! Hardeen CLI entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use hardeen::core::{
    format_duration, spawn_subscriber, BatchOutcome, EngineEvent, FrameRange, ProcessLauncher,
    ProgressKind, Scheduler,
};
use hardeen::notifications::{LogTransport, NotificationTransport, NotificationTrigger, PushoverTransport};
use hardeen::scene::{
    resolve_targets, BatchSpec, HythonIntrospector, ManifestIntrospector, RenderTarget,
    SceneIntrospector,
};
use hardeen::shutdown::{ShutdownSequencer, SystemPower};
use hardeen::EngineConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "hardeen", version, about = "Render orchestration for Houdini ROPs")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/hardeen/config.yml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render ROP nodes of a scene
    Render(RenderArgs),
    /// List the render nodes of a scene
    Nodes {
        scene: PathBuf,
        /// YAML list of targets instead of asking hython
        #[arg(long)]
        manifest: Option<PathBuf>,
    },
    /// Run the output parser over a captured render log
    Classify { log: PathBuf },
}

#[derive(Args)]
struct RenderArgs {
    scene: PathBuf,

    /// YAML list of targets instead of asking hython
    #[arg(long)]
    manifest: Option<PathBuf>,

    /// Render only these nodes, in this order
    #[arg(long = "node", value_name = "NODE")]
    nodes: Vec<String>,

    /// Frame range for every node, e.g. 1001-1100 or 1-100x2
    #[arg(long)]
    range: Option<FrameRange>,

    /// Frame step for every node
    #[arg(long)]
    step: Option<i64>,

    /// Skip frames whose output file already exists
    #[arg(long, conflicts_with = "no_skip_existing")]
    skip_existing: bool,

    #[arg(long)]
    no_skip_existing: bool,

    /// Keep rendering a job after one of its frames fails
    #[arg(long)]
    best_effort: bool,

    /// Send push notifications
    #[arg(long)]
    notify: bool,

    /// Shut the machine down when the batch completes
    #[arg(long)]
    shutdown: bool,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Render(args) => render(cli.config.as_deref(), args).await,
        Commands::Nodes { scene, manifest } => {
            nodes(cli.config.as_deref(), &scene, manifest).await
        }
        Commands::Classify { log } => classify(&log),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

fn introspector(config: &EngineConfig, scene: &Path, manifest: Option<PathBuf>) -> Box<dyn SceneIntrospector> {
    match manifest {
        Some(path) => Box::new(ManifestIntrospector::new(path)),
        None if ManifestIntrospector::sidecar_path(scene).exists() => {
            Box::new(ManifestIntrospector::sidecar())
        }
        None => Box::new(HythonIntrospector::new(config.introspection.hython.clone())),
    }
}

async fn targets(config: &EngineConfig, scene: &Path, manifest: Option<PathBuf>) -> Result<Vec<RenderTarget>> {
    let introspector = introspector(config, scene, manifest);
    let targets = resolve_targets(introspector.as_ref(), scene, config.introspection.timeout()).await?;
    Ok(targets)
}

async fn nodes(config_path: Option<&Path>, scene: &Path, manifest: Option<PathBuf>) -> Result<ExitCode> {
    let config = EngineConfig::load(config_path)?;
    for target in targets(&config, scene, manifest).await? {
        let range = match FrameRange::new(target.start, target.end, target.step) {
            Ok(range) => range.to_string(),
            Err(e) => format!("invalid ({})", e),
        };
        println!(
            "{}\t{}\t{}\t{}",
            target.node,
            range,
            target.rop_type.as_deref().unwrap_or("-"),
            target.output.as_ref().map_or("-", |o| o.as_str())
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn classify(path: &Path) -> Result<ExitCode> {
    let bytes = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let content = String::from_utf8_lossy(&bytes);

    let mut recognized = 0;
    let mut total = 0;
    for (index, line) in content.lines().enumerate() {
        total += 1;
        if let Some(event) = hardeen::semantic::classify(line) {
            recognized += 1;
            println!(
                "{}",
                serde_json::json!({ "line": index + 1, "event": event })
            );
        }
    }
    log::info!("{} of {} line(s) recognized", recognized, total);
    Ok(ExitCode::SUCCESS)
}

async fn render(config_path: Option<&Path>, args: RenderArgs) -> Result<ExitCode> {
    let mut config = EngineConfig::load(config_path)?;
    if args.skip_existing {
        config.scheduler.skip_existing = true;
    }
    if args.no_skip_existing {
        config.scheduler.skip_existing = false;
    }
    if args.best_effort {
        config.scheduler.fail_fast = false;
    }
    if args.notify {
        config.notifications.enabled = true;
    }
    if args.shutdown {
        config.shutdown.enabled = true;
    }
    config.validate()?;

    let mut spec = BatchSpec::new(
        args.scene.clone(),
        targets(&config, &args.scene, args.manifest.clone()).await?,
    )
    .select(&args.nodes)?;
    if let Some(range) = args.range {
        spec = spec.with_range(range);
    }
    if let Some(step) = args.step {
        spec = spec.with_step(step);
    }

    let scheduler = Scheduler::new(&config, Arc::new(ProcessLauncher::new()));
    let printer = tokio::spawn(print_events(scheduler.subscribe(), args.json));

    let name = args
        .scene
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.scene.display().to_string());
    let notifier = config.notifications.enabled.then(|| {
        let transport: Box<dyn NotificationTransport> = if config.notifications.pushover.is_configured() {
            Box::new(PushoverTransport::new(config.notifications.pushover.clone()))
        } else {
            log::warn!("Pushover credentials missing, notifications go to the log");
            Box::new(LogTransport)
        };
        let trigger = NotificationTrigger::new(config.notifications.clone(), transport, name.clone());
        spawn_subscriber(scheduler.subscribe(), trigger)
    });
    let shutdown = config.shutdown.enabled.then(|| {
        let (sequencer, handle) =
            ShutdownSequencer::new(config.shutdown.clone(), Arc::new(SystemPower));
        (spawn_subscriber(scheduler.subscribe(), sequencer), handle)
    });

    let handle = scheduler.submit(&spec)?;
    let control = handle.control();
    let wait = handle.wait();
    tokio::pin!(wait);

    let mut cancelled = false;
    let summary = loop {
        tokio::select! {
            summary = &mut wait => break summary?,
            _ = tokio::signal::ctrl_c() => {
                if cancelled {
                    log::warn!("Already cancelling, waiting for renderers to exit");
                    continue;
                }
                log::warn!("Interrupted, cancelling batch");
                cancelled = true;
                if let Err(e) = control.cancel_all().await {
                    log::debug!("{}", e);
                }
            }
        }
    };

    // Closing the event stream lets the subscribers finish
    drop(scheduler);
    if let Err(e) = printer.await {
        log::debug!("Printer task ended abnormally: {}", e);
    }
    if let Some(notifier) = notifier {
        if let Err(e) = notifier.await {
            log::debug!("Notification task ended abnormally: {}", e);
        }
    }
    if let Some((task, handle)) = shutdown {
        tokio::pin!(task);
        loop {
            tokio::select! {
                _ = &mut task => break,
                _ = tokio::signal::ctrl_c() => {
                    if handle.cancel() {
                        log::warn!("Shutdown aborted");
                    }
                }
            }
        }
    }

    Ok(if summary.outcome == BatchOutcome::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn print_events(mut rx: mpsc::UnboundedReceiver<EngineEvent>, json: bool) {
    let mut reported: HashMap<String, usize> = HashMap::new();
    while let Some(event) = rx.recv().await {
        if json {
            println!("{}", event.to_json_line());
            continue;
        }
        match &event {
            EngineEvent::BatchStarted {
                batch_id,
                jobs,
                frames,
            } => println!(
                "Batch {}: {} job(s), {} frame(s)",
                batch_id,
                jobs.len(),
                frames
            ),
            EngineEvent::Job(progress) => {
                let job = &progress.job_id;
                match &progress.kind {
                    ProgressKind::Started { frames } => {
                        println!("[{}] rendering {} frame(s)", job, frames.len())
                    }
                    ProgressKind::FrameDone { frame, render_time } => {
                        println!("[{}] frame {} done in {}", job, frame, format_duration(*render_time))
                    }
                    ProgressKind::FrameFailed { frame, message } => {
                        println!("[{}] frame {} failed: {}", job, frame, message)
                    }
                    ProgressKind::FrameSkipped { frame } => {
                        println!("[{}] frame {} skipped, output exists", job, frame)
                    }
                    ProgressKind::OutputWritten { path } => {
                        println!("[{}] wrote {}", job, path.display())
                    }
                    ProgressKind::Log { line, .. } => log::debug!("[{}] {}", job, line),
                    ProgressKind::Progress(agg) => {
                        let finished = agg.terminal_count();
                        if reported.get(job) != Some(&finished) {
                            reported.insert(job.clone(), finished);
                            println!(
                                "[{}] {}/{} ({:.0}%), ETA {}",
                                job,
                                finished,
                                agg.total,
                                agg.percent_complete,
                                agg.eta_display()
                            );
                        }
                    }
                    ProgressKind::Completed => println!("[{}] completed", job),
                    ProgressKind::Failed { error } => println!("[{}] failed: {}", job, error),
                    ProgressKind::Cancelled => println!("[{}] cancelled", job),
                    ProgressKind::FrameStarted { .. } | ProgressKind::FrameProgress { .. } => {}
                }
            }
            EngineEvent::BatchFinished(summary) => println!(
                "Batch {} {}: {}/{} frame(s) done, {} failed, {} skipped in {}",
                summary.batch_id,
                summary.outcome,
                summary.frames_done,
                summary.frames_total,
                summary.frames_failed,
                summary.frames_skipped,
                format_duration(summary.elapsed)
            ),
        }
    }
}
