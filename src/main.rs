use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::json;

use framecap::encoding::{FfmpegBackend, FfmpegMode};
use framecap::error::find_capture_error;
use framecap::harness::{Harness, RunReport};
use framecap::logging::{init_logging, LoggingConfig};
use framecap::manifest::load_and_validate_manifest;
use framecap::renderer::SoftwareRenderer;
use framecap::schema::BenchManifest;

#[derive(Debug, Parser)]
#[command(name = "framecap")]
#[command(version = env!("FRAMECAP_VERSION"))]
#[command(about = "Frame capture and profiling harness for offline render benchmarks")]
struct Cli {
    /// Log filter in env_logger syntax, e.g. "debug" or "framecap=trace".
    #[arg(long = "log", global = true)]
    log: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Render the manifest's frames and write the scheduled captures.
    Run {
        manifest: PathBuf,
        /// Print a machine-readable run summary (or error envelope) on stdout.
        #[arg(long)]
        json: bool,
        #[arg(long = "ffmpeg", value_enum, default_value_t = FfmpegArg::Auto)]
        ffmpeg: FfmpegArg,
    },
    /// Validate a manifest without rendering.
    Check {
        manifest: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FfmpegArg {
    Auto,
    System,
    Sidecar,
}

impl From<FfmpegArg> for FfmpegMode {
    fn from(value: FfmpegArg) -> Self {
        match value {
            FfmpegArg::Auto => FfmpegMode::Auto,
            FfmpegArg::System => FfmpegMode::System,
            FfmpegArg::Sidecar => FfmpegMode::Sidecar,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(LoggingConfig {
        env_filter: cli.log.clone(),
        ..LoggingConfig::default()
    });

    let (json, result) = match cli.command {
        Commands::Run {
            manifest,
            json,
            ffmpeg,
        } => (json, run_bench(&manifest, json, ffmpeg.into())),
        Commands::Check { manifest, json } => (json, run_check(&manifest, json)),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            if json {
                let envelope = match find_capture_error(&error) {
                    Some(capture_error) => serde_json::to_value(capture_error.envelope()),
                    None => Ok(json!({
                        "ok": false,
                        "error": { "code": "error", "message": format!("{error:#}") }
                    })),
                };
                match envelope {
                    Ok(value) => println!("{value}"),
                    Err(serialize_error) => eprintln!("failed to serialize error: {serialize_error}"),
                }
            }
            eprintln!("error: {error:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_check(manifest_path: &Path, json: bool) -> Result<ExitCode> {
    let manifest = load_and_validate_manifest(manifest_path)?;
    let exit_frame = manifest.resolved_exit_frame().unwrap_or_default();

    if json {
        println!(
            "{}",
            json!({
                "ok": true,
                "graphs": manifest.graphs,
                "exit_frame": exit_frame,
                "fps": manifest.clock.fps,
            })
        );
    } else {
        println!(
            "OK: {} ({} graph(s), {} frames at {} fps)",
            manifest_path.display(),
            manifest.graphs.len(),
            exit_frame,
            manifest.clock.fps
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn run_bench(manifest_path: &Path, json: bool, ffmpeg: FfmpegMode) -> Result<ExitCode> {
    let manifest = load_and_validate_manifest(manifest_path)?;
    let renderer = SoftwareRenderer::new(manifest.render.width, manifest.render.height)?
        .with_animation(manifest.scene.animated);
    let mut harness = Harness::from_manifest(&manifest, renderer, Box::new(FfmpegBackend::new(ffmpeg)))
        .context("failed to set up capture harness")?;

    install_interrupt_handler(harness.cancel_handle())?;

    let report = match harness.run() {
        Ok(report) => report,
        Err(error) => {
            if let Some(partial) = harness.take_interrupted_report() {
                write_profile(&manifest, &partial)?;
                if !json {
                    print_report(&manifest, &partial);
                }
            }
            return Err(error);
        }
    };
    write_profile(&manifest, &report)?;

    if json {
        println!("{}", report_json(&manifest, &report));
    } else {
        print_report(&manifest, &report);
    }

    if report.aborted {
        Ok(ExitCode::from(130))
    } else if report.failures.is_empty() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(2))
    }
}

/// First Ctrl-C cancels the run so open captures are finalized; a second one exits.
fn install_interrupt_handler(cancel: Arc<AtomicBool>) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start signal runtime")?;
    thread::Builder::new()
        .name("framecap-signal".to_owned())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    log::warn!("could not listen for Ctrl-C; interrupts will not finalize captures");
                    return;
                }
                log::warn!("interrupt received, finishing open captures (press Ctrl-C again to exit)");
                cancel.store(true, Ordering::Relaxed);
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(130);
                }
            });
        })
        .context("failed to spawn signal thread")?;
    Ok(())
}

fn write_profile(manifest: &BenchManifest, report: &RunReport) -> Result<()> {
    let (Some(settings), Some(profile)) = (&manifest.profiler, &report.profile) else {
        return Ok(());
    };
    if let Some(output) = &settings.output {
        profile
            .write_json(output)
            .with_context(|| format!("failed to write profile {}", output.display()))?;
        log::info!("wrote profile {}", output.display());
    }
    Ok(())
}

fn print_report(manifest: &BenchManifest, report: &RunReport) {
    if report.aborted {
        println!("Run aborted after {} frame(s)", report.frames_rendered);
    } else {
        println!("Rendered {} frame(s)", report.frames_rendered);
    }
    for path in &report.stills {
        println!("Wrote {}", path.display());
    }
    for path in &report.videos {
        println!("Wrote {}", path.display());
    }
    for failure in &report.failures {
        eprintln!("capture failed at frame {}: {}", failure.frame, failure.error);
    }

    let (Some(settings), Some(profile)) = (&manifest.profiler, &report.profile) else {
        return;
    };
    match profile.mean(&settings.report_event) {
        Ok(mean) => println!("Mean frame time: {mean:.4} ms ({})", settings.report_event),
        Err(error) => eprintln!("profile: {error}"),
    }
}

fn report_json(manifest: &BenchManifest, report: &RunReport) -> serde_json::Value {
    let failures = report
        .failures
        .iter()
        .map(|failure| {
            json!({
                "frame": failure.frame,
                "graph": failure.graph.as_ref().map(|graph| graph.name().to_owned()),
                "code": failure.error.code(),
                "message": failure.error.to_string(),
            })
        })
        .collect::<Vec<_>>();
    let mean = match (&manifest.profiler, &report.profile) {
        (Some(settings), Some(profile)) => profile.mean(&settings.report_event).ok(),
        _ => None,
    };

    json!({
        "ok": report.failures.is_empty(),
        "frames_rendered": report.frames_rendered,
        "stills": report.stills,
        "videos": report.videos,
        "failures": failures,
        "unreached": report.unreached,
        "aborted": report.aborted,
        "profile": report.profile,
        "report_mean_ms": mean,
    })
}
