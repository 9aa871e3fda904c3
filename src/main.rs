use clap::{Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use indexmap::IndexMap;
use tracing::info;
use tracing_subscriber::EnvFilter;

use remote_pilot::cancel::CancelToken;
use remote_pilot::config::{self, DEFAULT_OLLAMA_URL};
use remote_pilot::detect::{DetectorConfig, GeometricDetector};
use remote_pilot::engine::{AutomationEngine, EngineOptions};
use remote_pilot::recorder::RecordingStats;
use remote_pilot::remote::{MockDesktop, RemoteController, controller_for};
use remote_pilot::script::{ScenarioDocument, Step, load_document, render_dry_run};
use remote_pilot::vlm::{OllamaClient, ScriptedOracle, VisionOracle, VlmConfig, check_health};

/// Longest variable value printed in a run summary
const VARIABLE_PREVIEW: usize = 100;

/// Remote Pilot - scripted remote desktop automation
#[derive(Parser, Debug)]
#[command(
    name = "remote-pilot",
    about = "Scripted VNC/RDP/SPICE automation with geometric detection and vision model fallback",
    after_help = "ENVIRONMENT VARIABLES:\n\
        REMOTE_PILOT_OLLAMA_URL     Vision oracle base URL\n\
        REMOTE_PILOT_OLLAMA_MODEL   Vision model name\n\
        REMOTE_PILOT_VLM_TIMEOUT    Oracle request timeout (seconds)\n\
        REMOTE_PILOT_OUTPUT_DIR     Root for screenshots and recordings\n\
        REMOTE_PILOT_SETTLE_MS      Pause after every step (ms)\n\
        REMOTE_PILOT_RECORD_FPS     Recording frame rate\n\
        REMOTE_PILOT_RECORD_SIZE    Recording resolution (WxH)\n\
        RUST_LOG                    Log filter (overrides --verbose)"
)]
struct Args {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the scenarios in a document
    List {
        /// Scenario document (YAML)
        config: PathBuf,
    },

    /// Execute a scenario against the configured remote desktop
    Run {
        /// Scenario document (YAML)
        config: PathBuf,

        /// Scenario name
        scenario: String,

        /// Record the session to <output>/videos
        #[arg(long)]
        record: bool,

        /// Save before/after frames for every step and detector debug images
        #[arg(long)]
        debug: bool,

        /// Output directory (default: REMOTE_PILOT_OUTPUT_DIR or ./results)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Run against a synthetic desktop with a silent oracle
        #[arg(long)]
        mock: bool,
    },

    /// Print the steps of a scenario without connecting
    DryRun {
        /// Scenario document (YAML)
        config: PathBuf,

        /// Scenario name
        scenario: String,
    },

    /// Write a sample scenario document
    Init {
        /// Output file path
        #[arg(short, long, default_value = "scenarios.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Run the geometric quick analysis on an image and print JSON
    Detect {
        /// Screenshot to analyse
        image: PathBuf,
    },

    /// Check that the vision oracle is reachable
    Health {
        /// Oracle base URL
        #[arg(long, env = "REMOTE_PILOT_OLLAMA_URL", default_value = DEFAULT_OLLAMA_URL)]
        url: String,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Some(Commands::List { config }) => {
            let doc = load_document(&config)?;
            println!("Scenarios in {}:", config.display());
            for (name, steps) in &doc.scenarios {
                let first = steps.first().map(Step::action_name).unwrap_or("-");
                println!("  {:<24} {:>3} steps  (starts with {})", name, steps.len(), first);
            }
        }

        Some(Commands::Run {
            config,
            scenario,
            record,
            debug,
            output,
            mock,
        }) => {
            if !run_scenario(&config, &scenario, record, debug, output, mock)? {
                std::process::exit(1);
            }
        }

        Some(Commands::DryRun { config, scenario }) => {
            let doc = load_document(&config)?;
            let steps = doc.scenario(&scenario)?;
            print!("{}", render_dry_run(&scenario, steps));
        }

        Some(Commands::Init { output, force }) => {
            if output.exists() && !force {
                return Err(format!("{} already exists (use --force to overwrite)", output.display()).into());
            }
            fs::write(&output, ScenarioDocument::sample().to_yaml()?)?;
            println!("Created sample scenario document: {}", output.display());
            println!("  Try: remote-pilot dry-run {} hello_world", output.display());
        }

        Some(Commands::Detect { image: path }) => {
            let frame = image::open(&path)?.to_rgb8();
            let analysis = GeometricDetector::default().quick_analysis(&frame);
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }

        Some(Commands::Health { url }) => {
            if check_health(&url, 5)? {
                println!("Oracle reachable at {}", url);
            } else {
                eprintln!("Oracle not reachable at {}", url);
                std::process::exit(1);
            }
        }

        None => {
            println!("Remote Pilot - scripted remote desktop automation");
            println!();
            println!("Usage: remote-pilot <COMMAND>");
            println!();
            println!("Commands:");
            println!("  list     List the scenarios in a document");
            println!("  run      Execute a scenario");
            println!("  dry-run  Print the steps of a scenario without connecting");
            println!("  init     Write a sample scenario document");
            println!("  detect   Geometric analysis of a screenshot");
            println!("  health   Check the vision oracle");
            println!();
            println!("Run with --help for more information.");
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Execute a scenario and print its summary; false when anything failed
fn run_scenario(
    config_path: &Path,
    scenario: &str,
    record: bool,
    debug: bool,
    output: Option<PathBuf>,
    mock: bool,
) -> Result<bool, Box<dyn Error>> {
    let doc = load_document(config_path)?;
    let steps = doc.scenario(scenario)?;
    let output_dir = output.unwrap_or_else(|| config::get().output.dir.clone());
    let cancel = CancelToken::new();

    let controller: Arc<dyn RemoteController>;
    let oracle: Arc<dyn VisionOracle>;
    if mock {
        controller = Arc::new(mock_desktop());
        oracle = Arc::new(ScriptedOracle::new());
    } else {
        let vlm = VlmConfig::new(&doc.ollama.url).model(&doc.ollama.model);
        controller = controller_for(&doc.connection, &cancel);
        oracle = Arc::new(OllamaClient::new(vlm)?);
    }

    let mut detector_config = DetectorConfig::default();
    if debug {
        detector_config.debug_dir = Some(output_dir.join("debug"));
    }

    let options = EngineOptions::default()
        .output_dir(&output_dir)
        .debug_frames(debug)
        .record(record);
    let engine = AutomationEngine::new(controller.clone(), oracle, options)
        .with_detector(GeometricDetector::new(detector_config))
        .with_cancel_token(cancel.clone());

    // First Ctrl-C tears down cleanly; a second one exits without waiting
    let presses = AtomicUsize::new(0);
    ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            eprintln!("\nInterrupted, tearing down... (Ctrl-C again to exit immediately)");
            cancel.cancel();
        } else {
            eprintln!("\nExiting without teardown");
            std::process::exit(130);
        }
    })?;

    info!(scenario, target = %controller.describe(), steps = steps.len(), "starting scenario");

    match engine.execute(steps, scenario) {
        Ok(report) => {
            print_summary(&report.variables, &report.errors, report.recording.as_ref());
            if report.is_clean() {
                println!("\nScenario '{}' completed successfully", scenario);
            }
            Ok(report.is_clean())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_summary(&engine.variables(), &engine.errors(), engine.last_recording().as_ref());
            Ok(false)
        }
    }
}

fn print_summary(variables: &IndexMap<String, String>, errors: &[String], recording: Option<&RecordingStats>) {
    if !variables.is_empty() {
        println!("\nVariables:");
        for (name, value) in variables {
            println!("  {}: {}", name, preview(value, VARIABLE_PREVIEW));
        }
    }

    if !errors.is_empty() {
        println!("\nErrors ({}):", errors.len());
        for error in errors {
            println!("  - {}", error);
        }
    }

    if let Some(stats) = recording {
        println!("\nRecording: {}", stats.file.display());
        println!(
            "  {} frames in {:.1}s ({:.1} fps, target {})",
            stats.frames, stats.duration_secs, stats.actual_fps, stats.fps
        );
        println!("  Size: {:.1} MB", stats.size_bytes as f64 / (1024.0 * 1024.0));
    }
}

fn preview(value: &str, max_chars: usize) -> String {
    if value.chars().count() > max_chars {
        let head: String = value.chars().take(max_chars).collect();
        format!("{}...", head)
    } else {
        value.to_string()
    }
}

/// Lock screen used by `run --mock`
fn mock_desktop() -> MockDesktop {
    let desktop = MockDesktop::with_color(1280, 720, [60, 60, 70]);
    desktop.draw_rect(420, 230, 440, 260, [150, 150, 160]);
    desktop.draw_text(440, 250, "Unlock session", [255, 255, 255], [150, 150, 160]);
    desktop.draw_rect(480, 310, 320, 30, [250, 250, 250]);
    desktop.draw_rect(560, 420, 100, 36, [20, 40, 90]);
    desktop.draw_rect(680, 420, 100, 36, [20, 40, 90]);
    desktop
}
