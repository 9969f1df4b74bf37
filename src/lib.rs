//! Humming Library
//!
//! Listens to the system's audio output and turns it into haptic trigger
//! events: loopback capture, windowed FFT analysis, interchangeable trigger
//! strategies and a rate-limited controller.

pub mod analysis;
pub mod audio;
pub mod controller;
pub mod haptics;
pub mod settings;

pub use controller::{ControllerError, ControllerState, HummingController};
pub use haptics::WaveformType;
pub use settings::{
    AnalysisMode, HummingSettings, JsonFileStore, MemoryStore, SettingsStore, SharedSettings,
};

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

/// Settings file used when none is given on the command line
const DEFAULT_SETTINGS_FILE: &str = "humming.json";

/// Console commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    CycleMode,
    Threshold(i32),
    Sensitivity(i32),
    ResetThreshold,
    ResetSensitivity,
    Toggle,
    Status,
    Config,
    Help,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    let command = match line.trim() {
        "m" | "mode" => Command::CycleMode,
        "t+" => Command::Threshold(1),
        "t-" => Command::Threshold(-1),
        "t0" => Command::ResetThreshold,
        "s+" => Command::Sensitivity(1),
        "s-" => Command::Sensitivity(-1),
        "s0" => Command::ResetSensitivity,
        "e" | "toggle" => Command::Toggle,
        "" | "status" => Command::Status,
        "c" | "config" => Command::Config,
        "?" | "h" | "help" => Command::Help,
        "q" | "quit" | "exit" => Command::Quit,
        _ => return None,
    };
    Some(command)
}

const HELP: &str = "\
commands:
  m        cycle analysis mode
  t+ t-    raise / lower threshold (0.05 per step)
  t0       reset threshold
  s+ s-    raise / lower sensitivity (0.1 per step)
  s0       reset sensitivity
  e        enable / disable humming
  status   show current state
  config   print settings as JSON
  q        save settings and quit";

/// Current controller state as one line
fn status_line(controller: &HummingController) -> String {
    let settings = controller.settings().read().clone();
    let mut line = format!(
        "{:?} | mode {} | threshold {:.2} | sensitivity {:.2}",
        controller.state(),
        settings.analysis_mode,
        settings.threshold,
        settings.sensitivity
    );

    if controller.is_running() {
        line.push_str(&format!(" | {} Hz", controller.sample_rate()));
    }
    if controller.is_native_tempo_active() {
        line.push_str(&format!(" | {:.0} BPM", controller.current_bpm()));
    }
    line
}

/// Start capture when the persisted settings have Humming enabled.
///
/// A failing device is only logged; the console stays up so the user can
/// retry with `e`. Returns whether the controller is running.
fn start_if_enabled(controller: &mut HummingController) -> bool {
    if !controller.settings().read().enabled {
        return false;
    }

    match controller.start() {
        Ok(()) => controller.is_running(),
        Err(e) => {
            log::warn!("Humming could not start: {}", e);
            false
        }
    }
}

/// Apply one command, returning the text to show
fn execute(controller: &mut HummingController, command: Command) -> Result<String, String> {
    match command {
        Command::CycleMode => {
            let mode = controller.cycle_mode();
            Ok(format!("mode: {}", mode))
        }
        Command::Threshold(ticks) => {
            let threshold = controller.adjust_threshold(ticks);
            Ok(format!("threshold: {:.2}", threshold))
        }
        Command::Sensitivity(ticks) => {
            let sensitivity = controller.adjust_sensitivity(ticks);
            Ok(format!("sensitivity: {:.2}", sensitivity))
        }
        Command::ResetThreshold => {
            controller.reset_threshold();
            Ok(status_line(controller))
        }
        Command::ResetSensitivity => {
            controller.reset_sensitivity();
            Ok(status_line(controller))
        }
        Command::Toggle => {
            // Enabled but not running means the last start failed: retry
            let enable = !controller.is_running();
            controller
                .set_enabled(enable)
                .map_err(|e| e.to_string())?;
            Ok(status_line(controller))
        }
        Command::Status => Ok(status_line(controller)),
        Command::Config => {
            let settings = controller.settings().read().clone();
            serde_json::to_string_pretty(&settings).map_err(|e| e.to_string())
        }
        Command::Help => Ok(HELP.to_string()),
        Command::Quit => Ok(String::new()),
    }
}

fn run_console() -> Result<(), String> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));

    let mut store = JsonFileStore::open(&path).map_err(|e| e.to_string())?;
    let settings = HummingSettings::load(&store).shared();
    log::info!("Settings loaded from {}", path.display());

    let mut controller = HummingController::new(settings.clone(), |event| {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", event);
        let _ = stdout.flush();
    });

    if !settings.read().enabled {
        eprintln!("humming is disabled, type 'e' to enable");
    }
    start_if_enabled(&mut controller);
    eprintln!("{}", status_line(&controller));
    eprintln!("type 'help' for commands");

    for line in io::stdin().lock().lines() {
        let line = line.map_err(|e| e.to_string())?;

        let Some(command) = parse_command(&line) else {
            eprintln!("unknown command: {}", line.trim());
            continue;
        };

        if command == Command::Quit {
            break;
        }

        match execute(&mut controller, command) {
            Ok(message) => eprintln!("{}", message),
            Err(e) => eprintln!("error: {}", e),
        }
    }

    controller.stop();

    settings.read().save(&mut store);
    store.flush().map_err(|e| e.to_string())?;
    log::info!("Settings saved to {}", path.display());

    Ok(())
}

pub fn run() {
    env_logger::init();

    if let Err(e) = run_console() {
        log::error!("Humming failed: {}", e);
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
