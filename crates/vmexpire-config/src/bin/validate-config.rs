//! Config validation CLI tool
//!
//! Validates a vmexpired configuration file and reports any errors.

use std::path::PathBuf;
use std::process::ExitCode;
use vmexpire_config::{ConfigError, DispatchMode, NotifierConfig, CURRENT_CONFIG_VERSION};
use vmexpire_util::default_config_path;

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a vmexpired configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match vmexpire_config::load_config(&config_path) {
        Ok(policy) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", CURRENT_CONFIG_VERSION);
            println!(
                "  Lifetime: {} days, extension ceiling: {} days, notice: {}",
                policy.expiration.max_duration_days,
                policy.expiration.max_extend_days,
                match policy.expiration.notify_before_days {
                    0 => "disabled".to_string(),
                    n => format!("{} days", n),
                }
            );
            println!(
                "  Excluded projects: {}",
                policy.expiration.excluded_projects.len()
            );
            println!(
                "  Sweep: every {}s, batch {}, concurrency {}",
                policy.scheduler.tick_interval.as_secs(),
                policy.scheduler.batch_size,
                policy.scheduler.sweep_concurrency
            );
            match policy.dispatch.mode {
                DispatchMode::Inline => println!("  Dispatch: inline"),
                DispatchMode::Queued => {
                    println!("  Dispatch: queued ({} workers)", policy.dispatch.workers)
                }
            }
            println!("  Compute: {}", policy.compute.url);
            match &policy.notifier {
                NotifierConfig::Log => println!("  Notifier: log"),
                NotifierConfig::Relay { url, .. } => println!("  Notifier: relay ({})", url),
            }

            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed");
            eprintln!();
            match &e {
                ConfigError::ReadError(io_err) => {
                    eprintln!("Failed to read file: {}", io_err);
                }
                ConfigError::ParseError(parse_err) => {
                    eprintln!("TOML parse error:");
                    eprintln!("  {}", parse_err);
                }
                ConfigError::ValidationFailed { errors } => {
                    eprintln!("Validation errors ({}):", errors.len());
                    for err in errors {
                        eprintln!("  - {}", err);
                    }
                }
                ConfigError::UnsupportedVersion(ver) => {
                    eprintln!(
                        "Unsupported config version: {} (expected {})",
                        ver, CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
