//! Config validation CLI tool
//!
//! Validates a replmux configuration file and lists its targets.

use replmux_config::ConfigError;
use replmux_util::default_config_path;
use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let config_path = match std::env::args().nth(1) {
        Some(path) => PathBuf::from(path),
        None => {
            let default_path = default_config_path();
            eprintln!("Usage: validate-config [config-file]");
            eprintln!();
            eprintln!("Validates a replmux configuration file.");
            eprintln!();
            eprintln!("If no path is provided, uses: {}", default_path.display());
            return ExitCode::from(2);
        }
    };

    if !config_path.exists() {
        eprintln!("Error: Configuration file not found: {}", config_path.display());
        return ExitCode::from(1);
    }

    match replmux_config::load_config(&config_path) {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Summary:");
            println!("  Config version: {}", replmux_config::CURRENT_CONFIG_VERSION);
            println!("  Buffer size: {}", settings.session.buffer_size);
            if settings.ingress.enabled {
                println!("  Ingress: {}", settings.ingress.listen_addr);
            } else {
                println!("  Ingress: disabled");
            }
            println!("  Targets: {}", settings.targets.len());

            if !settings.targets.is_empty() {
                println!();
                println!("Targets:");
                for target in &settings.targets {
                    let is_default =
                        settings.default_target.as_deref() == Some(target.name.as_str());
                    let marker = if is_default { " (default)" } else { "" };
                    println!(
                        "  - {}{} [{}]: {}",
                        target.name, marker, target.listen_addr, target.command
                    );
                }
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
                        ver,
                        replmux_config::CURRENT_CONFIG_VERSION
                    );
                }
            }
            ExitCode::from(1)
        }
    }
}
