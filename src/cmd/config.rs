//! Configuration view and validation commands: `flora config`.

use anyhow::Result;
use std::path::Path;

use super::super::ConfigCommands;
use flora::config::PipelineConfig;
use flora::phase::PhaseName;

pub fn cmd_config(config_path: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let exists = config_path.exists();
    let config = PipelineConfig::load_or_default(config_path)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            if exists {
                println!("Config file: {}", config_path.display());
            } else {
                println!(
                    "No config file at {} (showing defaults)",
                    config_path.display()
                );
            }
            println!();
            print!("{}", config.to_toml()?);
            println!();

            println!("Recursion gates:");
            for phase in PhaseName::SEQUENCE {
                let recurses = config.phase_spec(phase).is_ok_and(|s| s.recurses);
                println!("  {:<12} {}", phase.as_str(), if recurses { "on" } else { "off" });
            }
        }
        Some(ConfigCommands::Validate) => {
            if !exists {
                println!("No config file found at {}", config_path.display());
                println!("Using default configuration.");
                return Ok(());
            }

            let warnings = config.validate();
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
        }
    }

    Ok(())
}
