use clap::{Args, Subcommand};

use super::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        let mut shown = config.clone();
                        shown.remote.api_key = shown.remote.api_key.as_deref().map(mask_key);
                        println!("{}", serde_json::to_string_pretty(&shown)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        println!();

                        println!("conflict_strategy: {}", config.conflict_strategy.value);
                        println!("  source: {}", config.conflict_strategy.source);
                        println!();

                        println!("collections: {}", config.collections.value.join(", "));
                        println!("  source: {}", config.collections.source);
                        println!();

                        println!("remote:");
                        match &config.remote.server_url {
                            Some(url) => println!("  server_url: {}", url),
                            None => println!("  server_url: (not set)"),
                        }
                        match &config.remote.api_key {
                            Some(key) => println!("  api_key: {}", mask_key(key)),
                            None => println!("  api_key: (not set)"),
                        }
                        println!("  realtime: {}", config.remote.realtime);
                    }
                }
                Ok(())
            }
        }
    }
}

/// Shows only the first characters of a secret.
fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(4).collect();
    format!("{}…", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key("abcdef123"), "abcd…");
        assert_eq!(mask_key("ab"), "ab…");
    }
}
