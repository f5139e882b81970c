use crate::commands::ConfigAction;
use crate::output::{OutputFormat, OutputFormatter, print_info, print_success, print_warning};
use anyhow::Result;
use ovirtkit_core::Config;

pub async fn execute(action: ConfigAction, config: Config, format: OutputFormat) -> Result<()> {
    match action {
        ConfigAction::Show => {
            println!("{}", format.format(&config));
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path()?.display());
        }
        ConfigAction::Init { force } => {
            let path = Config::config_path()?;
            if path.exists() && !force {
                print_warning(&format!(
                    "{} already exists; use --force to overwrite it",
                    path.display()
                ));
                return Ok(());
            }
            Config::default().save()?;
            print_success(&format!("Wrote default configuration to {}", path.display()));
            print_info("Set engine.url and engine.username before uploading");
        }
    }

    Ok(())
}
