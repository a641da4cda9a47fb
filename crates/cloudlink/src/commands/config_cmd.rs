//! Config subcommand handlers.

use std::path::Path;

use cloudlink_config::{Settings, config_path, detect_server_id, load_settings, save_settings};

use crate::cli::{ConfigArgs, ConfigCommand};
use crate::error::CliError;

const MASK: &str = "****";

pub fn handle(args: ConfigArgs, path: Option<&Path>) -> Result<(), CliError> {
    let path = path.map_or_else(config_path, Path::to_path_buf);

    match args.command {
        ConfigCommand::Init { server_id, force } => {
            if path.exists() && !force {
                return Err(CliError::ConfigExists {
                    path: path.display().to_string(),
                });
            }
            let server_id = match server_id {
                Some(id) => id,
                None => detect_server_id(&std::env::current_dir()?),
            };
            save_settings(&Settings::for_server(&server_id), &path)?;
            println!("Wrote {} for server '{server_id}'", path.display());
            println!("Set websocket.auth_token before running `cloudlink run`.");
        }
        ConfigCommand::Show => {
            let settings = load_settings(Some(&path))?;
            print!("{}", toml::to_string_pretty(&redacted(settings))?);
        }
        ConfigCommand::Path => println!("{}", path.display()),
        ConfigCommand::Validate => {
            let settings = load_settings(Some(&path))?;
            settings.validate()?;
            println!(
                "Settings OK: server '{}' over {}",
                settings.server_id(),
                settings.communication.kind
            );
        }
    }
    Ok(())
}

/// Copy of `settings` with credentials masked.
fn redacted(mut settings: Settings) -> Settings {
    settings.websocket.auth_token = MASK.into();
    for password in [&mut settings.redis.password, &mut settings.mqtt.password] {
        if password.is_some() {
            *password = Some(MASK.into());
        }
    }
    settings
}
