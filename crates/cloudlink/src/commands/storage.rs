//! `cloudlink storage`: key/value access on the backend.

use serde_json::Value;

use cloudlink_config::Settings;
use cloudlink_core::CloudStorage;

use crate::cli::{StorageArgs, StorageCommand};
use crate::error::CliError;

pub async fn handle(args: StorageArgs, settings: &Settings) -> Result<(), CliError> {
    settings.validate()?;
    let storage = CloudStorage::new(settings.server_id(), &settings.stream_endpoint()?)?;

    match args.command {
        StorageCommand::Get { key } => {
            let value = storage.get(&key).await.ok_or(CliError::KeyNotFound { key })?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        StorageCommand::Put { key, value } => {
            let value: Value = serde_json::from_str(&value)?;
            if !storage.store(&key, &value).await {
                return Err(CliError::StorageFailed {
                    action: "store",
                    key,
                });
            }
            println!("Stored '{key}'");
        }
        StorageCommand::Delete { key } => {
            if !storage.delete(&key).await {
                return Err(CliError::StorageFailed {
                    action: "delete",
                    key,
                });
            }
            println!("Deleted '{key}'");
        }
    }
    Ok(())
}
