use hometv_core::access::ContentKeyStore;
use hometv_core::{load_channel_catalog, HometvConfig};
use serde_json::json;

use crate::{channels_path, AppError, Cli, KeyCommands, OutputFormat, Result};

pub fn run(cli: &Cli, config: &HometvConfig, command: &KeyCommands) -> Result<()> {
    match command {
        KeyCommands::Rotate(args) => {
            let channels = load_channel_catalog(channels_path(cli, config))?;
            let channel = channels
                .iter()
                .find(|channel| channel.slug == args.channel)
                .ok_or_else(|| AppError::UnknownChannel(args.channel.clone()))?;

            let store = ContentKeyStore::builder()
                .path(config.resolve_path(&config.paths.keys_db))
                .public_base(config.server.public_base.clone())
                .build()?;
            store.initialize()?;
            let key = store.generate_key(&channel.id, &channel.slug)?;

            match cli.format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&json!({
                            "channel": channel.slug,
                            "key_id": key.key_id,
                            "key_uri": key.key_uri,
                            "created_at": key.created_at.to_rfc3339(),
                        }))?
                    );
                }
                OutputFormat::Text => {
                    println!("rotated key for {}: {} ({})", channel.slug, key.key_id, key.key_uri);
                }
            }
            Ok(())
        }
    }
}
