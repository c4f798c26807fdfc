use hometv_core::{load_channel_catalog, EncodingMode, HometvConfig};
use serde_json::json;

use crate::{channels_path, ChannelCommands, Cli, OutputFormat, Result};

pub fn run(cli: &Cli, config: &HometvConfig, command: &ChannelCommands) -> Result<()> {
    match command {
        ChannelCommands::List(args) => {
            let mut channels = load_channel_catalog(channels_path(cli, config))?;
            if args.active_only {
                channels.retain(|channel| channel.is_active);
            }
            match cli.format {
                OutputFormat::Json => {
                    let rows: Vec<_> = channels
                        .iter()
                        .map(|channel| {
                            json!({
                                "id": channel.id,
                                "slug": channel.slug,
                                "name": channel.name,
                                "source": channel.redacted_source(),
                                "mode": match channel.encoding.mode {
                                    EncodingMode::Passthrough => "passthrough",
                                    EncodingMode::Transcode => "transcode",
                                },
                                "variants": match channel.encoding.mode {
                                    EncodingMode::Passthrough => vec![],
                                    EncodingMode::Transcode => channel
                                        .encoding
                                        .resolved_variants()
                                        .iter()
                                        .map(|spec| spec.name)
                                        .collect::<Vec<_>>(),
                                },
                                "encrypt": channel.encoding.encrypt,
                                "active": channel.is_active,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                OutputFormat::Text => {
                    for channel in &channels {
                        let mode = match channel.encoding.mode {
                            EncodingMode::Passthrough => "passthrough".to_string(),
                            EncodingMode::Transcode => {
                                let names: Vec<&str> = channel
                                    .encoding
                                    .resolved_variants()
                                    .iter()
                                    .map(|spec| spec.name)
                                    .collect();
                                format!("transcode[{}]", names.join(","))
                            }
                        };
                        println!(
                            "{:<12} {:<24} {:<32} {}{}",
                            channel.slug,
                            mode,
                            channel.redacted_source(),
                            if channel.encoding.encrypt { "encrypted " } else { "" },
                            if channel.is_active { "active" } else { "inactive" },
                        );
                    }
                }
            }
            Ok(())
        }
    }
}
