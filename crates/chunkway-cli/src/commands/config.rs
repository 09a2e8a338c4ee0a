//! Config command implementation.

use std::time::Duration;

use anyhow::Result;

use chunkway_core::config::Config;

use super::{ConfigAction, ConfigArgs};

/// Run the config command.
pub async fn run(args: ConfigArgs) -> Result<()> {
    let mut config = Config::load()?;

    match args.action {
        ConfigAction::Get { key } => match get_config_value(&config, &key) {
            Some(v) => println!("{}: {}", key, v),
            None => println!("Unknown configuration key: {}", key),
        },

        ConfigAction::Set { key, value } => {
            if set_config_value(&mut config, &key, &value)? {
                config.validate()?;
                config.save()?;
                println!("Set {} = {}", key, value);
            } else {
                println!("Unknown configuration key: {}", key);
            }
        }

        ConfigAction::Show => {
            println!();
            println!("Chunkway Configuration");
            println!("{}", "─".repeat(50));
            println!();
            println!("[upload]");
            println!("  chunk_size = {}", config.upload.chunk_size);
            println!("  max_concurrency = {}", config.upload.max_concurrency);
            println!("  latency_sim = \"{}ms\"", config.upload.latency_sim.as_millis());
            println!();
            println!("[endpoint]");
            println!("  output_dir = \"{}\"", config.endpoint.output_dir.display());
            match config.endpoint.quota {
                Some(quota) => println!("  quota = {}", quota),
                None => println!("  quota = unlimited"),
            }
            println!();
            println!("[image]");
            println!("  resize = {}", config.image.resize);
            println!("  max_width = {}", config.image.max_width);
            println!("  max_height = {}", config.image.max_height);
            println!();
        }

        ConfigAction::Path => {
            println!("{}", Config::config_path().display());
        }

        ConfigAction::Reset => {
            Config::default().save()?;
            println!("Configuration reset to defaults.");
        }
    }

    Ok(())
}

fn get_config_value(config: &Config, key: &str) -> Option<String> {
    match key {
        "chunk_size" => Some(config.upload.chunk_size.to_string()),
        "max_concurrency" => Some(config.upload.max_concurrency.to_string()),
        "latency_sim" => Some(format!("{}ms", config.upload.latency_sim.as_millis())),
        "output_dir" => Some(config.endpoint.output_dir.display().to_string()),
        "quota" => Some(
            config
                .endpoint
                .quota
                .map_or_else(|| "unlimited".to_string(), |q| q.to_string()),
        ),
        "resize" => Some(config.image.resize.to_string()),
        "max_width" => Some(config.image.max_width.to_string()),
        "max_height" => Some(config.image.max_height.to_string()),
        _ => None,
    }
}

fn set_config_value(config: &mut Config, key: &str, value: &str) -> Result<bool> {
    match key {
        "chunk_size" => config.upload.chunk_size = value.parse()?,
        "max_concurrency" => config.upload.max_concurrency = value.parse()?,
        "latency_sim" => {
            let ms = value.trim().trim_end_matches("ms").parse()?;
            config.upload.latency_sim = Duration::from_millis(ms);
        }
        "output_dir" => config.endpoint.output_dir = value.into(),
        "quota" => {
            config.endpoint.quota = match value {
                "unlimited" | "none" => None,
                v => Some(v.parse()?),
            };
        }
        "resize" => config.image.resize = value.parse()?,
        "max_width" => config.image.max_width = value.parse()?,
        "max_height" => config.image.max_height = value.parse()?,
        _ => return Ok(false),
    }
    Ok(true)
}
