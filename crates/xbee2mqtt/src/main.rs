// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XBee to MQTT gateway CLI
//!
//! # Usage
//!
//! ```bash
//! # Run with a configuration file
//! xbee2mqtt --config xbee2mqtt.toml
//!
//! # Override the serial port and broker
//! xbee2mqtt --config xbee2mqtt.toml --serial /dev/ttyAMA0 --broker mqtt.local
//!
//! # Decode to stdout, no broker
//! xbee2mqtt --config xbee2mqtt.toml console
//! ```

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use xbee2mqtt::config::MqttConfig;
use xbee2mqtt::{service, BridgeConfig, FilterSpec, Qos, RouteConfig};

/// XBee to MQTT gateway
#[derive(Parser, Debug)]
#[command(name = "xbee2mqtt")]
#[command(about = "Bridge an XBee radio mesh to an MQTT broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device (overrides radio.port)
    #[arg(long)]
    serial: Option<String>,

    /// Serial baud rate (overrides radio.baudrate)
    #[arg(long)]
    baudrate: Option<u32>,

    /// MQTT broker host (overrides mqtt.host)
    #[arg(long)]
    broker: Option<String>,

    /// Log level (trace, debug, info, warn, error); defaults to log_level from the file
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "xbee2mqtt.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Print decoded readings to stdout instead of publishing them
    Console,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Commands::GenConfig { ref output }) => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            return cmd_gen_config(output);
        }
        Some(Commands::Validate { ref config }) => {
            init_logging(args.log_level.as_deref().unwrap_or("info"));
            return cmd_validate(config);
        }
        _ => {}
    }

    let config = build_config(&args)?;
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    if matches!(args.command, Some(Commands::Console)) {
        service::run_console(config).await?;
    } else {
        service::run(config, args.config.clone()).await?;
    }
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };

    if let Some(port) = &args.serial {
        config.radio.port = port.clone();
    }
    if let Some(baudrate) = args.baudrate {
        config.radio.baudrate = baudrate;
    }
    if let Some(host) = &args.broker {
        config.mqtt.host = host.clone();
    }
    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: &Path) -> anyhow::Result<()> {
    let mut config = BridgeConfig {
        mqtt: MqttConfig {
            username: Some("xbee".into()),
            password: Some("secret".into()),
            ..Default::default()
        },
        ..Default::default()
    };
    config.general.sample_rate_ms = 5000;

    config.add_route(
        RouteConfig::new("0013a20040401122", "status")
            .topic("/home/door/status")
            .filter(FilterSpec::Map {
                values: [("1", "open"), ("0", "closed")]
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                default: None,
            })
            .delivery(Qos::AtLeastOnce, true),
    );
    config.add_route(
        RouteConfig::new("0013a200406bfd09", "*")
            .topic("/garden/{port}")
            .input_topic("/garden/{port}/switch"),
    );
    config.add_route(
        RouteConfig::new("*", "adc-7")
            .topic("/power/{address}/battery")
            .filter(FilterSpec::Scale {
                factor: 1200.0 / 1023.0,
                offset: 0.0,
            })
            .filter(FilterSpec::Round { decimals: 0 }),
    );

    let toml_str = toml::to_string_pretty(&config)?;
    let content = format!(
        r#"# XBee to MQTT gateway configuration
# Generated by xbee2mqtt gen-config

{}
"#,
        toml_str
    );

    std::fs::write(output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> anyhow::Result<()> {
    match BridgeConfig::from_file(config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Radio: {} @ {} baud", config.radio.port, config.radio.baudrate);
            println!("Broker: {}", config.mqtt.broker_addr());
            println!("Routes: {}", config.routes.len());
            for (i, route) in config.routes.iter().enumerate() {
                println!(
                    "  [{}] {}:{} -> {}",
                    i,
                    route.address,
                    route.port,
                    route
                        .topic
                        .as_deref()
                        .unwrap_or(&config.general.default_output_topic_pattern)
                );
            }
            println!(
                "Default: {} (publish={}, expose={})",
                config.general.default_output_topic_pattern,
                config.general.publish_undefined_topics,
                config.general.expose_undefined()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}
