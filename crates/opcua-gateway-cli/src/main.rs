//! wb-mqtt-opcua: exposes Wiren Board MQTT controls as OPC UA variable nodes.

mod logging;
mod shutdown;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use opcua_gateway_core::address_space::ServerError;
use opcua_gateway_core::config::{
    self, ConfigError, DEFAULT_CONFIG_PATH, GatewayConfig, MqttSettings,
};
use opcua_gateway_core::bus::DeviceDriver;
use opcua_gateway_devices::MqttDriver;
use opcua_gateway_server::UaServer;
use opcua_gateway_sync::{DEFAULT_STOP_TIMEOUT, DRIVER_INIT_TIMEOUT, Gateway, GatewayError};

/// Exit code for a missing or invalid configuration.
const EXIT_NOTCONFIGURED: u8 = 6;

#[derive(Parser, Debug)]
#[command(name = "wb-mqtt-opcua")]
#[command(author, version, about = "Wiren Board MQTT to OPC UA gateway", long_about = None)]
#[command(disable_help_flag = true)]
struct Args {
    /// Print help
    #[arg(long, action = clap::ArgAction::Help)]
    help: Option<bool>,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Add every control found on the bus to FILE (disabled) and exit
    #[arg(short, long, value_name = "FILE")]
    generate: Option<PathBuf>,

    /// Debug level: 1 gateway, 2 MQTT, 3 both; negative values silence info logs
    #[arg(
        short,
        long,
        default_value_t = 0,
        allow_negative_numbers = true,
        value_parser = clap::value_parser!(i8).range(-3..=3)
    )]
    debug: i8,

    /// MQTT broker host
    #[arg(short = 'h', long)]
    host: Option<String>,

    /// MQTT broker port
    #[arg(short, long)]
    port: Option<u16>,

    /// MQTT username
    #[arg(short, long)]
    user: Option<String>,

    /// MQTT password
    #[arg(short = 'P', long)]
    password: Option<String>,

    /// MQTT topic prefix
    #[arg(short = 'T', long)]
    prefix: Option<String>,
}

impl Args {
    /// Command-line broker options take precedence over the file.
    fn apply_mqtt_overrides(&self, mqtt: &mut MqttSettings) {
        if let Some(host) = &self.host {
            mqtt.host = host.clone();
        }
        if let Some(port) = self.port {
            mqtt.port = port;
        }
        if let Some(user) = &self.user {
            mqtt.auth = true;
            mqtt.username = user.clone();
        }
        if let Some(password) = &self.password {
            mqtt.password = password.clone();
        }
        if let Some(prefix) = &self.prefix {
            mqtt.prefix = prefix.clone();
        }
    }
}

fn exit_code(err: &anyhow::Error) -> u8 {
    let not_configured = err.chain().any(|cause| {
        cause.is::<ConfigError>()
            || matches!(
                cause.downcast_ref::<GatewayError>(),
                Some(GatewayError::Config(_))
                    | Some(GatewayError::Server(
                        ServerError::Configuration(_) | ServerError::NodeCreation { .. }
                    ))
            )
    });
    if not_configured { EXIT_NOTCONFIGURED } else { 1 }
}

/// Merge the controls currently on the bus into `path`.
fn generate(args: &Args, path: &Path) -> anyhow::Result<()> {
    let mut value = config::read_config_value(path)?;
    let mut mqtt = value
        .get("mqtt")
        .cloned()
        .map(serde_json::from_value::<MqttSettings>)
        .transpose()
        .context("Invalid mqtt section")?
        .unwrap_or_default();
    args.apply_mqtt_overrides(&mut mqtt);

    let driver = MqttDriver::connect(&mqtt)?;
    let result = config::update_config(&driver, &mut value, DRIVER_INIT_TIMEOUT);
    driver.stop();

    let added = result?;
    config::write_config_value(path, &value)?;
    tracing::info!(path = %path.display(), added, "Configuration updated");
    Ok(())
}

async fn serve(mut config: GatewayConfig, args: &Args) -> anyhow::Result<()> {
    args.apply_mqtt_overrides(&mut config.mqtt);

    let driver = Arc::new(MqttDriver::connect(&config.mqtt)?);
    let bus: Arc<dyn DeviceDriver> = driver.clone();
    let gateway = Gateway::new(config, bus, Arc::new(UaServer::new()));

    let started = tokio::task::block_in_place(|| gateway.start());
    if let Err(e) = started {
        driver.stop();
        return Err(e.into());
    }

    shutdown::shutdown_signal().await;

    let stopped = tokio::task::block_in_place(|| gateway.stop(DEFAULT_STOP_TIMEOUT));
    driver.stop();
    stopped?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Some(path) = args.generate.clone() {
        logging::init(args.debug, false);
        let result = tokio::task::block_in_place(|| generate(&args, &path));
        return match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "FATAL: configuration update failed");
                ExitCode::from(1)
            }
        };
    }

    let config = GatewayConfig::load(&args.config);
    logging::init(
        args.debug,
        config.as_ref().map(|c| c.debug).unwrap_or(false),
    );

    let result = match config {
        Ok(config) => serve(config, &args).await,
        Err(e) => Err(anyhow::Error::new(e)
            .context(format!("Failed to load config '{}'", args.config.display()))),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = exit_code(&e);
            tracing::error!(error = %format!("{e:#}"), code, "FATAL");
            ExitCode::from(code)
        }
    }
}
