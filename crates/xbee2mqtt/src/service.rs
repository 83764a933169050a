// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Service runtime: serial port, MQTT session supervision, signals.
//!
//! The engine itself never sleeps or retries. This module owns the blocking
//! serial reader thread, the MQTT event loop with its reconnect delay, the
//! statistics ticker, dedup eviction and SIGHUP reloads.

use crate::config::{BridgeConfig, ConfigError, MqttConfig, RadioConfig};
use crate::engine::BridgeEngine;
use crate::framing::Deframer;
use crate::transport::{ConsolePubSub, MqttPublisher, PubSub, SerialWriter};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS,
};
use serialport::SerialPort;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Serial read timeout; bounds how long the reader takes to notice shutdown.
const SERIAL_TIMEOUT: Duration = Duration::from_millis(500);

/// Capacity of the MQTT client request queue.
const MQTT_REQUEST_CAPACITY: usize = 256;

/// Time allowed for the final status publication and disconnect.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Period of the expired dedup entry sweep.
const DEDUP_EVICT_INTERVAL: Duration = Duration::from_secs(30);

/// Status payloads.
const STATUS_ONLINE: &str = "1";
const STATUS_OFFLINE: &str = "0";

/// Service errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serial port {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Open the radio serial port (8N1).
pub fn open_serial(radio: &RadioConfig) -> Result<Box<dyn SerialPort>, ServiceError> {
    tracing::debug!("Opening serial port {} at {} baud", radio.port, radio.baudrate);

    serialport::new(&radio.port, radio.baudrate)
        .timeout(SERIAL_TIMEOUT)
        .data_bits(serialport::DataBits::Eight)
        .stop_bits(serialport::StopBits::One)
        .parity(serialport::Parity::None)
        .open()
        .map_err(|source| ServiceError::Serial {
            port: radio.port.clone(),
            source,
        })
}

/// Build MQTT client options, including the offline last-will.
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(config.keepalive));
    options.set_clean_session(config.clean_session);
    if let Some(username) = &config.username {
        options.set_credentials(username, config.password.as_deref().unwrap_or(""));
    }
    if config.set_will {
        options.set_last_will(LastWill::new(
            config.status_topic(),
            STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
    }
    options
}

/// Feed bytes from a reader into the engine until `running` is cleared or
/// the reader reaches end of stream.
///
/// Read timeouts are expected on serial ports and only re-check `running`.
pub fn pump_frames<R: Read>(
    mut reader: R,
    escaped: bool,
    engine: &BridgeEngine,
    running: &AtomicBool,
) -> std::io::Result<()> {
    let mut deframer = Deframer::new(escaped);
    let mut buf = [0u8; 256];

    while running.load(Ordering::Relaxed) {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => continue,
            Err(e) => return Err(e),
        };

        for frame in deframer.push(&buf[..n]) {
            match frame {
                // Failures are logged and counted by the engine.
                Ok(body) => {
                    let _ = engine.handle_frame(&body);
                }
                Err(e) => tracing::warn!("Discarding serial data: {}", e),
            }
        }
    }
    Ok(())
}

fn spawn_reader(
    port: Box<dyn SerialPort>,
    escaped: bool,
    engine: Arc<BridgeEngine>,
    running: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>, ServiceError> {
    let handle = std::thread::Builder::new()
        .name("serial-reader".into())
        .spawn(move || {
            match pump_frames(port, escaped, &engine, &running) {
                Ok(()) => tracing::debug!("Serial reader finished"),
                Err(e) => tracing::error!("Serial reader stopped: {}", e),
            }
        })?;
    Ok(handle)
}

async fn join_reader(handle: std::thread::JoinHandle<()>) {
    let joined = tokio::task::spawn_blocking(move || handle.join()).await;
    if !matches!(joined, Ok(Ok(()))) {
        tracing::warn!("Serial reader did not shut down cleanly");
    }
}

/// Drive the MQTT event loop until shutdown, reconnecting after errors.
pub async fn supervise(
    engine: Arc<BridgeEngine>,
    client: AsyncClient,
    mut eventloop: EventLoop,
    config: MqttConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let status_topic = config.status_topic();
    let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs);

    loop {
        let event = tokio::select! {
            _ = shutdown.changed() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    tracing::warn!(
                        "MQTT broker {} refused connection: {:?}",
                        config.broker_addr(),
                        ack.code
                    );
                    continue;
                }
                tracing::info!("Connected to MQTT broker {}", config.broker_addr());
                if let Err(e) =
                    client.try_publish(&status_topic, QoS::AtLeastOnce, true, STATUS_ONLINE)
                {
                    tracing::warn!("Failed to publish status: {}", e);
                }
                if let Err(e) = engine.on_transport_connected() {
                    tracing::warn!("Connection setup incomplete: {}", e);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                // Rejections are logged and counted by the engine.
                let _ = engine.handle_inbound_message(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    "MQTT connection error: {}; retrying in {}s",
                    e,
                    reconnect_delay.as_secs()
                );
                engine.on_transport_disconnected();
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
                engine.begin_connect();
            }
        }
    }

    // Graceful exit: mark offline and disconnect before the will fires.
    let _ = client.try_publish(&status_topic, QoS::AtLeastOnce, true, STATUS_OFFLINE);
    let _ = client.try_disconnect();
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if drained.is_err() {
        tracing::debug!("MQTT disconnect did not complete in time");
    }
    tracing::info!("MQTT session closed");
}

fn log_stats(engine: &BridgeEngine) {
    let stats = engine.stats();
    tracing::info!(
        "frames {} (malformed {}, unknown {}), published {}, suppressed {}, dropped {}, \
         filter errors {}, publish errors {}, commands {} (rejected {}), write errors {}",
        stats.frames_received,
        stats.frames_malformed,
        stats.frames_unknown,
        stats.messages_published,
        stats.readings_suppressed,
        stats.readings_dropped,
        stats.filter_errors,
        stats.publish_errors,
        stats.frames_written,
        stats.inbound_rejected,
        stats.write_errors
    );
    for route in engine.route_stats() {
        tracing::debug!(
            "  route {}: {} msgs ({:.2} msg/s), {} filtered, {} commands, {} errors",
            route.label,
            route.messages_published,
            route.messages_per_second(),
            route.messages_filtered,
            route.commands_written,
            route.errors
        );
    }
}

fn reload(engine: &BridgeEngine, path: &Path) {
    tracing::info!("Reloading configuration from {}", path.display());
    match BridgeConfig::from_file(path) {
        Ok(config) => {
            if let Err(e) = engine.reload(&config) {
                tracing::error!("Reload rejected, keeping current routes: {}", e);
            } else {
                tracing::info!("Radio and broker settings take effect after a restart");
            }
        }
        Err(e) => tracing::error!("Reload failed, keeping current routes: {}", e),
    }
}

/// Wait for Ctrl+C or SIGTERM, reloading the configuration on SIGHUP.
#[cfg(unix)]
async fn wait_for_shutdown(
    engine: &BridgeEngine,
    config_path: Option<&Path>,
) -> Result<(), ServiceError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return result.map_err(ServiceError::from),
            _ = terminate.recv() => return Ok(()),
            _ = hangup.recv() => match config_path {
                Some(path) => reload(engine, path),
                None => tracing::warn!("SIGHUP ignored: no configuration file to reload"),
            },
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(
    _engine: &BridgeEngine,
    _config_path: Option<&Path>,
) -> Result<(), ServiceError> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn spawn_stats(
    engine: Arc<BridgeEngine>,
    interval_secs: u64,
) -> Option<tokio::task::JoinHandle<()>> {
    if interval_secs == 0 {
        return None;
    }
    Some(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            log_stats(&engine);
        }
    }))
}

fn spawn_housekeeping(engine: Arc<BridgeEngine>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(DEDUP_EVICT_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            engine.evict_expired_dedup();
        }
    })
}

/// Run the bridge until shutdown.
pub async fn run(config: BridgeConfig, config_path: Option<PathBuf>) -> Result<(), ServiceError> {
    let port = open_serial(&config.radio)?;
    let reader = port.try_clone().map_err(|source| ServiceError::Serial {
        port: config.radio.port.clone(),
        source,
    })?;

    let (client, eventloop) =
        AsyncClient::new(mqtt_options(&config.mqtt), MQTT_REQUEST_CAPACITY);
    let pubsub: Arc<dyn PubSub> = Arc::new(MqttPublisher::new(client.clone(), config.mqtt.qos));
    let writer = Arc::new(SerialWriter::new(port, config.radio.escaped));
    let engine = Arc::new(BridgeEngine::new(&config, pubsub, writer)?);

    tracing::info!(
        "xbee2mqtt v{}: radio {} @ {} baud, broker {}",
        env!("CARGO_PKG_VERSION"),
        config.radio.port,
        config.radio.baudrate,
        config.mqtt.broker_addr()
    );

    engine.start();
    let running = Arc::new(AtomicBool::new(true));
    let reader_handle =
        spawn_reader(reader, config.radio.escaped, engine.clone(), running.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let supervisor = tokio::spawn(supervise(
        engine.clone(),
        client,
        eventloop,
        config.mqtt.clone(),
        shutdown_rx,
    ));
    let stats = spawn_stats(engine.clone(), config.stats_interval_secs);
    let housekeeping = spawn_housekeeping(engine.clone());

    let result = wait_for_shutdown(&engine, config_path.as_deref()).await;
    tracing::info!("Shutting down...");

    engine.stop();
    running.store(false, Ordering::Relaxed);
    let _ = shutdown_tx.send(true);
    if let Some(stats) = stats {
        stats.abort();
    }
    housekeeping.abort();
    if let Err(e) = supervisor.await {
        tracing::warn!("MQTT supervisor ended abnormally: {}", e);
    }
    join_reader(reader_handle).await;

    log_stats(&engine);
    result
}

/// Print decoded readings to stdout instead of publishing them.
pub async fn run_console(config: BridgeConfig) -> Result<(), ServiceError> {
    let port = open_serial(&config.radio)?;
    let reader = port.try_clone().map_err(|source| ServiceError::Serial {
        port: config.radio.port.clone(),
        source,
    })?;

    let writer = Arc::new(SerialWriter::new(port, config.radio.escaped));
    let engine = Arc::new(BridgeEngine::new(&config, Arc::new(ConsolePubSub), writer)?);
    engine.start();
    if let Err(e) = engine.on_transport_connected() {
        tracing::warn!("Discovery failed: {}", e);
    }

    let running = Arc::new(AtomicBool::new(true));
    let reader_handle =
        spawn_reader(reader, config.radio.escaped, engine.clone(), running.clone())?;

    let housekeeping = spawn_housekeeping(engine.clone());

    tokio::signal::ctrl_c().await?;
    engine.stop();
    housekeeping.abort();
    running.store(false, Ordering::Relaxed);
    join_reader(reader_handle).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BridgeState;

    #[test]
    fn test_mqtt_options() {
        let mut config = MqttConfig::default();
        config.client_id = "gateway".into();
        config.keepalive = 30;
        config.clean_session = true;

        let options = mqtt_options(&config);
        assert_eq!(options.client_id(), "gateway");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(options.clean_session());

        let will = options.last_will().expect("will");
        assert_eq!(will.topic, "/service/gateway/status");
        assert_eq!(&will.message[..], b"0");
        assert!(will.retain);
    }

    #[test]
    fn test_mqtt_options_without_will() {
        let config = MqttConfig {
            set_will: false,
            ..Default::default()
        };
        let options = mqtt_options(&config);
        assert!(options.last_will().is_none());
        assert!(!options.clean_session());
    }

    #[tokio::test]
    async fn test_supervise_exits_on_shutdown_without_broker() {
        let config = MqttConfig {
            host: "127.0.0.1".into(),
            port: 1,
            ..Default::default()
        };
        let engine = Arc::new(
            BridgeEngine::new(
                &BridgeConfig::default(),
                Arc::new(ConsolePubSub),
                Arc::new(SerialWriter::new(Vec::new(), false)),
            )
            .expect("engine"),
        );
        engine.start();

        let (client, eventloop) = AsyncClient::new(mqtt_options(&config), 10);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send(true).expect("send");

        let finished = tokio::time::timeout(
            Duration::from_secs(10),
            supervise(engine.clone(), client, eventloop, config, shutdown_rx),
        )
        .await;
        assert!(finished.is_ok(), "supervisor did not stop");
        assert_ne!(engine.state(), BridgeState::Running);
    }

    #[tokio::test]
    async fn test_pump_frames_stops_when_cleared() {
        let engine = Arc::new(
            BridgeEngine::new(
                &BridgeConfig::default(),
                Arc::new(ConsolePubSub),
                Arc::new(SerialWriter::new(Vec::new(), false)),
            )
            .expect("engine"),
        );
        engine.start();
        let running = Arc::new(AtomicBool::new(false));

        let wire = crate::framing::encode(&[0x90, 0, 0, 0, 0, 0, 0, 0, 1], false).expect("encode");
        let pumped = {
            let engine = engine.clone();
            let running = running.clone();
            tokio::task::spawn_blocking(move || {
                pump_frames(std::io::Cursor::new(wire), false, &engine, &running)
            })
        };
        pumped.await.expect("join").expect("pump");
        assert_eq!(engine.stats().frames_received, 0);
    }
}
