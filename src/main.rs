extern crate postgres;
extern crate chrono;
extern crate serde_json;
extern crate log;
extern crate log4rs;
extern crate ctrlc;
extern crate clap;


use std::sync::mpsc::{Sender, Receiver};
use std::sync::{mpsc, Arc};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use serde::{Serialize, Deserialize};

use std::process::exit;

use clap::App;
use std::fs::File;
use std::io::Read;

mod cache;
mod calibration;
mod database;
mod metrics;
mod record;
mod sink;
mod socket;
mod telemetry;

static DEFAULT_CONFIG_PATH: &'static str = "resources/telemetryd.yml";
static DEFAULT_LOG_CONFIG_PATH: &'static str = "resources/log.yml";

fn default_metrics_window_ms() -> u64 {
    1000
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Configuration {
    database_connection_parameters: database::DatabaseParameters,
    socket_connection_parameters: socket::SocketParameters,
    #[serde(default)]
    cache_parameters: cache::CacheParameters,
    #[serde(default)]
    calibration: calibration::Calibration,
    #[serde(default = "default_metrics_window_ms")]
    metrics_window_ms: u64,
}

fn load_configuration(path: &str) -> Result<Configuration, String> {
    let mut configuration_file = File::open(path)
        .map_err(|err| format!("Cannot open the configuration file \'{}\': \'{}\'", path, err))?;

    let mut configuration_string = String::new();
    configuration_file.read_to_string(&mut configuration_string)
        .map_err(|err| format!("Cannot read the configuration from file: \'{}\'", err))?;

    parse_configuration(configuration_string.as_str())
}

fn parse_configuration(configuration_string: &str) -> Result<Configuration, String> {
    let configuration = serde_yaml::from_str::<Configuration>(configuration_string)
        .map_err(|err| format!("Cannot deserialize the configuration: \'{}\'", err))?;

    if configuration.cache_parameters.max_entries == 0 {
        return Err(String::from("The cache must hold at least one reading (cache_parameters.max_entries > 0)"));
    }
    Ok(configuration)
}

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from(cli_yaml).get_matches();

    let log_config_path = matches.value_of("log-config").unwrap_or(DEFAULT_LOG_CONFIG_PATH);
    match log4rs::init_file(log_config_path, Default::default()) {
        Ok(_) => {},
        Err(err) => {
            eprintln!("Could not create logger from yaml configuration: {}", err);
            exit(-100);
        }
    };

    let config_path = matches.value_of("config").unwrap_or(DEFAULT_CONFIG_PATH);
    let configuration = match load_configuration(config_path) {
        Ok(configuration) => configuration,
        Err(err) => {
            log::error!(target: "telemetryd", "{}", err);
            exit(101);
        }
    };

    if matches.is_present("create-schema") {
        match database::create_schema(&configuration.database_connection_parameters) {
            Ok(_) => {
                log::info!(target: "telemetryd", "Database schema created!");
                exit(0);
            }
            Err(err) => {
                log::error!(target: "telemetryd", "Could not create the database schema: \'{}\'", err);
                exit(102);
            }
        }
    }

    let (tx, rx): (Sender<record::Telemetry>, Receiver<record::Telemetry>) = mpsc::channel();

    let terminate_programm = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let terminate_main_thread = Arc::clone(&terminate_programm);
    let terminate_socket_thread = Arc::clone(&terminate_programm);
    let terminate_telemetry_thread = Arc::clone(&terminate_programm);

    let socket_configuration = configuration.socket_connection_parameters.clone();
    let calibration = configuration.calibration.clone();
    let socket_thread = match thread::Builder::new()
        .name("socket".to_string())
        .spawn(move || {
            socket::socket_thread(tx, terminate_socket_thread, socket_configuration, calibration);
        }) {
        Ok(socket_handle) => socket_handle,
        Err(err) => {
            log::error!(target: "telemetryd", "Cannot start the udp socket thread: \'{}\'", err);
            exit(201);
        }
    };

    let writer = telemetry::TelemetryWriter::new(
        database::PostgresSink::new(configuration.database_connection_parameters.clone()),
        cache::FallbackQueue::from_parameters(&configuration.cache_parameters),
        metrics::Metrics::new(Duration::from_millis(configuration.metrics_window_ms)),
    );
    let telemetry_thread = match thread::Builder::new()
        .name("telemetry".to_string())
        .spawn(move || {
            telemetry::telemetry_thread(rx, terminate_telemetry_thread, writer);
        }) {
        Ok(telemetry_handle) => telemetry_handle,
        Err(err) => {
            log::error!(target: "telemetryd", "Cannot start the telemetry thread: \'{}\'", err);
            exit(202);
        }
    };

    ctrlc::set_handler(move || {
        log::info!(target: "telemetryd", "Termination signal received!");
        terminate_main_thread.store(true, Ordering::SeqCst);
    }).expect("Error setting Ctrl-C handler");

    match socket_thread.join() {
        Ok(_) => log::debug!(target: "telemetryd", "Joined socket thread!"),
        Err(_) => {
            log::error!(target: "telemetryd", "Could not join the socket thread!");
            exit(301);
        }
    };
    match telemetry_thread.join() {
        Ok(_) => log::debug!(target: "telemetryd", "Joined telemetry thread!"),
        Err(_) => {
            log::error!(target: "telemetryd", "Could not join the telemetry thread!");
            exit(301);
        }
    };

    log::info!(target: "telemetryd", "Exiting");
    exit(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shipped_configuration_parses() {
        let configuration = load_configuration(concat!(env!("CARGO_MANIFEST_DIR"), "/resources/telemetryd.yml")).unwrap();
        assert_eq!(configuration.cache_parameters.max_entries, 1000);
        assert_eq!(configuration.socket_connection_parameters.port, 5005);
        assert!(!configuration.database_connection_parameters.tls_enable);
    }

    #[test]
    fn optional_sections_use_defaults() {
        let configuration: Configuration = serde_yaml::from_str("
database_connection_parameters:
  hostname: localhost
  port: 5432
  username: iot
  password: secret
  database: iotdb
  tls_enable: false
  tls_params: ~
socket_connection_parameters:
  address: 0.0.0.0
  port: 5005
").unwrap();

        assert_eq!(configuration.cache_parameters.path, std::path::PathBuf::from("sensor_cache.json"));
        assert_eq!(configuration.cache_parameters.max_entries, 1000);
        assert_eq!(configuration.calibration, calibration::Calibration::default());
        assert_eq!(configuration.metrics_window_ms, 1000);
    }

    #[test]
    fn zero_cache_capacity_is_rejected() {
        let err = parse_configuration("
database_connection_parameters:
  hostname: localhost
  port: 5432
  username: iot
  password: secret
  database: iotdb
  tls_enable: false
  tls_params: ~
socket_connection_parameters:
  address: 0.0.0.0
  port: 5005
cache_parameters:
  max_entries: 0
").unwrap_err();
        assert!(err.contains("max_entries"));
    }

    #[test]
    fn missing_configuration_file_is_reported() {
        let err = load_configuration("/nonexistent/telemetryd.yml").unwrap_err();
        assert!(err.contains("Cannot open the configuration file"));
    }
}
