//! Module for connecting to a postgres database and storing telemetry records in it.
use std::time::Duration;

use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use postgres::types::ToSql;
use postgres::{Client, Config};
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};

use crate::record::{DetectionEvent, Reading};
use crate::sink::{DurableSink, SinkError, SinkSession};

static SQL_CREATE_TABLES: &'static str = include_str!("sql/create_tables.sql");

static SQL_INSERT_READING: &'static str = include_str!("sql/insert_reading.sql");
static SQL_INSERT_DETECTION: &'static str = include_str!("sql/insert_detection.sql");

fn default_timeout_ms() -> u64 {
    5000
}

fn default_verify_peer() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct modeling the parameters required for a database connection.
///
/// This includes SSL/TLS encryption.
pub struct DatabaseParameters
{
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    pub port: u16,
    /// The username to connect as.
    pub username: String,
    /// The password to connect with.
    pub password: String,
    /// The database to open on the server.
    pub database: String,
    /// Flag to enable tls for the database server connection.
    pub tls_enable: bool,
    /// Parameters for the tls connection to the database server.
    pub tls_params: Option<DatabaseTlsParameters>,
    /// Time allowed for establishing a connection, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Time a single statement may run before the server aborts it, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub statement_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct for the parameters required for a tls connection to the database.
pub struct DatabaseTlsParameters {
    /// The path to the server certificate for TLS encryption.
    pub server_ca_path: String,
    /// The path to the client certificate for TLS encryption.
    pub client_cert_path: String,
    /// The path to the client key for TLS encryption.
    pub client_key_path: String,
    /// Verify the server certificate against the CA.
    #[serde(default = "default_verify_peer")]
    pub verify_peer: bool,
}

fn statement_error(err: postgres::Error) -> SinkError {
    SinkError::Statement(err.to_string())
}

fn connect_error(err: postgres::Error) -> SinkError {
    SinkError::Connect(err.to_string())
}

/// Builds the connection configuration including the timeouts.
fn client_config(connection_parameters: &DatabaseParameters) -> Config {
    let mut config = Config::new();
    config
        .host(&connection_parameters.hostname)
        .port(connection_parameters.port)
        .user(&connection_parameters.username)
        .password(&connection_parameters.password)
        .dbname(&connection_parameters.database)
        .application_name("telemetryd")
        .connect_timeout(Duration::from_millis(connection_parameters.connect_timeout_ms))
        .options(&format!("-c statement_timeout={}", connection_parameters.statement_timeout_ms));
    config
}

fn tls_connector(connection_parameters: &DatabaseParameters) -> Result<MakeTlsConnector, SinkError> {
    let tls_params = connection_parameters.tls_params.as_ref().ok_or(SinkError::MissingTlsParameters)?;

    let mut ssl_connection_builder = SslConnector::builder(SslMethod::tls())?;
    if tls_params.verify_peer {
        ssl_connection_builder.set_verify(SslVerifyMode::PEER);
    } else {
        log::warn!(target: "telemetryd::db", "Server certificate verification is disabled!");
        ssl_connection_builder.set_verify(SslVerifyMode::NONE);
    }
    ssl_connection_builder.set_ca_file(&tls_params.server_ca_path)?;
    ssl_connection_builder.set_certificate_file(&tls_params.client_cert_path, SslFiletype::PEM)?;
    ssl_connection_builder.set_private_key_file(&tls_params.client_key_path, SslFiletype::PEM)?;

    Ok(MakeTlsConnector::new(ssl_connection_builder.build()))
}

/// Opens a new connection to the database.
///
/// # Errors
///
/// Errors occur when one of the following conditions is met:
///
/// * The files for the TLS connection cannot be found.
///
/// * The connection cannot be established within the connect timeout.
///
/// * The the user is not authorized for the database.
///
pub fn connect(connection_parameters: &DatabaseParameters) -> Result<Client, SinkError> {
    let config = client_config(connection_parameters);
    let client = match connection_parameters.tls_enable {
        true => config.connect(tls_connector(connection_parameters)?).map_err(connect_error)?,
        false => config.connect(postgres::NoTls).map_err(connect_error)?,
    };
    log::debug!(target: "telemetryd::db", "Database connection established!");
    Ok(client)
}

/// Creates the telemetry tables if they do not exist yet.
pub fn create_schema(connection_parameters: &DatabaseParameters) -> Result<(), SinkError> {
    let mut client = connect(connection_parameters)?;
    client.batch_execute(SQL_CREATE_TABLES).map_err(statement_error)?;
    client.close().map_err(statement_error)?;
    Ok(())
}

/// Durable sink backed by a postgres database.
pub struct PostgresSink {
    connection_parameters: DatabaseParameters,
}

impl PostgresSink {
    pub fn new(connection_parameters: DatabaseParameters) -> Self {
        PostgresSink { connection_parameters }
    }
}

impl DurableSink for PostgresSink {
    type Session = PostgresSession;

    fn open(&mut self) -> Result<PostgresSession, SinkError> {
        let mut client = connect(&self.connection_parameters)?;
        client.batch_execute("BEGIN").map_err(statement_error)?;
        Ok(PostgresSession { client })
    }
}

/// A connection with an open transaction.
///
/// Every insert runs inside its own savepoint so a failing statement does not abort the
/// transaction for the inserts before it.
pub struct PostgresSession {
    client: Client,
}

impl PostgresSession {
    fn execute_guarded(&mut self, statement: &str, params: &[&(dyn ToSql + Sync)]) -> Result<(), SinkError> {
        self.client.batch_execute("SAVEPOINT telemetry_entry").map_err(statement_error)?;

        match self.client.execute(statement, params) {
            Ok(_) => self.client.batch_execute("RELEASE SAVEPOINT telemetry_entry").map_err(statement_error),
            Err(err) => {
                if let Err(rollback_err) = self.client.batch_execute("ROLLBACK TO SAVEPOINT telemetry_entry") {
                    log::warn!(target: "telemetryd::db", "Could not roll back to savepoint: \'{}\'", rollback_err);
                }
                Err(statement_error(err))
            }
        }
    }

    fn finish(mut self, statement: &str) -> Result<(), SinkError> {
        self.client.batch_execute(statement).map_err(statement_error)?;
        if let Err(err) = self.client.close() {
            log::debug!(target: "telemetryd::db", "Could not close database connection cleanly: \'{}\'", err);
        }
        Ok(())
    }
}

impl SinkSession for PostgresSession {
    fn insert_reading(&mut self, reading: &Reading) -> Result<(), SinkError> {
        let values = &reading.values;
        let timestamp = reading.timestamp();
        let gas = reading.gas();
        self.execute_guarded(SQL_INSERT_READING, &[
            &values.temperature,
            &values.humidity,
            &values.ph,
            &values.illuminance,
            &values.gas_mq2,
            &values.gas_mq135,
            &values.mq2_status,
            &values.mq135_status,
            &timestamp,
            &gas,
        ])
    }

    fn insert_detection(&mut self, event: &DetectionEvent) -> Result<(), SinkError> {
        self.execute_guarded(SQL_INSERT_DETECTION, &[&event.label, &event.count, &event.timestamp])
    }

    fn commit(self) -> Result<(), SinkError> {
        self.finish("COMMIT")
    }

    fn rollback(self) -> Result<(), SinkError> {
        self.finish("ROLLBACK")
    }
}
