//! Module for connecting to a postgres database and persisting the telemetry
//! log and the authoritative status row.
use chrono::Local;

use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use postgres::types::ToSql;
use postgres::{Client, Row};
use postgres_openssl::MakeTlsConnector;
use serde::{Deserialize, Serialize};

use crate::record::{Mode, StatusRecord, StatusUpdate, TelemetryRecord};
use crate::store::{LogStore, StatusStore, StoreError};

static SQL_CREATE_TABLES: &'static str = include_str!("sql/create_tables.sql");

static SQL_INSERT_LOG: &'static str = include_str!("sql/insert_log.sql");

static SQL_SELECT_STATUS: &'static str = include_str!("sql/select_status.sql");
static SQL_UPDATE_STATUS: &'static str = include_str!("sql/update_status.sql");
static SQL_INSERT_STATUS: &'static str = include_str!("sql/insert_status.sql");
static SQL_COUNT_STATUS: &'static str = include_str!("sql/count_status.sql");

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Struct modeling the parameters required for a database connection.
///
/// This includes SSL/TLS encryption.
pub struct DatabaseParameters {
    /// The hostname of the database server.
    pub hostname: String,
    /// The port for the database server.
    pub port: u32,
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
}

/// Builds the openssl connector for an encrypted database connection.
fn build_tls_connector(tls_params: &DatabaseTlsParameters) -> Result<MakeTlsConnector, StoreError> {
    let mut ssl_connection_builder = SslConnector::builder(SslMethod::tls())
        .map_err(|err| StoreError::Unavailable(format!("could not create ssl builder: {}", err)))?;

    ssl_connection_builder.set_verify(SslVerifyMode::NONE);

    ssl_connection_builder
        .set_ca_file(&tls_params.server_ca_path)
        .map_err(|err| StoreError::Unavailable(format!("could not set ssl ca file: {}", err)))?;
    ssl_connection_builder
        .set_certificate_file(&tls_params.client_cert_path, SslFiletype::PEM)
        .map_err(|err| {
            StoreError::Unavailable(format!("could not set ssl client cert file: {}", err))
        })?;
    ssl_connection_builder
        .set_private_key_file(&tls_params.client_key_path, SslFiletype::PEM)
        .map_err(|err| {
            StoreError::Unavailable(format!("could not set ssl client key file: {}", err))
        })?;

    Ok(MakeTlsConnector::new(ssl_connection_builder.build()))
}

/// Postgres-backed implementation of both store traits.
///
/// The daemon creates exactly one instance, owned by the coordinator
/// thread, which thereby is the only writer of either table.
pub struct PostgresStore {
    client: Client,
}

impl PostgresStore {
    /// Connects to the database described by `parameters`, with TLS when
    /// enabled.
    pub fn connect(parameters: &DatabaseParameters) -> Result<PostgresStore, StoreError> {
        let connection_string = format!(
            "user={} password={} host={} port={} dbname={} application_name=hydrod",
            parameters.username,
            parameters.password,
            parameters.hostname,
            parameters.port,
            parameters.database
        );

        let client = if parameters.tls_enable {
            let tls_params = match parameters.tls_params {
                Some(ref tls_params) => tls_params,
                None => {
                    return Err(StoreError::Unavailable(String::from(
                        "TLS enabled but no TLS parameters specified",
                    )));
                }
            };
            let tls_connector = build_tls_connector(tls_params)?;
            Client::connect(connection_string.as_str(), tls_connector)
        } else {
            Client::connect(connection_string.as_str(), postgres::NoTls)
        }
        .map_err(|err| StoreError::Unavailable(format!("could not connect: {}", err)))?;

        log::info!(target: "hydrod::db", "Database connection established!");
        Ok(PostgresStore { client })
    }

    /// Creates the log and status tables when missing and seeds the default
    /// status row (`mode=auto, chiller=OFF, fsm_state=S0`) on first start.
    pub fn initialize_schema(&mut self) -> Result<(), StoreError> {
        self.client
            .batch_execute(SQL_CREATE_TABLES)
            .map_err(|err| StoreError::Unavailable(format!("could not create tables: {}", err)))?;
        log::debug!(target: "hydrod::db", "Tables and indexes ready");

        let count_row = self
            .client
            .query(SQL_COUNT_STATUS, &[])
            .map_err(|err| StoreError::Unavailable(format!("could not count status: {}", err)))?;
        let row_count: i64 = match count_row.get(0) {
            Some(row) => row
                .try_get("row_count")
                .map_err(|err| StoreError::Unavailable(format!("bad count row: {}", err)))?,
            None => 0,
        };

        if row_count == 0 {
            let now = Local::now().naive_local();
            let seeded = self.upsert(&StatusUpdate::defaults(now.date(), now.time()))?;
            log::info!(target: "hydrod::db", "Initialized system_status with default \'{}\' mode (id {})",
                       seeded.mode, seeded.id);
        }
        Ok(())
    }
}

/// Converts a `system_status` row into a [`StatusRecord`].
fn row_to_status(row: &Row) -> Result<StatusRecord, StoreError> {
    let mode_value: String = row
        .try_get("mode")
        .map_err(|err| StoreError::Unavailable(format!("bad status row: {}", err)))?;
    let mode = mode_value
        .parse::<Mode>()
        .map_err(|_| StoreError::Unavailable(format!("unknown mode value \'{}\'", mode_value)))?;

    let chiller_value: String = row
        .try_get("chiller_status")
        .map_err(|err| StoreError::Unavailable(format!("bad status row: {}", err)))?;
    let chiller_status = chiller_value.parse().map_err(|_| {
        StoreError::Unavailable(format!("unknown chiller value \'{}\'", chiller_value))
    })?;

    Ok(StatusRecord {
        id: row
            .try_get("id")
            .map_err(|err| StoreError::Unavailable(format!("bad status row: {}", err)))?,
        mode,
        record_date: row
            .try_get("record_date")
            .map_err(|err| StoreError::Unavailable(format!("bad status row: {}", err)))?,
        record_time: row
            .try_get("record_time")
            .map_err(|err| StoreError::Unavailable(format!("bad status row: {}", err)))?,
        chiller_status,
        fsm_state: row
            .try_get("fsm_state")
            .map_err(|err| StoreError::Unavailable(format!("bad status row: {}", err)))?,
        created_at: row
            .try_get("created_at")
            .map_err(|err| StoreError::Unavailable(format!("bad status row: {}", err)))?,
    })
}

impl LogStore for PostgresStore {
    fn append(&mut self, record: &TelemetryRecord) -> Result<i64, StoreError> {
        let chiller = record.chiller.map(|state| state.as_str());
        let fsm_state = record.fsm_state.as_ref().map(|state| state.as_str());
        let params: &[&(dyn ToSql + Sync)] = &[
            &record.record_date,
            &record.record_time,
            &record.ldr_value,
            &record.battery_voltage,
            &record.temperature,
            &chiller,
            &fsm_state,
        ];

        let rows = self
            .client
            .query(SQL_INSERT_LOG, params)
            .map_err(|err| StoreError::Unavailable(format!("could not insert log row: {}", err)))?;

        match rows.get(0) {
            Some(row) => row
                .try_get("id")
                .map_err(|err| StoreError::Unavailable(format!("bad log row id: {}", err))),
            None => Err(StoreError::Unavailable(String::from(
                "log insert returned no id",
            ))),
        }
    }
}

impl StatusStore for PostgresStore {
    fn get_current(&mut self) -> Result<Option<StatusRecord>, StoreError> {
        let rows = self
            .client
            .query(SQL_SELECT_STATUS, &[])
            .map_err(|err| StoreError::Unavailable(format!("could not query status: {}", err)))?;

        match rows.get(0) {
            Some(row) => row_to_status(row).map(Some),
            None => Ok(None),
        }
    }

    fn upsert(&mut self, update: &StatusUpdate) -> Result<StatusRecord, StoreError> {
        let mode = update.mode.as_db_str();
        let chiller_status = update.chiller_status.as_str();
        let params: &[&(dyn ToSql + Sync)] = &[
            &mode,
            &update.record_date,
            &update.record_time,
            &chiller_status,
            &update.fsm_state,
        ];

        let rows = self
            .client
            .query(SQL_UPDATE_STATUS, params)
            .map_err(|err| StoreError::Unavailable(format!("could not update status: {}", err)))?;
        if let Some(row) = rows.get(0) {
            return row_to_status(row);
        }

        // No row existed yet, create the first one.
        let rows = self
            .client
            .query(SQL_INSERT_STATUS, params)
            .map_err(|err| StoreError::Unavailable(format!("could not insert status: {}", err)))?;
        match rows.get(0) {
            Some(row) => row_to_status(row),
            None => Err(StoreError::Unavailable(String::from(
                "status insert returned no row",
            ))),
        }
    }
}
