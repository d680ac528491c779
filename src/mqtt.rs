//! MQTT transport: the telemetry subscriber thread and the control-side
//! publisher used by the command dispatcher.
extern crate paho_mqtt as mqtt;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time;
use std::time::SystemTime;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::command::{ControlPublisher, TransportError};
use crate::coordinator::Request;
use crate::protocol;

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the mqtt connection.
pub struct MqttParams {
    /// The hostname or ip address of the broker.
    pub address: String,
    /// The port of the broker.
    pub port: u32,
    /// Enable tls encryption.
    pub tls_enable: bool,
    /// Optional TLS parameters for the mqtt connection.
    pub tls_params: Option<MqttTlsParams>,
    /// Topic the device publishes telemetry on.
    pub telemetry_topic: String,
    /// Topic the device listens on for plain-text commands.
    pub control_topic: String,
    /// Topic for the retained JSON mode broadcast.
    pub status_topic: String,
    /// The QoS to use for the telemetry subscription.
    pub qos: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
/// TLS parameters required for MQTT with TLS.
pub struct MqttTlsParams {
    /// The path to the CA certificate for TLS encryption.
    pub ca_path: String,
    /// The path to the certificate to use for TLS encryption.
    pub cert_path: String,
    /// The path to the key to use for TLS encryption.
    pub key_path: String,
    /// The password for the ssl private key.
    pub key_pass: Option<String>,
}

/// Seconds since the epoch, used to build unique client ids.
fn unix_timestamp() -> Option<u64> {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => Some(n.as_secs()),
        Err(_) => None,
    }
}

fn server_uri(params: &MqttParams) -> String {
    match params.tls_enable {
        true => format!("ssl://{}:{}", params.address, params.port),
        false => format!("tcp://{}:{}", params.address, params.port),
    }
}

/// Builds the connect options, including ssl when enabled.
fn connect_options(params: &MqttParams) -> Result<mqtt::ConnectOptions, String> {
    if !params.tls_enable {
        return Ok(mqtt::ConnectOptionsBuilder::new()
            .connect_timeout(time::Duration::from_millis(4000))
            .finalize());
    }

    let tls_params = match params.tls_params {
        Some(ref tls_params) => tls_params,
        None => {
            return Err(String::from("TLS enabled but no TLS parameters specified"));
        }
    };

    let ssl_options = match tls_params.key_pass {
        Some(ref key_pass) => mqtt::SslOptionsBuilder::new()
            .trust_store(tls_params.ca_path.as_ref())
            .key_store(tls_params.cert_path.as_ref())
            .private_key(tls_params.key_path.as_ref())
            .private_key_password(key_pass.as_ref())
            .finalize(),
        None => mqtt::SslOptionsBuilder::new()
            .trust_store(tls_params.ca_path.as_ref())
            .key_store(tls_params.cert_path.as_ref())
            .private_key(tls_params.key_path.as_ref())
            .finalize(),
    };

    Ok(mqtt::ConnectOptionsBuilder::new()
        .connect_timeout(time::Duration::from_millis(4000))
        .ssl_options(ssl_options)
        .finalize())
}

/// Thread function for the telemetry subscriber.
///
/// Consumes the telemetry topic, unwraps the optional JSON envelope, parses
/// each line and hands the record to the coordinator. A message that fails
/// to decode is logged and dropped; no redelivery is requested.
pub fn thread_mqtt_ingest(
    tx: Sender<Request>,
    thread_finish: Arc<AtomicBool>,
    params: MqttParams,
) {
    let current_unix_timestamp = match unix_timestamp() {
        Some(timestamp) => timestamp,
        None => {
            log::error!(target: "hydrod::mqtt", "Invalid system time. Its before the UNIX_EPOCH");
            thread_finish.store(true, Ordering::SeqCst);
            return;
        }
    };

    let create_opts = mqtt::CreateOptionsBuilder::new()
        .server_uri(server_uri(&params))
        .client_id(format!("hydrod-{}", current_unix_timestamp))
        .finalize();

    let mut mqtt_client = match mqtt::Client::new(create_opts) {
        Ok(client) => client,
        Err(err) => {
            log::error!(target: "hydrod::mqtt", "Could not create mqtt client: \'{}\'!", err);
            thread_finish.store(true, Ordering::SeqCst);
            return;
        }
    };
    mqtt_client.set_timeout(std::time::Duration::from_millis(4000));

    let connection_opts = match connect_options(&params) {
        Ok(opts) => opts,
        Err(err) => {
            log::error!(target: "hydrod::mqtt", "{}!", err);
            thread_finish.store(true, Ordering::SeqCst);
            return;
        }
    };

    match mqtt_client.connect(connection_opts) {
        Ok((uri, status, session)) => {
            log::info!(target: "hydrod::mqtt", "Mqtt client connected: \'{}\', \'{}\', \'{}\'", uri, status, session);
        }
        Err(err) => {
            log::error!(target: "hydrod::mqtt", "Unable to connect: \'{}\'", err);
            thread_finish.store(true, Ordering::SeqCst);
            return;
        }
    };

    let receiver_queue = mqtt_client.start_consuming();

    match mqtt_client.subscribe(params.telemetry_topic.as_ref(), params.qos) {
        Ok(res) => {
            log::debug!(target: "hydrod::mqtt", "Subscribed to topic {} with qos {}: \'{}\'", params.telemetry_topic, params.qos, res);
        }
        Err(err) => {
            log::error!(target: "hydrod::mqtt", "Unable to subscribe: \'{}\'", err);
            match mqtt_client.disconnect(Option::None) {
                Ok(_) => log::info!(target: "hydrod::mqtt", "Disconnected from mqtt client!"),
                Err(err) => log::error!(target: "hydrod::mqtt", "Could not disconnect from mqtt client: {}", err),
            }
            thread_finish.store(true, Ordering::SeqCst);
            return;
        }
    };

    let timeout = time::Duration::from_millis(100);

    while !thread_finish.load(Ordering::SeqCst) {
        let message_opt = match receiver_queue.recv_timeout(timeout) {
            Ok(message_opt) => message_opt,
            Err(_) => {
                continue;
            }
        };

        match message_opt {
            Some(message) => {
                let recv_string = match std::str::from_utf8(message.payload()) {
                    Ok(string) => String::from(string),
                    Err(err) => {
                        log::warn!(target: "hydrod::mqtt", "Received non UTF-8 payload: \'{}\'", err);
                        continue;
                    }
                };

                let line = protocol::decode_envelope(recv_string.trim_end());
                let record = protocol::parse_line(&line, Local::now());
                log::debug!(target: "hydrod::mqtt", "Decoded telemetry line: \'{}\'", line);

                match tx.send(Request::Telemetry(record)) {
                    Ok(_) => {
                        log::trace!(target: "hydrod::mqtt", "Sent record to coordinator thread!")
                    }
                    Err(err) => {
                        log::error!(target: "hydrod::mqtt", "Could not send record to coordinator thread: \'{}\'", err);
                        thread_finish.store(true, Ordering::SeqCst);
                        return;
                    }
                };
            }
            None => {
                match mqtt_client.reconnect() {
                    Ok((uri, status, session)) => {
                        log::info!(target: "hydrod::mqtt", "Mqtt client reconnected: \'{}\', \'{}\', \'{}\'", uri, status, session);
                    }
                    Err(err) => {
                        log::error!(target: "hydrod::mqtt", "Unable to reconnect: \'{}\'", err);
                        thread_finish.store(true, Ordering::SeqCst);
                        return;
                    }
                };
            }
        }
    }

    match mqtt_client.disconnect(Option::None) {
        Ok(_) => log::info!(target: "hydrod::mqtt", "Disconnected from mqtt client!"),
        Err(err) => {
            log::error!(target: "hydrod::mqtt", "Could not disconnect from mqtt client: {}", err)
        }
    };
}

/// Device-facing publisher owned by the coordinator thread.
///
/// Uses its own broker connection so command publishes never contend with
/// the subscriber loop. Publishes use QoS 1 and block until the broker
/// acknowledged delivery (bounded by the client timeout), which is what the
/// dispatcher's two-step sequencing relies on.
pub struct MqttControlChannel {
    client: mqtt::Client,
}

impl MqttControlChannel {
    pub fn connect(params: &MqttParams) -> Result<MqttControlChannel, TransportError> {
        let current_unix_timestamp = unix_timestamp().ok_or_else(|| {
            TransportError(String::from("invalid system time, before the UNIX_EPOCH"))
        })?;

        let create_opts = mqtt::CreateOptionsBuilder::new()
            .server_uri(server_uri(params))
            .client_id(format!("hydrod-ctl-{}", current_unix_timestamp))
            .finalize();

        let mut client = mqtt::Client::new(create_opts)
            .map_err(|err| TransportError(format!("could not create mqtt client: {}", err)))?;
        client.set_timeout(std::time::Duration::from_millis(4000));

        let connection_opts = connect_options(params).map_err(TransportError)?;
        match client.connect(connection_opts) {
            Ok((uri, status, session)) => {
                log::info!(target: "hydrod::mqtt", "Control publisher connected: \'{}\', \'{}\', \'{}\'", uri, status, session);
            }
            Err(err) => {
                return Err(TransportError(format!("unable to connect: {}", err)));
            }
        };

        Ok(MqttControlChannel { client })
    }
}

impl ControlPublisher for MqttControlChannel {
    fn publish(&self, topic: &str, payload: &str, retained: bool) -> Result<(), TransportError> {
        let message = mqtt::MessageBuilder::new()
            .topic(topic)
            .payload(payload)
            .qos(1)
            .retained(retained)
            .finalize();

        self.client
            .publish(message)
            .map_err(|err| TransportError(format!("publish on \'{}\' failed: {}", topic, err)))
    }
}
