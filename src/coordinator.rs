//! The store-owning coordinator thread.
//!
//! Every status read-modify-write in the daemon, whether it originates from
//! a telemetry message or from an operator command, flows through the one
//! request channel consumed here and executes in arrival order. That
//! channel is the single-writer scope that keeps telemetry merges and
//! command-driven updates from interleaving.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time;

use crate::command::{CommandError, ControlTopics, Dispatcher};
use crate::database::{DatabaseParameters, PostgresStore};
use crate::mqtt::{MqttControlChannel, MqttParams};
use crate::reconcile::reconcile;
use crate::record::{ChillerState, Mode, StatusRecord, TelemetryRecord};
use crate::store::{LogStore, StatusStore};

/// One unit of work for the coordinator.
pub enum Request {
    /// A parsed telemetry message: append to the log and reconcile the
    /// status row, independently of each other.
    Telemetry(TelemetryRecord),
    /// Operator mode change.
    SetMode {
        mode: Mode,
        reply: Sender<Result<StatusRecord, CommandError>>,
    },
    /// Operator chiller command, mode-gated.
    Chiller {
        action: ChillerState,
        reply: Sender<Result<StatusRecord, CommandError>>,
    },
}

/// Thread function for the coordinator.
///
/// Connects to the database and the control side of the mqtt broker,
/// prepares the schema, broadcasts the stored mode once, then serves
/// requests until the termination flag is set or the request channel is
/// closed. Failures while handling a single request are logged or replied
/// and never stop the loop.
pub fn coordinator_thread(
    rx: Receiver<Request>,
    thread_finish: Arc<AtomicBool>,
    database_parameters: DatabaseParameters,
    mqtt_parameters: MqttParams,
) {
    let mut store = match PostgresStore::connect(&database_parameters) {
        Ok(store) => store,
        Err(err) => {
            log::error!(target: "hydrod::coord", "Could not establish database connection: \'{}\'", err);
            thread_finish.store(true, Ordering::SeqCst);
            return;
        }
    };

    match store.initialize_schema() {
        Ok(_) => {}
        Err(err) => {
            log::error!(target: "hydrod::coord", "Could not prepare database schema: \'{}\'", err);
            thread_finish.store(true, Ordering::SeqCst);
            return;
        }
    };

    let publisher = match MqttControlChannel::connect(&mqtt_parameters) {
        Ok(publisher) => publisher,
        Err(err) => {
            log::error!(target: "hydrod::coord", "Could not connect control publisher: \'{}\'", err);
            thread_finish.store(true, Ordering::SeqCst);
            return;
        }
    };

    let topics = ControlTopics {
        control: mqtt_parameters.control_topic.clone(),
        status: mqtt_parameters.status_topic.clone(),
    };
    let dispatcher = Dispatcher::new(&publisher, &topics);

    // Tell the device which mode is authoritative before any traffic flows.
    match store.get_current() {
        Ok(current) => {
            let mode = current.map(|status| status.mode).unwrap_or(Mode::Auto);
            match dispatcher.broadcast_mode(mode) {
                Ok(_) => {
                    log::info!(target: "hydrod::coord", "Broadcast current mode \'{}\'", mode)
                }
                Err(err) => {
                    log::warn!(target: "hydrod::coord", "Could not broadcast current mode: \'{}\'", err)
                }
            }
        }
        Err(err) => {
            log::warn!(target: "hydrod::coord", "Could not read status for startup broadcast: \'{}\'", err)
        }
    };

    let timeout = time::Duration::from_millis(100);

    while !thread_finish.load(Ordering::SeqCst) {
        let request = match rx.recv_timeout(timeout) {
            Ok(request) => request,
            Err(RecvTimeoutError::Timeout) => {
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::error!(target: "hydrod::coord", "Request channel closed, stopping!");
                thread_finish.store(true, Ordering::SeqCst);
                return;
            }
        };

        match request {
            Request::Telemetry(record) => handle_telemetry(&mut store, record),
            Request::SetMode { mode, reply } => {
                let result = dispatcher.set_mode(&mut store, mode);
                if let Err(ref err) = result {
                    log::error!(target: "hydrod::coord", "Mode change failed: \'{}\'", err);
                }
                match reply.send(result) {
                    Ok(_) => {}
                    Err(_) => {
                        log::warn!(target: "hydrod::coord", "Mode change reply receiver is gone!")
                    }
                };
            }
            Request::Chiller { action, reply } => {
                let result = dispatcher.control_actuator(&mut store, action);
                if let Err(ref err) = result {
                    log::error!(target: "hydrod::coord", "Chiller command failed: \'{}\'", err);
                }
                match reply.send(result) {
                    Ok(_) => {}
                    Err(_) => {
                        log::warn!(target: "hydrod::coord", "Chiller command reply receiver is gone!")
                    }
                };
            }
        }
    }
}

/// Runs the two independent, best-effort writes for one telemetry message.
///
/// The log append and the status reconcile are isolated from each other: a
/// failure in one is logged and does not block the other, and neither is
/// retried.
fn handle_telemetry<S: LogStore + StatusStore>(store: &mut S, record: TelemetryRecord) {
    match store.append(&record) {
        Ok(id) => {
            log::debug!(target: "hydrod::coord", "Stored log entry with id \'{}\'", id)
        }
        Err(err) => {
            log::error!(target: "hydrod::coord", "Log append failed: \'{}\'", err)
        }
    };

    match reconcile(store, &record) {
        Ok(Some(status)) => {
            log::debug!(target: "hydrod::coord",
                        "Reconciled status: mode \'{}\', chiller \'{}\', state \'{}\'",
                        status.mode, status.chiller_status, status.fsm_state)
        }
        Ok(None) => {
            log::trace!(target: "hydrod::coord", "Message carried no status fields, skipped status write")
        }
        Err(err) => {
            log::error!(target: "hydrod::coord", "Status reconcile failed: \'{}\'", err)
        }
    };
}
