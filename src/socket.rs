//! Operator command intake over a UDP socket.
//!
//! The dashboard's HTTP layer is a separate process; it reaches this daemon
//! with one JSON request per datagram and receives a JSON reply on the same
//! address, e.g.
//! `{"command":"set_mode","mode":"manual"}` or
//! `{"command":"chiller","action":"ON"}`.
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{mpsc, Arc};
use std::thread::sleep;
use std::{io, time};

use serde::{Deserialize, Serialize};

use crate::command::CommandError;
use crate::coordinator::Request;
use crate::record::{ChillerState, Mode, StatusRecord};

/// How long a command may wait for the coordinator before the caller gets
/// an error reply. Covers the blocking two-step publish inside the
/// dispatcher, which is itself bounded by the mqtt client timeout.
const REPLY_TIMEOUT: time::Duration = time::Duration::from_secs(10);

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SocketParameters {
    pub address: String,
    pub port: u32,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "command", rename_all = "snake_case")]
/// Wire form of an operator request.
enum CommandRequest {
    SetMode { mode: String },
    Chiller { action: String },
}

#[derive(Debug, PartialEq)]
/// A validated operator request.
pub enum ParsedCommand {
    SetMode(Mode),
    Chiller(ChillerState),
}

#[derive(Serialize, Debug)]
/// Reply envelope, mirroring the dashboard API response shape.
struct CommandReply {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<StatusRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CommandReply {
    fn ok(message: String, data: StatusRecord) -> Self {
        CommandReply {
            success: true,
            message: Some(message),
            data: Some(data),
            error: None,
        }
    }

    fn error(error: String) -> Self {
        CommandReply {
            success: false,
            message: None,
            data: None,
            error: Some(error),
        }
    }
}

/// Validates one request datagram. Returns the error text for the reply
/// when the request is not acceptable.
pub fn parse_request(datagram: &str) -> Result<ParsedCommand, String> {
    let request = serde_json::from_str::<CommandRequest>(datagram)
        .map_err(|err| format!("Invalid request: {}", err))?;

    match request {
        CommandRequest::SetMode { mode } => mode
            .parse::<Mode>()
            .map(ParsedCommand::SetMode)
            .map_err(|_| String::from("Invalid mode. Must be \"auto\" or \"manual\"")),
        CommandRequest::Chiller { action } => action
            .parse::<ChillerState>()
            .map(ParsedCommand::Chiller)
            .map_err(|_| String::from("Invalid action. Must be \"ON\" or \"OFF\"")),
    }
}

/// Runs a validated command through the coordinator and shapes the reply.
fn execute_command(command: ParsedCommand, tx: &Sender<Request>) -> CommandReply {
    let (reply_tx, reply_rx) = mpsc::channel();
    let success_message = match command {
        ParsedCommand::SetMode(mode) => {
            let message = format!("Mode updated to {}", mode);
            match tx.send(Request::SetMode {
                mode,
                reply: reply_tx,
            }) {
                Ok(_) => {}
                Err(err) => {
                    log::error!(target: "hydrod::udp", "Could not send command to coordinator thread: \'{}\'", err);
                    return CommandReply::error(String::from("Coordinator unavailable"));
                }
            };
            message
        }
        ParsedCommand::Chiller(action) => {
            let message = format!("Chiller {} command sent", action);
            match tx.send(Request::Chiller {
                action,
                reply: reply_tx,
            }) {
                Ok(_) => {}
                Err(err) => {
                    log::error!(target: "hydrod::udp", "Could not send command to coordinator thread: \'{}\'", err);
                    return CommandReply::error(String::from("Coordinator unavailable"));
                }
            };
            message
        }
    };

    match reply_rx.recv_timeout(REPLY_TIMEOUT) {
        Ok(Ok(record)) => CommandReply::ok(success_message, record),
        Ok(Err(CommandError::PreconditionFailed)) => CommandReply::error(String::from(
            "Chiller can only be controlled manually in MANUAL mode",
        )),
        Ok(Err(err)) => CommandReply::error(format!("{}", err)),
        Err(_) => CommandReply::error(String::from("Coordinator did not answer in time")),
    }
}

/// Thread function for the command socket.
///
/// Binds a nonblocking UDP socket and answers one request per datagram
/// until the termination flag is set.
pub fn socket_thread(tx: Sender<Request>, thread_finished: Arc<AtomicBool>, params: SocketParameters) {
    let socket: UdpSocket = match UdpSocket::bind(format!("{}:{}", params.address, params.port)) {
        Ok(socket) => socket,
        Err(err) => {
            log::error!(target: "hydrod::udp", "Could not open udp socket: \'{}\'", err);
            thread_finished.store(true, Ordering::SeqCst);
            return;
        }
    };
    match socket.set_nonblocking(true) {
        Ok(_) => log::debug!(target: "hydrod::udp", "Set socket to nonblocking mode!"),
        Err(err) => {
            log::error!(target: "hydrod::udp", "Could not set socket to nonblocking mode: \'{}\'", err);
            thread_finished.store(true, Ordering::SeqCst);
            return;
        }
    }

    match socket.local_addr() {
        Ok(res) => {
            log::info!(target: "hydrod::udp", "Command socket listening on \'{}\'", res);
        }
        Err(err) => {
            log::error!(target: "hydrod::udp", "Could not get socket address: \'{}\'", err);
            thread_finished.store(true, Ordering::SeqCst);
            return;
        }
    }

    let timeout = time::Duration::from_millis(100);

    while !thread_finished.load(Ordering::SeqCst) {
        let mut buf: [u8; 1024] = [0; 1024];

        let (buf_size, addr) = match socket.recv_from(&mut buf) {
            Ok(res) => res,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                sleep(timeout);
                continue;
            }
            Err(msg) => {
                log::error!(target: "hydrod::udp", "Socket cannot recv data: \'{}\'", msg);
                continue;
            }
        };

        log::debug!(target: "hydrod::udp", "Received request with length \'{}\' from \'{}\'!", &buf_size, &addr);

        let reply = match std::str::from_utf8(&buf[..buf_size]) {
            Ok(datagram) => match parse_request(datagram.trim_end()) {
                Ok(command) => execute_command(command, &tx),
                Err(error) => CommandReply::error(error),
            },
            Err(err) => {
                log::warn!(target: "hydrod::udp", "Received request is not UTF-8: \'{}\'", err);
                CommandReply::error(String::from("Request is not UTF-8"))
            }
        };

        let reply_string = match serde_json::to_string(&reply) {
            Ok(reply_string) => reply_string,
            Err(err) => {
                log::error!(target: "hydrod::udp", "Could not serialize reply: \'{}\'", err);
                continue;
            }
        };

        match socket.send_to(reply_string.as_bytes(), addr) {
            Ok(_) => log::trace!(target: "hydrod::udp", "Sent reply to \'{}\'!", addr),
            Err(err) => {
                log::error!(target: "hydrod::udp", "Could not send reply to \'{}\': \'{}\'", addr, err);
            }
        };
    }
}
