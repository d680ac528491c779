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

use serde::{Serialize, Deserialize};

use std::process::exit;

use clap::App;
use std::fs::File;
use std::io::Read;

mod record;
mod protocol;
mod store;
mod database;
mod reconcile;
mod command;
mod coordinator;
mod mqtt;
mod socket;

#[derive(Serialize, Deserialize, Debug, Clone)]
struct Configuration {
    database_connection_parameters: database::DatabaseParameters,
    mqtt_connection_parameters: mqtt::MqttParams,
    socket_connection_parameters: socket::SocketParameters
}

fn main() {
    let cli_yaml = clap::load_yaml!("cli.yml");
    let matches = App::from(cli_yaml).get_matches();
    let configuration_path = matches.value_of("config").unwrap_or("resources/hydrod.yml");

    match log4rs::init_file("resources/log.yml", Default::default()) {
        Ok(_) => {},
        Err(err) => {
            log::error!("Could not create logger from yaml configuration: {}", err);
            exit(-100);
        }
    };

    let (tx, rx): (Sender<coordinator::Request>, Receiver<coordinator::Request>) = mpsc::channel();

    let terminate_programm = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let terminate_main_thread = Arc::clone(&terminate_programm);
    let terminate_mqtt_thread = Arc::clone(&terminate_programm);
    let terminate_socket_thread = Arc::clone(&terminate_programm);
    let terminate_coordinator_thread = Arc::clone(&terminate_programm);

    let mut configuration_file = match File::open(configuration_path) {
        Ok(file) => file,
        Err(err) => {
            log::error!(target: "hydrod", "Cannot open the configuration file: \'{}\'", err);
            return;
        }
    };

    let mut configuration_string = String::new();
    match configuration_file.read_to_string(& mut configuration_string) {
        Ok(_) => {},
        Err(err) => {
            log::error!(target: "hydrod", "Cannot read the configuration from file: \'{}\'", err);
            return;
        }
    };

    let configuration = match serde_yaml::from_str::<Configuration>(configuration_string.as_str()) {
        Ok(res) => res,
        Err(err) => {
            log::error!(target: "hydrod", "Cannot deserialize the configuration: \'{}\'", err);
            return;
        }
    };


    let mqtt_configuration = configuration.mqtt_connection_parameters.clone();
    let mqtt_tx = tx.clone();
    let mqtt_thread = match thread::Builder::new()
        .name("mqtt".to_string())
        .spawn(move || {
            mqtt::thread_mqtt_ingest(mqtt_tx, terminate_mqtt_thread, mqtt_configuration);
        }) {
        Ok(mqtt_handle) => mqtt_handle,
        Err(err) => {
            log::error!(target: "hydrod", "Cannot start the mqtt thread: \'{}\'", err);
            exit(201);
        }
    };

    let socket_configuration = configuration.socket_connection_parameters.clone();
    let socket_thread = match thread::Builder::new()
        .name("socket".to_string())
        .spawn(move || {
            socket::socket_thread(tx, terminate_socket_thread, socket_configuration);
        }) {
        Ok(socket_handle) => socket_handle,
        Err(err) => {
            log::error!(target: "hydrod", "Cannot start the command socket thread: \'{}\'", err);
            exit(202);
        }
    };

    let database_configuration = configuration.database_connection_parameters.clone();
    let control_configuration = configuration.mqtt_connection_parameters.clone();
    let coordinator_thread = match thread::Builder::new()
        .name("coordinator".to_string())
        .spawn(move || {
            coordinator::coordinator_thread(rx, terminate_coordinator_thread, database_configuration, control_configuration);
        }) {
        Ok(coordinator_handle) => coordinator_handle,
        Err(err) => {
            log::error!(target: "hydrod", "Cannot start the coordinator thread: \'{}\'", err);
            exit(203);
        }
    };

    ctrlc::set_handler(move || {
        log::info!(target: "hydrod","Termination signal received!");
        terminate_main_thread.store(true, Ordering::SeqCst);
    }).expect("Error setting Ctrl-C handler");

    match mqtt_thread.join() {
        Ok(_) => log::debug!(target: "hydrod", "Joined mqtt thread!"),
        Err(_) => {
            log::error!(target: "hydrod", "Could not join the mqtt thread!");
            exit(301);
        }
    };
    match socket_thread.join() {
        Ok(_) => log::debug!(target: "hydrod", "Joined socket thread!"),
        Err(_) => {
            log::error!(target: "hydrod", "Could not join the socket thread!");
            exit(301);
        }
    };
    match coordinator_thread.join() {
        Ok(_) => log::debug!(target: "hydrod", "Joined coordinator thread!"),
        Err(_) => {
            log::error!(target: "hydrod", "Could not join the coordinator thread!");
            exit(301);
        }
    };

    log::info!(target: "hydrod", "Exiting");
    exit(0);
}
