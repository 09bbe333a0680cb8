//! Module for receiving telemetry datagrams from the station over UDP.
use std::{io, time};
use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::sleep;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::calibration::{Calibration, RawSample};
use crate::record::{DetectionEvent, Reading, SensorValues, Telemetry};

#[derive(Serialize, Deserialize, Debug, Clone)]
/// Parameters for the udp socket.
pub struct SocketParameters {
    /// The ip address the socket should listen on.
    pub address: String,
    /// The port the socket should listen on.
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Payload of a single datagram.
enum Datagram {
    /// Calibrated values from the sensor acquisition.
    Reading(SensorValues),
    /// Uncalibrated channel values.
    Raw(RawSample),
    /// Result of the object detector.
    Detection { label: String, count: i32 },
}

/// Parses a datagram and turns it into a timestamped record.
///
/// The record is stamped here, on arrival, and the timestamp is not changed afterwards.
pub fn parse_datagram(payload: &[u8], calibration: &Calibration) -> Result<Telemetry, String> {
    let text = std::str::from_utf8(payload)
        .map_err(|err| format!("Received data cannot be converted to UTF-8 str: \'{}\'", err))?;

    let datagram = serde_json::from_str::<Datagram>(text.trim_end())
        .map_err(|err| format!("Received data cannot be deserialized via JSON: \'{}\'", err))?;

    let record = match datagram {
        Datagram::Reading(values) => Telemetry::Reading(Reading::new(values)),
        Datagram::Raw(sample) => Telemetry::Reading(Reading::new(calibration.apply(&sample))),
        Datagram::Detection { label, count } => Telemetry::Detection(DetectionEvent {
            label,
            count,
            timestamp: Utc::now(),
        }),
    };
    Ok(record)
}

pub fn socket_thread(tx: Sender<Telemetry>, thread_finished: Arc<AtomicBool>, params: SocketParameters, calibration: Calibration) {
    let socket: UdpSocket = match UdpSocket::bind(format!("{}:{}", params.address, params.port)) {
        Ok(socket) => socket,
        Err(err) => {
            log::error!(target: "telemetryd::udp", "Could not open udp socket: \'{}\'", err);
            thread_finished.store(true, Ordering::SeqCst);
            return;
        }
    };
    match socket.set_nonblocking(true) {
        Ok(_) => log::debug!(target: "telemetryd::udp", "Set socket to nonblocking mode!"),
        Err(err) => {
            log::error!(target: "telemetryd::udp", "Could not set socket to nonblocking mode: \'{}\'", err);
            thread_finished.store(true, Ordering::SeqCst);
            return;
        }
    }

    match socket.local_addr() {
        Ok(res) => {
            log::info!(target: "telemetryd::udp", "Socket Addr: \'{}\'", res);
        }
        Err(err) => {
            log::error!(target: "telemetryd::udp", "Could not get socket address: \'{}\'", err);
            thread_finished.store(true, Ordering::SeqCst);
            return;
        }
    }

    let timeout = time::Duration::from_millis(100);

    while !thread_finished.load(Ordering::SeqCst) {
        // Datagrams larger than the buffer are cut off and fail to parse.
        let mut buf: [u8; 1024] = [0; 1024];

        let (buf_size, addr) = match socket.recv_from(&mut buf) {
            Ok(res) => res,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                sleep(timeout);
                continue;
            }
            Err(msg) => {
                log::error!(target: "telemetryd::udp", "Socket cannot recv data: \'{}\'", msg);
                continue;
            }
        };

        log::debug!(target: "telemetryd::udp", "Received data with length: \'{}\' from \'{}\'!", &buf_size, &addr);

        let record = match parse_datagram(&buf[..buf_size], &calibration) {
            Ok(record) => record,
            Err(err) => {
                log::warn!(target: "telemetryd::udp", "{}", err);
                continue;
            }
        };

        match tx.send(record) {
            Ok(_) => log::trace!(target: "telemetryd::udp", "Send record to telemetry thread!"),
            Err(err) => {
                log::error!(target: "telemetryd::udp", "Could not send record to telemetry thread: \'{}\'", err);
                thread_finished.store(true, Ordering::SeqCst);
                return;
            }
        };
    }
}
