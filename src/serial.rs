// Copyright © 2023-2024 Vouch.io LLC, 2026 Rudis Laboratories LLC

use base64::{engine::general_purpose, Engine as _};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use crc16::*;
use log::{debug, warn};
use serialport::SerialPort;
use std::cmp::min;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::envelope::{packet_header, Scheme};
use crate::error::{Error, Result};
use crate::response::{Response, ResponseKind};
use crate::transport::{ConnectCallback, ConnectionObserver, ObserverList, Transport};

const FRAME_START: [u8; 2] = [6, 9];
const FRAME_CONTINUATION: [u8; 2] = [4, 20];

#[derive(Debug, Clone)]
pub struct SerialSpecs {
    pub device: String,
    pub initial_timeout_s: u32,
    pub subsequent_timeout_ms: u32,
    pub nb_retry: u32,
    pub linelength: usize,
    pub mtu: usize,
    pub baudrate: u32,
}

/// SMP over a serial console, using the base64 line framing of the
/// mcumgr serial transport.
pub struct SerialTransport {
    port: Mutex<Option<Box<dyn SerialPort>>>,
    specs: SerialSpecs,
    // the first upload ack switches to the shorter per-chunk timeout
    fast_timeout: AtomicBool,
    observers: ObserverList,
}

impl SerialTransport {
    /// The port is opened lazily by [`Transport::connect`].
    pub fn new(specs: SerialSpecs) -> SerialTransport {
        SerialTransport {
            port: Mutex::new(None),
            specs,
            fast_timeout: AtomicBool::new(false),
            observers: ObserverList::default(),
        }
    }

    pub fn specs(&self) -> &SerialSpecs {
        &self.specs
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn SerialPort>>> {
        self.port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) -> Result<bool> {
        let mut port = self.lock();
        if port.is_some() {
            return Ok(false);
        }
        *port = Some(open_port(&self.specs)?);
        Ok(true)
    }

    fn exchange(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let request = packet_header(Scheme::Serial, packet)?;
        let data = encode_request(self.specs.linelength, packet)?;

        let mut guard = self.lock();
        let port = guard.as_mut().ok_or(Error::Disconnected)?;

        let mut attempts = 0;
        loop {
            match transceive(&mut **port, &data) {
                Ok(bytes) => {
                    let response = packet_header(Scheme::Serial, &bytes)?;
                    if !request.matches_response(&response) {
                        return Err(Error::MalformedResponse(format!(
                            "response {response:?} does not answer request {request:?}"
                        )));
                    }
                    return Ok(bytes);
                }
                Err(Error::Timeout) if attempts < self.specs.nb_retry => {
                    attempts += 1;
                    warn!("timeout, retry {}/{}", attempts, self.specs.nb_retry);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Transport for SerialTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Serial
    }

    fn mtu(&self) -> usize {
        self.specs.mtu
    }

    fn send(&self, packet: &[u8], kind: ResponseKind) -> Result<Response> {
        if packet.len() > self.specs.mtu {
            return Err(Error::InsufficientMtu {
                required: packet.len(),
                mtu: self.specs.mtu,
            });
        }
        if self.open()? {
            self.observers.notify_connected();
        }
        let bytes = self.exchange(packet)?;
        let response = Response::decode(Scheme::Serial, bytes, kind)?;

        if kind == ResponseKind::UploadAck && !self.fast_timeout.swap(true, Ordering::SeqCst) {
            self.set_timeout(self.specs.subsequent_timeout_ms)?;
        }
        Ok(response)
    }

    fn connect(&self, callback: Option<ConnectCallback>) {
        let result = self.open().map(|opened| {
            if opened {
                self.observers.notify_connected();
            }
        });
        if let Some(callback) = callback {
            callback(result);
        }
    }

    fn release(&self) {
        let closed = self.lock().take().is_some();
        if closed {
            self.fast_timeout.store(false, Ordering::SeqCst);
            self.observers.notify_disconnected();
        }
    }

    fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        self.observers.add(observer);
    }

    fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>) {
        self.observers.remove(observer);
    }

    fn set_timeout(&self, timeout_ms: u32) -> Result<()> {
        if let Some(port) = self.lock().as_mut() {
            port.set_timeout(Duration::from_millis(timeout_ms as u64))
                .map_err(serial_error)?;
        }
        Ok(())
    }
}

fn serial_error(e: serialport::Error) -> Error {
    Error::Transport(e.to_string())
}

fn io_error(e: std::io::Error) -> Error {
    if e.kind() == ErrorKind::TimedOut {
        Error::Timeout
    } else {
        Error::Io(e)
    }
}

fn read_byte(port: &mut dyn SerialPort) -> Result<u8> {
    let mut byte = [0u8];
    port.read_exact(&mut byte).map_err(io_error)?;
    Ok(byte[0])
}

fn expect_byte(port: &mut dyn SerialPort, b: u8) -> Result<()> {
    let read = read_byte(port)?;
    if read != b {
        return Err(Error::MalformedResponse(format!(
            "read error, expected: {b}, read: {read}"
        )));
    }
    Ok(())
}

pub fn open_port(specs: &SerialSpecs) -> Result<Box<dyn SerialPort>> {
    debug!("opening {} at {} baud", specs.device, specs.baudrate);
    serialport::new(&specs.device, specs.baudrate)
        .timeout(Duration::from_secs(specs.initial_timeout_s as u64))
        .open()
        .map_err(|e| Error::Transport(format!("failed to open serial port {}: {e}", specs.device)))
}

/// Frame a complete SMP packet for the console: CRC16 trailer, length
/// prefix, base64, then split into marked lines of at most `linelength`.
pub fn encode_request(linelength: usize, packet: &[u8]) -> Result<Vec<u8>> {
    if linelength <= FRAME_START.len() + 2 {
        return Err(Error::InvalidArgument(format!(
            "line length {linelength} leaves no room for data"
        )));
    }
    let mut serialized = packet.to_vec();
    debug!("serialized: {}", hex::encode(&serialized));

    // calculate CRC16 of it and append to the request
    let checksum = State::<XMODEM>::calculate(&serialized);
    serialized.write_u16::<BigEndian>(checksum)?;

    // prepend chunk length
    let mut len: Vec<u8> = Vec::new();
    len.write_u16::<BigEndian>(serialized.len() as u16)?;
    serialized.splice(0..0, len);
    debug!(
        "encoded with packet length and checksum: {}",
        hex::encode(&serialized)
    );

    let base64_data = general_purpose::STANDARD.encode(&serialized).into_bytes();
    let mut data = Vec::<u8>::new();

    // transfer in blocks of max linelength bytes per line
    let mut written = 0;
    let totlen = base64_data.len();
    while written < totlen {
        if written == 0 {
            data.extend_from_slice(&FRAME_START);
        } else {
            data.extend_from_slice(&FRAME_CONTINUATION);
        }
        let write_len = min(linelength - 4, totlen - written);
        data.extend_from_slice(&base64_data[written..written + write_len]);
        data.push(b'\n');
        written += write_len;
    }

    Ok(data)
}

/// Write a framed request and read back one framed response packet.
pub fn transceive(port: &mut dyn SerialPort, data: &[u8]) -> Result<Vec<u8>> {
    // empty input buffer
    let to_read = port.bytes_to_read().map_err(serial_error)?;
    for _ in 0..to_read {
        read_byte(&mut *port)?;
    }

    port.write_all(data).map_err(io_error)?;

    let mut expected_len = 0;
    let mut result: Vec<u8> = Vec::new();
    loop {
        // first wait for the chunk start marker
        let marker = if result.is_empty() {
            FRAME_START
        } else {
            FRAME_CONTINUATION
        };
        for b in marker {
            expect_byte(&mut *port, b)?;
        }

        // next read until newline
        loop {
            let b = read_byte(&mut *port)?;
            if b == b'\n' {
                break;
            }
            result.push(b);
        }

        let decoded = decode_base64(&result)?;
        if decoded.len() < 2 {
            continue;
        }
        if expected_len == 0 {
            expected_len = BigEndian::read_u16(&decoded) as usize;
            debug!("expected length: {}", expected_len);
        }

        // stop when done
        if decoded.len() - 2 >= expected_len {
            break;
        }
    }

    let decoded = decode_base64(&result)?;

    // the length prefix covers the packet plus its 2-byte checksum
    let len = BigEndian::read_u16(&decoded) as usize;
    if len != decoded.len() - 2 || len < 2 {
        return Err(Error::MalformedResponse("wrong chunk length".to_string()));
    }

    let packet = decoded[2..decoded.len() - 2].to_vec();
    let read_checksum = BigEndian::read_u16(&decoded[decoded.len() - 2..]);
    let calculated_checksum = State::<XMODEM>::calculate(&packet);
    if read_checksum != calculated_checksum {
        return Err(Error::MalformedResponse("wrong checksum".to_string()));
    }
    debug!("response packet: {}", hex::encode(&packet));

    Ok(packet)
}

fn decode_base64(data: &[u8]) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::MalformedResponse(format!("invalid base64: {e}")))
}
