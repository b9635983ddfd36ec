// Copyright © 2023-2024 Vouch.io LLC, 2026 Rudis Laboratories LLC

use log::debug;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::envelope::{packet_header, Scheme};
use crate::error::{Error, Result};
use crate::response::{Response, ResponseKind};
use crate::transport::{ConnectCallback, ConnectionObserver, ObserverList, Transport};

/// UDP connection specification
#[derive(Debug, Clone)]
pub struct UdpSpecs {
    pub host: String,
    pub port: u16,
    pub timeout_s: u32,
    pub mtu: usize,
}

impl Default for UdpSpecs {
    fn default() -> Self {
        UdpSpecs {
            host: String::new(),
            port: 1337,
            timeout_s: 5,
            mtu: 1024,
        }
    }
}

/// UDP transport for SMP over network
pub struct UdpTransport {
    socket: UdpSocket,
    addr: SocketAddr,
    mtu: usize,
    timeout: Mutex<Duration>,
    // one request on the wire at a time, so stale datagrams can be told apart
    exchange: Mutex<()>,
    connected: AtomicBool,
    observers: ObserverList,
}

impl UdpTransport {
    pub fn new(config: &UdpSpecs) -> Result<Self> {
        let addr_str = format!("{}:{}", config.host, config.port);
        let addr: SocketAddr = addr_str
            .to_socket_addrs()
            .map_err(|e| Error::Transport(format!("failed to resolve address {addr_str}: {e}")))?
            .next()
            .ok_or_else(|| Error::Transport(format!("no address found for {addr_str}")))?;

        let bind = if addr.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind)?;
        let timeout = Duration::from_secs(config.timeout_s as u64);
        socket.set_write_timeout(Some(timeout))?;

        Ok(UdpTransport {
            socket,
            addr,
            mtu: config.mtu,
            timeout: Mutex::new(timeout),
            exchange: Mutex::new(()),
            connected: AtomicBool::new(false),
            observers: ObserverList::default(),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn timeout(&self) -> Duration {
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_connected(&self) {
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.observers.notify_connected();
        }
    }

    /// Wait for the datagram answering `packet`, dropping stale answers
    /// to earlier requests that timed out.
    fn receive(&self, packet: &[u8]) -> Result<Vec<u8>> {
        let request = packet_header(Scheme::Udp, packet)?;
        let deadline = Instant::now() + self.timeout();
        let mut buf = vec![0u8; self.mtu.max(4096)];
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .filter(|d| !d.is_zero())
                .ok_or(Error::Timeout)?;
            self.socket.set_read_timeout(Some(remaining))?;
            let (len, src) = match self.socket.recv_from(&mut buf) {
                Ok(r) => r,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(Error::Timeout)
                }
                Err(e) => return Err(e.into()),
            };
            debug!("UDP RX: {} bytes from {}", len, src);
            if src != self.addr {
                continue;
            }
            let response = match packet_header(Scheme::Udp, &buf[..len]) {
                Ok(h) => h,
                Err(e) => {
                    debug!("dropping datagram: {}", e);
                    continue;
                }
            };
            if request.matches_response(&response) {
                return Ok(buf[..len].to_vec());
            }
            debug!(
                "dropping stale response seq {} (waiting for {})",
                response.seq, request.seq
            );
        }
    }
}

impl Transport for UdpTransport {
    fn scheme(&self) -> Scheme {
        Scheme::Udp
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn send(&self, packet: &[u8], kind: ResponseKind) -> Result<Response> {
        if packet.len() > self.mtu {
            return Err(Error::InsufficientMtu {
                required: packet.len(),
                mtu: self.mtu,
            });
        }
        self.mark_connected();
        let _exchange = self.exchange.lock().unwrap_or_else(PoisonError::into_inner);

        debug!("UDP TX: {} bytes to {}", packet.len(), self.addr);
        self.socket.send_to(packet, self.addr)?;

        let bytes = self.receive(packet)?;
        Response::decode(Scheme::Udp, bytes, kind)
    }

    fn connect(&self, callback: Option<ConnectCallback>) {
        // connectionless; the first exchange proves reachability
        self.mark_connected();
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    fn release(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
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
        *self.timeout.lock().unwrap_or_else(PoisonError::into_inner) =
            Duration::from_millis(timeout_ms as u64);
        Ok(())
    }
}
