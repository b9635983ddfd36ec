// Copyright © 2023-2024 Vouch.io LLC, 2026 Rudis Laboratories LLC

use lazy_static::lazy_static;
use log::debug;
use rand::{thread_rng, Rng};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use crate::envelope::Scheme;
use crate::error::{Error, Result};
use crate::response::{Response, ResponseKind};
use crate::serial::{SerialSpecs, SerialTransport};
use crate::udp::{UdpSpecs, UdpTransport};

/// Invoked exactly once with the outcome of an asynchronous request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response>) + Send>;

/// Invoked exactly once when a connection attempt settles.
pub type ConnectCallback = Box<dyn FnOnce(Result<()>) + Send>;

/// Notified on connection changes, independent of explicit connect/release calls.
pub trait ConnectionObserver: Send + Sync {
    fn on_connected(&self) {}
    fn on_disconnected(&self) {}
}

/// Trait for SMP transport implementations
pub trait Transport: Send + Sync {
    fn scheme(&self) -> Scheme;

    /// Largest packet the link accepts, in bytes.
    fn mtu(&self) -> usize;

    /// Send a complete request packet and wait for its response.
    fn send(&self, packet: &[u8], kind: ResponseKind) -> Result<Response>;

    /// Send without waiting; `callback` runs exactly once.
    ///
    /// The default runs the blocking send on the calling thread, so a
    /// transport that cannot multiplex still serves windowed uploads
    /// with one request on the wire at a time.
    fn send_async(&self, packet: Vec<u8>, kind: ResponseKind, callback: ResponseCallback) {
        callback(self.send(&packet, kind));
    }

    /// Connect if needed. The callback fires even when already connected.
    fn connect(&self, callback: Option<ConnectCallback>);

    /// Tear down the connection. Safe to call when already released.
    fn release(&self);

    fn add_observer(&self, observer: Arc<dyn ConnectionObserver>);

    fn remove_observer(&self, observer: &Arc<dyn ConnectionObserver>);

    /// Set the response timeout for subsequent requests
    fn set_timeout(&self, timeout_ms: u32) -> Result<()>;
}

/// Connect and block until the attempt settles.
pub fn connect_blocking(transport: &dyn Transport) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    transport.connect(Some(Box::new(move |result| {
        let _ = tx.send(result);
    })));
    rx.recv()
        .map_err(|_| Error::Transport("connect callback dropped".to_string()))?
}

/// Observer registry shared by the transport implementations.
#[derive(Default)]
pub struct ObserverList {
    observers: Mutex<Vec<Arc<dyn ConnectionObserver>>>,
}

impl ObserverList {
    pub fn add(&self, observer: Arc<dyn ConnectionObserver>) {
        self.snapshot_mut(|list| list.push(observer));
    }

    pub fn remove(&self, observer: &Arc<dyn ConnectionObserver>) {
        self.snapshot_mut(|list| list.retain(|o| !Arc::ptr_eq(o, observer)));
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_connected(&self) {
        debug!("notify connected");
        for observer in self.snapshot() {
            observer.on_connected();
        }
    }

    pub fn notify_disconnected(&self) {
        debug!("notify disconnected");
        for observer in self.snapshot() {
            observer.on_disconnected();
        }
    }

    // observers run without the lock held, so they may add/remove themselves
    fn snapshot(&self) -> Vec<Arc<dyn ConnectionObserver>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn snapshot_mut(&self, f: impl FnOnce(&mut Vec<Arc<dyn ConnectionObserver>>)) {
        f(&mut self.observers.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

/// Connection specification - either serial or UDP
#[derive(Debug, Clone)]
pub enum ConnSpec {
    Serial(SerialSpecs),
    Udp(UdpSpecs),
}

impl ConnSpec {
    /// Check if this is a UDP connection
    pub fn is_udp(&self) -> bool {
        matches!(self, ConnSpec::Udp(_))
    }

    /// Check if this is a serial connection
    pub fn is_serial(&self) -> bool {
        matches!(self, ConnSpec::Serial(_))
    }

    /// Open a transport connection based on this spec
    pub fn open(&self) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match self {
            ConnSpec::Serial(specs) => Arc::new(SerialTransport::new(specs.clone())),
            ConnSpec::Udp(specs) => Arc::new(UdpTransport::new(specs)?),
        };
        connect_blocking(&*transport)?;
        Ok(transport)
    }
}

// thread-safe counter, initialized with a random value on first call
pub fn next_seq_id() -> u8 {
    lazy_static! {
        static ref COUNTER: AtomicU8 = AtomicU8::new(thread_rng().gen::<u8>());
    }
    COUNTER.fetch_add(1, Ordering::SeqCst)
}
