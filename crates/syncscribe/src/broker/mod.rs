// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The broker: event/client/channel tables behind a TCP+UDP endpoint.
//!
//! [`Broker::builder`] binds the sockets, spawns the readiness loop (and
//! optionally the SSDP responder) and returns a handle carrying the local
//! API: the broker-side application can define, write, read and subscribe to
//! events exactly like a remote client, without a socket in between. Local
//! writes fan out to network subscribers like any other write.
//!
//! Shutdown is cooperative: [`Broker::shutdown`] (also run on drop) wakes
//! the loop, which closes the listener and every client socket before the
//! threads are joined.

mod event_loop;
mod state;

pub use state::LocalCallback;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use mio::{Poll, Waker};
use parking_lot::Mutex;

use crate::config::{DEFAULT_PORT, DEFAULT_SYNC_OFFSET_MS};
use crate::discovery::{advertised_host, SsdpResponder};
use crate::error::{Error, Result};
use crate::protocol::{Ident, VarType, FLAG_ECHO, FLAG_FORCE, FLAG_SYNC};
use crate::transport::{tcp, udp};
use event_loop::{Command, EventLoop, WAKER_TOKEN};
use state::{BrokerState, Outbox};

#[cfg(feature = "crypt")]
use crate::protocol::CryptKey;

/// Attribute flags a local write may carry.
const LOCAL_WRITE_FLAGS: u32 = FLAG_SYNC | FLAG_ECHO | FLAG_FORCE;

/// Configuration for a broker instance.
pub struct BrokerBuilder {
    id: String,
    bind: IpAddr,
    port: u16,
    ssdp: bool,
    beacon: bool,
    sync_offset: Duration,
    #[cfg(feature = "crypt")]
    crypt: Option<CryptKey>,
}

impl BrokerBuilder {
    /// Bind address for both TCP and UDP (port 0 picks an ephemeral port).
    pub fn bind(mut self, addr: IpAddr, port: u16) -> Self {
        self.bind = addr;
        self.port = port;
        self
    }

    /// Enable the SSDP responder; with `beacon` the broker also announces
    /// itself unsolicited every 500 ms.
    pub fn ssdp(mut self, beacon: bool) -> Self {
        self.ssdp = true;
        self.beacon = beacon;
        self
    }

    /// Offset added to the broker clock when stamping SYNC deliveries.
    pub fn sync_offset(mut self, offset: Duration) -> Self {
        self.sync_offset = offset;
        self
    }

    /// Enable the packet envelope with this key bundle.
    #[cfg(feature = "crypt")]
    pub fn crypt_key(mut self, key: CryptKey) -> Self {
        self.crypt = Some(key);
        self
    }

    /// Bind the sockets and start serving.
    pub fn start(self) -> Result<Broker> {
        let bind_addr = SocketAddr::new(self.bind, self.port);
        let listener = tcp::listen(bind_addr)?;
        let local_addr = listener.local_addr()?;
        // UDP shares the (possibly ephemeral) TCP port.
        let udp_socket = udp::bind(local_addr)?;

        let mut state = BrokerState::new(Ident::from_label(&self.id));
        state.set_sync_offset(self.sync_offset);
        let state = Arc::new(Mutex::new(state));

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let (cmd_tx, cmd_rx) = channel();
        let stop = Arc::new(AtomicBool::new(false));

        let event_loop = EventLoop::new(
            poll,
            listener,
            udp_socket,
            Arc::clone(&state),
            cmd_rx,
            Arc::clone(&stop),
            #[cfg(feature = "crypt")]
            self.crypt,
        )?;
        let thread = std::thread::Builder::new()
            .name("syncscribe-broker".into())
            .spawn(move || event_loop.run())
            .map_err(Error::Io)?;

        let ssdp_thread = if self.ssdp {
            let host = advertised_host(local_addr.ip());
            let responder = SsdpResponder::open(host, local_addr.port(), &self.id, self.beacon)?;
            let stop_flag = Arc::clone(&stop);
            Some(
                std::thread::Builder::new()
                    .name("syncscribe-ssdp".into())
                    .spawn(move || responder.run(&stop_flag))
                    .map_err(Error::Io)?,
            )
        } else {
            None
        };

        Ok(Broker {
            state,
            cmd_tx,
            waker,
            stop,
            thread: Some(thread),
            ssdp_thread,
            local_addr,
        })
    }
}

/// Running broker handle with the local typed API.
pub struct Broker {
    state: Arc<Mutex<BrokerState>>,
    cmd_tx: Sender<Command>,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    ssdp_thread: Option<JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Broker {
    /// Start configuring a broker with the given identifier.
    pub fn builder(id: &str) -> BrokerBuilder {
        BrokerBuilder {
            id: id.to_string(),
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            ssdp: false,
            beacon: false,
            sync_offset: Duration::from_millis(u64::from(DEFAULT_SYNC_OFFSET_MS)),
            #[cfg(feature = "crypt")]
            crypt: None,
        }
    }

    /// Address the broker is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Change the SYNC-delivery offset at runtime.
    pub fn set_sync_offset(&self, offset: Duration) {
        self.state.lock().set_sync_offset(offset);
    }

    // ===== Local event API =====

    /// Define an event, optionally seeding its value.
    pub fn define(&self, name: &str, var_type: VarType, flags: u32, seed: Option<&[u8]>) -> Result<()> {
        self.state
            .lock()
            .define_local(name, var_type.bits() | (flags & FLAG_FORCE), seed)
    }

    /// Remove an event; its subscriber set is discarded.
    pub fn undefine(&self, name: &str) {
        self.state.lock().undefine_local(name);
    }

    /// Write a raw value and fan it out to subscribers.
    pub fn write_raw(&self, name: &str, var_type: VarType, data: &[u8], flags: u32) -> Result<()> {
        let mut outbox = Outbox::new();
        self.state.lock().write_local(
            name,
            var_type.bits() | (flags & LOCAL_WRITE_FLAGS),
            data,
            &mut outbox,
        )?;
        self.post(outbox)
    }

    pub fn write_i32(&self, name: &str, value: i32, flags: u32) -> Result<()> {
        self.write_raw(name, VarType::Int32, &value.to_le_bytes(), flags)
    }

    pub fn write_i64(&self, name: &str, value: i64, flags: u32) -> Result<()> {
        self.write_raw(name, VarType::Int64, &value.to_le_bytes(), flags)
    }

    pub fn write_f32(&self, name: &str, value: f32, flags: u32) -> Result<()> {
        self.write_raw(name, VarType::Float, &value.to_le_bytes(), flags)
    }

    pub fn write_f64(&self, name: &str, value: f64, flags: u32) -> Result<()> {
        self.write_raw(name, VarType::Double, &value.to_le_bytes(), flags)
    }

    /// Strings travel NUL-terminated.
    pub fn write_str(&self, name: &str, value: &str, flags: u32) -> Result<()> {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);
        self.write_raw(name, VarType::String, &data, flags)
    }

    /// Fire a payload-less notification.
    pub fn write_event(&self, name: &str, flags: u32) -> Result<()> {
        self.write_raw(name, VarType::Empty, &[], flags)
    }

    /// Read the last-known value.
    pub fn read_raw(&self, name: &str) -> Result<Vec<u8>> {
        Ok(self.state.lock().read_local(name)?.1)
    }

    pub fn read_i32(&self, name: &str) -> Result<i32> {
        let value = self.read_raw(name)?;
        Ok(i32::from_le_bytes(fixed(&value)?))
    }

    pub fn read_i64(&self, name: &str) -> Result<i64> {
        let value = self.read_raw(name)?;
        Ok(i64::from_le_bytes(fixed(&value)?))
    }

    pub fn read_f32(&self, name: &str) -> Result<f32> {
        let value = self.read_raw(name)?;
        Ok(f32::from_le_bytes(fixed(&value)?))
    }

    pub fn read_f64(&self, name: &str) -> Result<f64> {
        let value = self.read_raw(name)?;
        Ok(f64::from_le_bytes(fixed(&value)?))
    }

    pub fn read_str(&self, name: &str) -> Result<String> {
        let value = self.read_raw(name)?;
        let end = value.iter().position(|&b| b == 0).unwrap_or(value.len());
        Ok(String::from_utf8_lossy(&value[..end]).into_owned())
    }

    /// Attach a callback invoked on every write to the event (local or
    /// network). The callback runs on the broker's event-loop thread and
    /// must not call back into this handle.
    pub fn subscribe_local(
        &self,
        name: &str,
        var_type: VarType,
        flags: u32,
        callback: LocalCallback,
    ) -> Result<()> {
        self.state
            .lock()
            .subscribe_local(name, var_type.bits() | (flags & FLAG_FORCE), callback)
    }

    /// Detach the local callback.
    pub fn unsubscribe_local(&self, name: &str) {
        self.state.lock().unsubscribe_local(name);
    }

    // ===== Introspection =====

    pub fn event_count(&self) -> usize {
        self.state.lock().event_count()
    }

    pub fn client_count(&self) -> usize {
        self.state.lock().client_count()
    }

    pub fn channel_count(&self) -> usize {
        self.state.lock().channel_count()
    }

    // ===== Lifecycle =====

    /// Stop serving: close the listener, every client socket, and join the
    /// worker threads. Idempotent.
    pub fn shutdown(&mut self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.cmd_tx.send(Command::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.ssdp_thread.take() {
            let _ = handle.join();
        }
    }

    /// Push locally produced frames into the event loop.
    fn post(&self, outbox: Outbox) -> Result<()> {
        if outbox.is_empty() {
            return Ok(());
        }
        self.cmd_tx
            .send(Command::Dispatch(outbox))
            .map_err(|_| Error::NotConnected)?;
        self.waker.wake()?;
        Ok(())
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn fixed<const N: usize>(value: &[u8]) -> Result<[u8; N]> {
    value
        .try_into()
        .map_err(|_| Error::Protocol(format!("expected {} value bytes, got {}", N, value.len())))
}
