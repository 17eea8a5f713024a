// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection worker: reconnect loop, subscription resurrection and the
//! inbound dispatcher.
//!
//! A dedicated thread owns the socket. Each session it (a) resolves the
//! endpoint (configured or discovered), (b) connects, (c) identifies itself,
//! (d) re-sends every registered subscription and channel announcement so a
//! broker restart is invisible to the application, then (e) pumps the
//! receive loop until EOF, error or the terminal flag. Reconnects back off
//! 300 ms after a failed attempt and 1 s after a dropped session.

use std::io::Read;
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::client::assembler::Assembler;
use crate::client::subscription::{Registry, SubscriptionSlot};
use crate::client::waiter::Waiter;
use crate::config::{RECONNECT_DELAY, RECONNECT_IDLE, VERSION_MAJOR, VERSION_MINOR};
use crate::discovery;
use crate::error::{Error, Result};
use crate::protocol::{
    ChannelInfo, ChannelTicket, ClientInfo, EventInfo, Framer, Ident, ListHeader, Opcode, Packet,
    StatusCode, CHANNEL_ANONS, CHANNEL_PHASE_MASK, CHANNEL_TICKET, FLAGS_MASK, FLAG_SYNC,
    VAR_TYPE_MASK,
};
use crate::timesync;
use crate::transport::{tcp, udp};

#[cfg(feature = "crypt")]
use crate::protocol::crypt::{self, CryptKey};

/// Timeout for a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// How long one discovery round may take before the worker rechecks the
/// terminal flag.
const DISCOVERY_ROUND: Duration = Duration::from_secs(2);

/// Granularity at which interruptible sleeps observe the terminal flag.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Receive timeout on the client's datagram socket; UDP has no half to shut
/// down, so the worker observes the terminal flag on this tick instead.
const UDP_RECV_TICK: Duration = Duration::from_millis(500);

/// Which transport the connection runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transport {
    Tcp,
    Udp,
}

/// State shared between the worker, the dispatcher and the public API.
pub(crate) struct ConnShared {
    pub id: Ident,
    pub transport: Transport,
    pub endpoint: Mutex<Option<(String, u16)>>,
    pub onexit: AtomicBool,
    pub ready: AtomicBool,
    pub server_id: Mutex<Ident>,

    pub registry: Registry,
    pub channels: Mutex<Vec<(Ident, ChannelTicket)>>,

    pub tcp_stream: Mutex<Option<TcpStream>>,
    pub udp_socket: Mutex<Option<Arc<UdpSocket>>>,

    pub read_waiter: Waiter<(u32, Vec<u8>)>,
    pub ticket_waiter: Waiter<ChannelTicket>,
    pub event_lists: Mutex<Assembler<EventInfo>>,
    pub event_list_waiter: Waiter<Vec<EventInfo>>,
    pub client_lists: Mutex<Assembler<ClientInfo>>,
    pub client_list_waiter: Waiter<Vec<ClientInfo>>,
    pub channel_lists: Mutex<Assembler<ChannelInfo>>,
    pub channel_list_waiter: Waiter<Vec<ChannelInfo>>,

    /// True until the first successful handshake.
    pub connect_pending: Mutex<bool>,
    pub connect_cond: Condvar,

    /// Single-event latest-ready cell for `wait_event`.
    pub latest: Mutex<Option<Arc<SubscriptionSlot>>>,
    pub latest_cond: Condvar,

    pub on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    pub connect_cb_running: AtomicBool,

    #[cfg(feature = "crypt")]
    pub crypt: Option<CryptKey>,
}

impl ConnShared {
    pub fn new(
        id: Ident,
        transport: Transport,
        endpoint: Option<(String, u16)>,
        on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
        #[cfg(feature = "crypt")] crypt: Option<CryptKey>,
    ) -> Self {
        Self {
            id,
            transport,
            endpoint: Mutex::new(endpoint),
            onexit: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            server_id: Mutex::new(Ident::default()),
            registry: Registry::new(),
            channels: Mutex::new(Vec::new()),
            tcp_stream: Mutex::new(None),
            udp_socket: Mutex::new(None),
            read_waiter: Waiter::new(),
            ticket_waiter: Waiter::new(),
            event_lists: Mutex::new(Assembler::new()),
            event_list_waiter: Waiter::new(),
            client_lists: Mutex::new(Assembler::new()),
            client_list_waiter: Waiter::new(),
            channel_lists: Mutex::new(Assembler::new()),
            channel_list_waiter: Waiter::new(),
            connect_pending: Mutex::new(true),
            connect_cond: Condvar::new(),
            latest: Mutex::new(None),
            latest_cond: Condvar::new(),
            on_connect,
            connect_cb_running: AtomicBool::new(false),
            #[cfg(feature = "crypt")]
            crypt,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.onexit.load(Ordering::Acquire)
    }

    /// Serialize, optionally seal, and transmit one packet.
    pub fn send_packet(&self, packet: &Packet) -> Result<()> {
        #[allow(unused_mut)]
        let mut frame = packet.encode();
        #[cfg(feature = "crypt")]
        if let Some(key) = &self.crypt {
            crypt::seal_frame(key, &mut frame)?;
        }
        match self.transport {
            Transport::Tcp => {
                let guard = self.tcp_stream.lock();
                let stream = guard.as_ref().ok_or(Error::NotConnected)?;
                tcp::send_all(&mut (&*stream), &frame)?;
            }
            Transport::Udp => {
                let guard = self.udp_socket.lock();
                let socket = guard.as_ref().ok_or(Error::NotConnected)?;
                socket.send(&frame)?;
            }
        }
        Ok(())
    }

    /// CLIENT_ID followed by the full resurrection pass: every registered
    /// subscription with its last-seen counter, every owned channel.
    pub fn send_identity(&self) -> Result<()> {
        let mut hello = Packet::request(Opcode::ClientId.bits(), self.id);
        hello.header.sync0 = VERSION_MAJOR;
        hello.header.sync1 = VERSION_MINOR;
        self.send_packet(&hello)?;

        for slot in self.registry.snapshot() {
            let mut subscribe = Packet::request(
                Opcode::Subscribe.bits() | (slot.type_flags & (VAR_TYPE_MASK | FLAGS_MASK)),
                slot.id,
            );
            subscribe.header.update_counter = slot.update_counter.load(Ordering::Acquire);
            self.send_packet(&subscribe)?;
        }
        for (id, ticket) in self.channels.lock().iter() {
            let anons = Packet::with_payload(
                Opcode::Channel.bits() | CHANNEL_ANONS,
                *id,
                ticket.encode(),
            );
            self.send_packet(&anons)?;
        }
        Ok(())
    }
}

/// Worker entry point.
pub(crate) fn run(shared: Arc<ConnShared>) {
    while !shared.is_terminal() {
        let Some((host, port)) = resolve_endpoint(&shared) else {
            sleep_checked(&shared, RECONNECT_DELAY);
            continue;
        };
        let Some(addr) = lookup(&host, port) else {
            log::debug!("[client] cannot resolve {}:{}", host, port);
            sleep_checked(&shared, RECONNECT_DELAY);
            continue;
        };
        match shared.transport {
            Transport::Tcp => tcp_session(&shared, addr),
            Transport::Udp => udp_session(&shared, addr),
        }
    }
    log::debug!("[client] worker exits");
}

/// Configured endpoint, or one round of discovery.
fn resolve_endpoint(shared: &Arc<ConnShared>) -> Option<(String, u16)> {
    if let Some(endpoint) = shared.endpoint.lock().clone() {
        return Some(endpoint);
    }
    match discovery::find_broker(DISCOVERY_ROUND) {
        Ok(endpoint) => {
            *shared.endpoint.lock() = Some(endpoint.clone());
            Some(endpoint)
        }
        Err(_) => {
            log::info!("[client] still looking for a broker");
            None
        }
    }
}

fn lookup(host: &str, port: u16) -> Option<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .ok()?
        .find(|addr| matches!(addr.ip(), IpAddr::V4(_)))
}

fn tcp_session(shared: &Arc<ConnShared>, addr: SocketAddr) {
    let stream = match tcp::connect(addr, CONNECT_TIMEOUT) {
        Ok(stream) => stream,
        Err(_) => {
            sleep_checked(shared, RECONNECT_DELAY);
            return;
        }
    };
    let mut reader = match stream.try_clone() {
        Ok(reader) => reader,
        Err(e) => {
            log::warn!("[client] clone failed: {}", e);
            sleep_checked(shared, RECONNECT_DELAY);
            return;
        }
    };
    *shared.tcp_stream.lock() = Some(stream);
    log::debug!("[client] connected to {}", addr);

    if shared.send_identity().is_err() {
        *shared.tcp_stream.lock() = None;
        sleep_checked(shared, RECONNECT_DELAY);
        return;
    }
    session_started(shared);

    let mut framer = Framer::new();
    'recv: while !shared.is_terminal() {
        let spare = framer.writable();
        match reader.read(spare) {
            Ok(0) => break,
            Ok(n) => {
                framer.advance(n);
                while let Some(frame) = framer.next_frame() {
                    dispatch(shared, frame);
                    if shared.is_terminal() {
                        break 'recv;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("[client] receive error: {}", e);
                break;
            }
        }
    }

    shared.ready.store(false, Ordering::Release);
    let _ = reader.shutdown(std::net::Shutdown::Both);
    *shared.tcp_stream.lock() = None;
    if !shared.is_terminal() {
        log::info!("[client] connection to {} lost, reconnecting", addr);
        sleep_checked(shared, RECONNECT_IDLE);
    }
}

fn udp_session(shared: &Arc<ConnShared>, addr: SocketAddr) {
    let socket = match udp::connect(addr, UDP_RECV_TICK) {
        Ok(socket) => Arc::new(socket),
        Err(_) => {
            sleep_checked(shared, RECONNECT_DELAY);
            return;
        }
    };
    *shared.udp_socket.lock() = Some(Arc::clone(&socket));

    if shared.send_identity().is_err() {
        *shared.udp_socket.lock() = None;
        sleep_checked(shared, RECONNECT_DELAY);
        return;
    }
    session_started(shared);

    let mut buf = [0u8; 64 * 1024];
    while !shared.is_terminal() {
        match socket.recv(&mut buf) {
            Ok(n) => dispatch(shared, buf[..n].to_vec()),
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                log::debug!("[client] datagram receive error: {}", e);
                break;
            }
        }
    }

    shared.ready.store(false, Ordering::Release);
    *shared.udp_socket.lock() = None;
    if !shared.is_terminal() {
        sleep_checked(shared, RECONNECT_IDLE);
    }
}

/// Mark the session live and fire the post-connect callback.
fn session_started(shared: &Arc<ConnShared>) {
    shared.ready.store(true, Ordering::Release);
    {
        let mut pending = shared.connect_pending.lock();
        *pending = false;
        shared.connect_cond.notify_all();
    }
    if let Some(callback) = shared.on_connect.clone() {
        if !shared.connect_cb_running.swap(true, Ordering::AcqRel) {
            let shared = Arc::clone(shared);
            // Detached; there is no forced cancellation on disconnect.
            let _ = std::thread::Builder::new()
                .name("syncscribe-connect-cb".into())
                .spawn(move || {
                    callback();
                    shared.connect_cb_running.store(false, Ordering::Release);
                });
        }
    }
}

/// Interruptible backoff.
fn sleep_checked(shared: &Arc<ConnShared>, total: Duration) {
    let deadline = Instant::now() + total;
    while !shared.is_terminal() && Instant::now() < deadline {
        std::thread::sleep(SLEEP_SLICE.min(deadline.saturating_duration_since(Instant::now())));
    }
}

// ===== Inbound dispatch =====

fn dispatch(shared: &Arc<ConnShared>, frame: Vec<u8>) {
    #[allow(unused_mut)]
    let mut frame = frame;
    #[cfg(feature = "crypt")]
    if let Some(key) = &shared.crypt {
        if crypt::open_frame(key, &mut frame).is_err() {
            log::error!("[client] packet envelope verification failed, terminating");
            shared.onexit.store(true, Ordering::Release);
            return;
        }
    }
    let packet = match Packet::decode(&frame) {
        Ok(packet) => packet,
        Err(e) => {
            log::debug!("[client] undecodable packet: {}", e);
            return;
        }
    };

    match Opcode::from_type_word(packet.header.type_word) {
        Some(Opcode::Event) => handle_event(shared, &packet),
        Some(Opcode::Read) => {
            shared.read_waiter.complete_if(
                &packet.header.id,
                (packet.header.type_word, packet.payload.clone()),
            );
        }
        Some(Opcode::Channel) => {
            if packet.header.type_word & CHANNEL_PHASE_MASK == CHANNEL_TICKET {
                if let Some(ticket) = ChannelTicket::decode(&packet.payload) {
                    shared.ticket_waiter.complete_if(&packet.header.id, ticket);
                }
            }
        }
        Some(Opcode::ServerStatus) => handle_status(shared, &packet),
        Some(Opcode::EventList) => {
            let header = ListHeader::from_ident(&packet.header.id);
            let done = shared.event_lists.lock().accept(
                &header,
                &packet.payload,
                EventInfo::SIZE,
                EventInfo::decode,
            );
            if let Some(records) = done {
                shared.event_list_waiter.complete(records);
            }
        }
        Some(Opcode::ClientList) => {
            let header = ListHeader::from_ident(&packet.header.id);
            let done = shared.client_lists.lock().accept(
                &header,
                &packet.payload,
                ClientInfo::SIZE,
                ClientInfo::decode,
            );
            if let Some(records) = done {
                shared.client_list_waiter.complete(records);
            }
        }
        Some(Opcode::ChannelList) => {
            let header = ListHeader::from_ident(&packet.header.id);
            let done = shared.channel_lists.lock().accept(
                &header,
                &packet.payload,
                ChannelInfo::SIZE,
                ChannelInfo::decode,
            );
            if let Some(records) = done {
                shared.channel_list_waiter.complete(records);
            }
        }
        _ => {}
    }
}

fn handle_event(shared: &Arc<ConnShared>, packet: &Packet) {
    let Some(slot) = shared.registry.find(&packet.header.id) else {
        return;
    };
    if packet.header.type_word & FLAG_SYNC != 0 {
        timesync::wait_until(packet.header.sync0, packet.header.sync1);
    }
    if let Some(callback) = &slot.callback {
        callback(&slot.id.label(), &packet.payload);
    }
    if let Some(mirror) = &slot.mirror {
        {
            let mut value = mirror.lock();
            value.clear();
            value.extend_from_slice(&packet.payload);
        }
        *shared.latest.lock() = Some(Arc::clone(&slot));
        shared.latest_cond.notify_one();
    }
    slot.update_counter
        .store(packet.header.update_counter, Ordering::Release);
}

fn handle_status(shared: &Arc<ConnShared>, packet: &Packet) {
    *shared.server_id.lock() = packet.header.id;
    match StatusCode::from_counter(packet.header.update_counter) {
        Some(StatusCode::NotSupport) => {
            log::error!("[client] broker refused our protocol version");
            shared.onexit.store(true, Ordering::Release);
        }
        Some(StatusCode::Crypt) => {
            log::error!("[client] broker refused our envelope key");
            shared.onexit.store(true, Ordering::Release);
        }
        Some(StatusCode::UnknownClient) => {
            log::debug!("[client] broker forgot us, re-identifying");
            let _ = shared.send_identity();
        }
        Some(StatusCode::NotFound) | None => {}
    }
}

/// Drain the latest-ready cell; used by `Connection::wait_event`.
pub(crate) fn wait_event(
    shared: &Arc<ConnShared>,
    timeout: Duration,
) -> Result<(String, Vec<u8>)> {
    let deadline = Instant::now() + timeout;
    let mut latest = shared.latest.lock();
    while latest.is_none() {
        if shared
            .latest_cond
            .wait_until(&mut latest, deadline)
            .timed_out()
        {
            return Err(Error::Timeout);
        }
    }
    let slot = latest.take().expect("checked above");
    drop(latest);

    let data = slot
        .mirror
        .as_ref()
        .map(|mirror| mirror.lock().clone())
        .unwrap_or_default();
    Ok((slot.id.label(), data))
}

/// Block until the first successful handshake.
pub(crate) fn connect_wait(shared: &Arc<ConnShared>, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let mut pending = shared.connect_pending.lock();
    while *pending {
        if shared
            .connect_cond
            .wait_until(&mut pending, deadline)
            .timed_out()
        {
            return Err(Error::Timeout);
        }
    }
    Ok(())
}
