// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client connection: the public API over the persistent worker.
//!
//! [`Connection::builder`] spawns a worker thread that connects (directly or
//! via discovery), identifies itself, resurrects subscriptions across
//! reconnects and dispatches inbound traffic. The handle exposes typed
//! write/read helpers, subscriptions, channel rendezvous, enumerations and
//! lifecycle calls. Synchronous requests allow one outstanding call per
//! request class.

mod assembler;
mod runtime;
mod subscription;
mod waiter;

pub use subscription::EventCallback;

use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{Error, Result};
use crate::protocol::{
    ChannelInfo, ChannelTicket, ClientInfo, EventInfo, Ident, Opcode, Packet, VarType,
    CHANNEL_ANONS, CHANNEL_REQUEST, FLAGS_MASK,
};
use runtime::{ConnShared, Transport};
use subscription::SubscriptionSlot;

#[cfg(feature = "crypt")]
use crate::protocol::CryptKey;

/// Configuration for a connection.
pub struct ConnectionBuilder {
    id: String,
    endpoint: Option<(String, u16)>,
    transport: Transport,
    on_connect: Option<Arc<dyn Fn() + Send + Sync>>,
    #[cfg(feature = "crypt")]
    crypt: Option<CryptKey>,
}

impl ConnectionBuilder {
    /// Broker endpoint; when omitted the worker locates one via discovery.
    pub fn endpoint(mut self, host: &str, port: u16) -> Self {
        self.endpoint = Some((host.to_string(), port));
        self
    }

    /// Use datagrams instead of a stream connection.
    pub fn udp(mut self) -> Self {
        self.transport = Transport::Udp;
        self
    }

    /// Callback fired once per established session, on its own thread.
    pub fn on_connect(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(callback));
        self
    }

    /// Enable the packet envelope with this key bundle.
    #[cfg(feature = "crypt")]
    pub fn crypt_key(mut self, key: CryptKey) -> Self {
        self.crypt = Some(key);
        self
    }

    /// Spawn the worker and return the handle. The connection is established
    /// in the background; use [`Connection::connect_wait`] to block for it.
    pub fn connect(self) -> Connection {
        let shared = Arc::new(ConnShared::new(
            Ident::from_label(&self.id),
            self.transport,
            self.endpoint,
            self.on_connect,
            #[cfg(feature = "crypt")]
            self.crypt,
        ));
        let worker_shared = Arc::clone(&shared);
        #[allow(clippy::expect_used)] // thread spawn failure is unrecoverable
        let worker = std::thread::Builder::new()
            .name("syncscribe-client".into())
            .spawn(move || runtime::run(worker_shared))
            .expect("spawning the connection worker");
        Connection {
            shared,
            worker: Some(worker),
        }
    }
}

/// Handle to a broker connection.
pub struct Connection {
    shared: Arc<ConnShared>,
    worker: Option<JoinHandle<()>>,
}

impl Connection {
    /// Start configuring a connection with the given client identifier.
    pub fn builder(id: &str) -> ConnectionBuilder {
        ConnectionBuilder {
            id: id.to_string(),
            endpoint: None,
            transport: Transport::Tcp,
            on_connect: None,
            #[cfg(feature = "crypt")]
            crypt: None,
        }
    }

    /// Connect to a known endpoint (convenience for the common case).
    pub fn connect(host: &str, port: u16, id: &str) -> Self {
        Self::builder(id).endpoint(host, port).connect()
    }

    // ===== Lifecycle =====

    /// Block until the first handshake completed.
    pub fn connect_wait(&self, timeout: Duration) -> Result<()> {
        runtime::connect_wait(&self.shared, timeout)
    }

    /// Is a session currently established?
    pub fn is_connected(&self) -> bool {
        self.shared.ready.load(Ordering::Acquire)
    }

    /// Identifier the broker reported about itself.
    pub fn connect_status(&self) -> Result<String> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        Ok(self.shared.server_id.lock().label())
    }

    /// Tear the connection down and join the worker.
    pub fn disconnect(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.shared.onexit.store(true, Ordering::Release);
        if let Some(stream) = self.shared.tcp_stream.lock().as_ref() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    // ===== Writes =====

    /// Write a raw value under an explicit variable type.
    pub fn write_raw(&self, name: &str, var_type: VarType, data: &[u8], flags: u32) -> Result<()> {
        let packet = Packet::with_payload(
            Opcode::Write.bits() | var_type.bits() | (flags & FLAGS_MASK),
            Ident::from_label(name),
            data.to_vec(),
        );
        self.shared.send_packet(&packet)
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

    /// Strings travel NUL-terminated (length strlen+1).
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

    // ===== Reads =====

    /// Fetch the last-known value; one outstanding read per connection.
    pub fn read_raw(
        &self,
        name: &str,
        var_type: VarType,
        timeout: Duration,
    ) -> Result<(VarType, Vec<u8>)> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = Ident::from_label(name);
        self.shared.read_waiter.arm(id);
        let request = Packet::request(Opcode::Read.bits() | var_type.bits(), id);
        self.shared.send_packet(&request)?;

        let (type_word, data) = self.shared.read_waiter.wait(timeout)?;
        let reply_type = VarType::from_type_word(type_word).unwrap_or(VarType::NotDefined);
        if reply_type == VarType::NotDefined {
            return Err(Error::Protocol(format!("event {} not defined", name)));
        }
        Ok((reply_type, data))
    }

    pub fn read_i32(&self, name: &str) -> Result<i32> {
        let (_, data) = self.read_raw(name, VarType::Int32, DEFAULT_REQUEST_TIMEOUT)?;
        Ok(i32::from_le_bytes(fixed(&data)?))
    }

    pub fn read_i64(&self, name: &str) -> Result<i64> {
        let (_, data) = self.read_raw(name, VarType::Int64, DEFAULT_REQUEST_TIMEOUT)?;
        Ok(i64::from_le_bytes(fixed(&data)?))
    }

    pub fn read_f32(&self, name: &str) -> Result<f32> {
        let (_, data) = self.read_raw(name, VarType::Float, DEFAULT_REQUEST_TIMEOUT)?;
        Ok(f32::from_le_bytes(fixed(&data)?))
    }

    pub fn read_f64(&self, name: &str) -> Result<f64> {
        let (_, data) = self.read_raw(name, VarType::Double, DEFAULT_REQUEST_TIMEOUT)?;
        Ok(f64::from_le_bytes(fixed(&data)?))
    }

    pub fn read_str(&self, name: &str) -> Result<String> {
        let (_, data) = self.read_raw(name, VarType::String, DEFAULT_REQUEST_TIMEOUT)?;
        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
        Ok(String::from_utf8_lossy(&data[..end]).into_owned())
    }

    // ===== Definitions =====

    /// Declare an event on the broker.
    pub fn define(&self, name: &str, var_type: VarType, flags: u32) -> Result<()> {
        let request = Packet::request(
            Opcode::Define.bits() | var_type.bits() | (flags & FLAGS_MASK),
            Ident::from_label(name),
        );
        self.shared.send_packet(&request)
    }

    /// Remove an event from the broker.
    pub fn undefine(&self, name: &str) -> Result<()> {
        let request = Packet::request(Opcode::Undefine.bits(), Ident::from_label(name));
        self.shared.send_packet(&request)
    }

    // ===== Subscriptions =====

    /// Subscribe with a callback; survives reconnects.
    pub fn subscribe(
        &self,
        name: &str,
        var_type: VarType,
        flags: u32,
        callback: impl Fn(&str, &[u8]) + Send + Sync + 'static,
    ) -> Result<()> {
        let id = Ident::from_label(name);
        let type_flags = var_type.bits() | (flags & FLAGS_MASK);
        let slot = self
            .shared
            .registry
            .add(SubscriptionSlot::with_callback(id, type_flags, Arc::new(callback)))?;
        self.send_subscribe(&slot)
    }

    /// Subscribe into the queued mirror drained by [`Connection::wait_event`].
    pub fn subscribe_queued(&self, name: &str, var_type: VarType, flags: u32) -> Result<()> {
        let id = Ident::from_label(name);
        let type_flags = var_type.bits() | (flags & FLAGS_MASK);
        let slot = self
            .shared
            .registry
            .add(SubscriptionSlot::with_mirror(id, type_flags))?;
        self.send_subscribe(&slot)
    }

    fn send_subscribe(&self, slot: &SubscriptionSlot) -> Result<()> {
        if !self.is_connected() {
            // The resurrection pass will register it once connected.
            return Ok(());
        }
        let mut request = Packet::request(Opcode::Subscribe.bits() | slot.type_flags, slot.id);
        request.header.update_counter = slot.update_counter.load(Ordering::Acquire);
        self.shared.send_packet(&request)
    }

    /// Drop a subscription locally and on the broker.
    pub fn unsubscribe(&self, name: &str) -> Result<()> {
        let id = Ident::from_label(name);
        if let Some(slot) = self.shared.registry.remove(&id) {
            if self.is_connected() {
                let request =
                    Packet::request(Opcode::Unsubscribe.bits() | slot.type_flags, id);
                self.shared.send_packet(&request)?;
            }
        }
        Ok(())
    }

    /// Wait for the next queued event; returns its name and value. A single
    /// waiter per connection is supported, and only the newest undrained
    /// event is kept (last-write-wins).
    pub fn wait_event(&self, timeout: Duration) -> Result<(String, Vec<u8>)> {
        runtime::wait_event(&self.shared, timeout)
    }

    // ===== Channels =====

    /// Announce a channel this client produces. The broker substitutes our
    /// observed source address for the ticket's IP.
    pub fn channel_announce(&self, name: &str, flags: u32, port: u16) -> Result<()> {
        let id = Ident::from_label(name);
        let ticket = ChannelTicket::new(Ipv4Addr::UNSPECIFIED, port, flags);
        {
            let mut channels = self.shared.channels.lock();
            if let Some(entry) = channels.iter_mut().find(|(cid, _)| *cid == id) {
                entry.1 = ticket;
            } else {
                channels.push((id, ticket));
            }
        }
        if !self.is_connected() {
            return Ok(());
        }
        let packet = Packet::with_payload(
            Opcode::Channel.bits() | CHANNEL_ANONS,
            id,
            ticket.encode(),
        );
        self.shared.send_packet(&packet)
    }

    /// Fetch a producer's rendezvous ticket.
    ///
    /// The ticket's IP is whatever source address the broker observed for
    /// the producer; it is returned exactly as received.
    pub fn channel_request(&self, name: &str, timeout: Duration) -> Result<ChannelTicket> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = Ident::from_label(name);
        self.shared.ticket_waiter.arm(id);
        let request = Packet::request(Opcode::Channel.bits() | CHANNEL_REQUEST, id);
        self.shared.send_packet(&request)?;
        self.shared.ticket_waiter.wait(timeout)
    }

    // ===== Enumerations =====

    /// List the broker's events.
    pub fn list_events(&self, timeout: Duration) -> Result<Vec<EventInfo>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let sequence = self.shared.event_lists.lock().begin();
        self.shared.event_list_waiter.arm(Ident::default());
        self.shared
            .send_packet(&list_request(Opcode::EventList, sequence))?;
        self.shared.event_list_waiter.wait(timeout)
    }

    /// List the broker's clients.
    pub fn list_clients(&self, timeout: Duration) -> Result<Vec<ClientInfo>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let sequence = self.shared.client_lists.lock().begin();
        self.shared.client_list_waiter.arm(Ident::default());
        self.shared
            .send_packet(&list_request(Opcode::ClientList, sequence))?;
        self.shared.client_list_waiter.wait(timeout)
    }

    /// List the broker's channels.
    pub fn list_channels(&self, timeout: Duration) -> Result<Vec<ChannelInfo>> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let sequence = self.shared.channel_lists.lock().begin();
        self.shared.channel_list_waiter.arm(Ident::default());
        self.shared
            .send_packet(&list_request(Opcode::ChannelList, sequence))?;
        self.shared.channel_list_waiter.wait(timeout)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Enumeration request carrying the sequence byte in `id.byte[0]`.
fn list_request(opcode: Opcode, sequence: u8) -> Packet {
    let mut id = [0u8; Ident::SIZE];
    id[0] = sequence;
    Packet::request(opcode.bits(), Ident::from_bytes(id))
}

fn fixed<const N: usize>(value: &[u8]) -> Result<[u8; N]> {
    value
        .try_into()
        .map_err(|_| Error::Protocol(format!("expected {} value bytes, got {}", N, value.len())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_requests_fail_fast() {
        // No broker anywhere near this endpoint; requests must not hang.
        let conn = Connection::builder("offline")
            .endpoint("127.0.0.1", 1)
            .connect();
        assert!(!conn.is_connected());
        assert!(matches!(
            conn.read_i32("anything"),
            Err(Error::NotConnected)
        ));
        assert!(matches!(conn.connect_status(), Err(Error::NotConnected)));
        assert!(matches!(
            conn.list_events(Duration::from_millis(50)),
            Err(Error::NotConnected)
        ));
        conn.disconnect();
    }

    #[test]
    fn test_subscribe_offline_is_deferred() {
        let conn = Connection::builder("deferred")
            .endpoint("127.0.0.1", 1)
            .connect();
        conn.subscribe("mode", VarType::Int32, 0, |_, _| {})
            .expect("registered locally for resurrection");
        conn.unsubscribe("mode").expect("removed locally");
        conn.disconnect();
    }

    #[test]
    fn test_list_request_sequence_byte() {
        let packet = list_request(Opcode::EventList, 7);
        assert_eq!(packet.header.id.as_bytes()[0], 7);
        assert_eq!(
            Opcode::from_type_word(packet.header.type_word),
            Some(Opcode::EventList)
        );
    }

    #[test]
    fn test_channel_announce_offline_is_recorded() {
        let conn = Connection::builder("producer")
            .endpoint("127.0.0.1", 1)
            .connect();
        conn.channel_announce("video0", 2, 5004)
            .expect("recorded for resurrection");
        conn.channel_announce("video0", 2, 5006)
            .expect("update replaces the ticket");
        assert_eq!(conn.shared.channels.lock().len(), 1);
        assert_eq!(conn.shared.channels.lock()[0].1.port, 5006);
        conn.disconnect();
    }
}
