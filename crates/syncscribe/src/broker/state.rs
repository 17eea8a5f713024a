// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker state engine: the tables of events, clients and channels and the
//! opcode dispatch contract over them.
//!
//! The engine is a pure table machine. It never touches a socket: dispatch
//! consumes a decoded packet plus its source and appends outbound frames,
//! connection closures and deferred local callbacks to an [`Outbox`] the
//! event loop flushes after releasing the table lock. That keeps the whole
//! protocol contract unit-testable without I/O.
//!
//! Tables are bounded slabs. Client slots carry a generation counter; a
//! [`ClientKey`] from a freed slot stops resolving the moment the slot is
//! scrubbed, so subscriber sets can hold keys without dangling.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::{
    CHANNEL_TABLE_CAPACITY, CLIENT_TABLE_CAPACITY, DEFAULT_SYNC_OFFSET_MS, EVENT_TABLE_CAPACITY,
    PAYLOAD_SIZE_MAX, SUBSCRIBER_SET_CAPACITY, VALUE_SIZE_MAX, VERSION_MAJOR,
};
use crate::error::{Error, Result};
use crate::protocol::info::SHORT_DATA_SIZE;
use crate::protocol::{
    ChannelInfo, ChannelTicket, ClientInfo, EventInfo, Ident, ListHeader, Opcode, Packet,
    StatusCode, VarType, CHANNEL_ANONS, CHANNEL_PHASE_MASK, CHANNEL_REQUEST, CHANNEL_TICKET,
    FLAG_ECHO, FLAG_FORCE, FLAG_SYNC, STATUS_LOST, VAR_TYPE_MASK,
};
use crate::timesync;

/// Callback attached to an event by the broker-side application.
pub type LocalCallback = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Generation-tagged handle to a client slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ClientKey {
    pub index: u16,
    pub generation: u32,
}

/// How a client is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientLink {
    Tcp,
    Udp,
}

/// Per-client bookkeeping.
pub(crate) struct ClientRecord {
    pub id: Ident,
    pub link: ClientLink,
    pub addr: SocketAddr,
    /// `(major << 8) | minor` from the handshake.
    pub version: u32,
    pub rx_packets: u32,
    pub tx_packets: u32,
    pub tx_errors: u32,
    pub subscribe_count: u32,
    pub write_count: u32,
}

/// Named, typed last-value cell with its subscriber set.
struct EventRecord {
    id: Ident,
    /// Declared variable-type bits (already positioned in the type word).
    var_type: u32,
    value: Vec<u8>,
    write_count: u32,
    /// Broker-global counter at the last write.
    update_counter: u64,
    /// Unix seconds of the last write.
    last_write: i64,
    producer: Option<ClientKey>,
    producer_changes: u32,
    consumers: [Option<ClientKey>; SUBSCRIBER_SET_CAPACITY],
    consumers_count: u32,
    callback: Option<LocalCallback>,
}

impl EventRecord {
    fn new(id: Ident, var_type: u32) -> Self {
        Self {
            id,
            var_type,
            value: Vec::new(),
            write_count: 0,
            update_counter: 0,
            last_write: 0,
            producer: None,
            producer_changes: 0,
            consumers: [None; SUBSCRIBER_SET_CAPACITY],
            consumers_count: 0,
            callback: None,
        }
    }
}

/// Rendezvous record; not a data pipe.
struct ChannelRecord {
    id: Ident,
    ticket: ChannelTicket,
    producer: Option<ClientKey>,
    producer_changes: u32,
    anons_count: u32,
    request_count: u32,
}

/// Where an outbound frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Destination {
    /// A connected (TCP or identified UDP) client.
    Client(ClientKey),
    /// A raw datagram reply to a not-yet-known source.
    Datagram(SocketAddr),
}

/// Side effects produced by dispatch, flushed outside the table lock.
#[derive(Default)]
pub(crate) struct Outbox {
    pub sends: Vec<(Destination, Vec<u8>)>,
    pub closes: Vec<ClientKey>,
    pub callbacks: Vec<(LocalCallback, String, Vec<u8>)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn send(&mut self, to: Destination, packet: &Packet) {
        self.sends.push((to, packet.encode()));
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty() && self.closes.is_empty() && self.callbacks.is_empty()
    }
}

/// The three broker tables plus the global write counter.
pub(crate) struct BrokerState {
    id: Ident,
    events: Vec<Option<EventRecord>>,
    clients: Vec<Option<ClientRecord>>,
    generations: Vec<u32>,
    channels: Vec<Option<ChannelRecord>>,
    update_counter: u64,
    sync_offset: Duration,
}

impl BrokerState {
    pub fn new(id: Ident) -> Self {
        Self {
            id,
            events: (0..EVENT_TABLE_CAPACITY).map(|_| None).collect(),
            clients: (0..CLIENT_TABLE_CAPACITY).map(|_| None).collect(),
            generations: vec![0; CLIENT_TABLE_CAPACITY],
            channels: (0..CHANNEL_TABLE_CAPACITY).map(|_| None).collect(),
            update_counter: 0,
            sync_offset: Duration::from_millis(u64::from(DEFAULT_SYNC_OFFSET_MS)),
        }
    }

    pub fn broker_id(&self) -> Ident {
        self.id
    }

    pub fn set_sync_offset(&mut self, offset: Duration) {
        self.sync_offset = offset;
    }

    // ===== Client slots =====

    pub fn add_client(&mut self, link: ClientLink, addr: SocketAddr) -> Result<ClientKey> {
        let index = self
            .clients
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoCapacity)?;
        self.clients[index] = Some(ClientRecord {
            id: Ident::default(),
            link,
            addr,
            version: 0,
            rx_packets: 0,
            tx_packets: 0,
            tx_errors: 0,
            subscribe_count: 0,
            write_count: 0,
        });
        Ok(ClientKey {
            index: index as u16,
            generation: self.generations[index],
        })
    }

    pub fn client(&self, key: ClientKey) -> Option<&ClientRecord> {
        let index = usize::from(key.index);
        if *self.generations.get(index)? != key.generation {
            return None;
        }
        self.clients[index].as_ref()
    }

    fn client_mut(&mut self, key: ClientKey) -> Option<&mut ClientRecord> {
        let index = usize::from(key.index);
        if *self.generations.get(index)? != key.generation {
            return None;
        }
        self.clients[index].as_mut()
    }

    /// Scrub a leaving client from every table, then free its slot.
    pub fn remove_client(&mut self, key: ClientKey) {
        let index = usize::from(key.index);
        if self.generations.get(index) != Some(&key.generation) {
            return;
        }
        for event in self.events.iter_mut().flatten() {
            for slot in &mut event.consumers {
                if *slot == Some(key) {
                    *slot = None;
                    event.consumers_count = event.consumers_count.saturating_sub(1);
                }
            }
            if event.producer == Some(key) {
                event.producer = None;
            }
        }
        for slot in &mut self.channels {
            if slot.as_ref().is_some_and(|ch| ch.producer == Some(key)) {
                *slot = None;
            }
        }
        self.clients[index] = None;
        self.generations[index] = self.generations[index].wrapping_add(1);
    }

    pub fn find_udp_client_by_addr(&self, addr: SocketAddr) -> Option<ClientKey> {
        self.clients.iter().enumerate().find_map(|(index, slot)| {
            let c = slot.as_ref()?;
            (c.link == ClientLink::Udp && c.addr == addr).then_some(ClientKey {
                index: index as u16,
                generation: self.generations[index],
            })
        })
    }

    fn find_udp_client_by_id(&self, id: &Ident) -> Option<ClientKey> {
        self.clients.iter().enumerate().find_map(|(index, slot)| {
            let c = slot.as_ref()?;
            (c.link == ClientLink::Udp && c.id == *id).then_some(ClientKey {
                index: index as u16,
                generation: self.generations[index],
            })
        })
    }

    pub fn note_tx_error(&mut self, key: ClientKey) {
        if let Some(c) = self.client_mut(key) {
            c.tx_errors += 1;
        }
    }

    fn note_tx(&mut self, key: ClientKey) {
        if let Some(c) = self.client_mut(key) {
            c.tx_packets += 1;
        }
    }

    // ===== Event table =====

    fn find_event(&self, id: &Ident) -> Option<usize> {
        self.events
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|ev| ev.id == *id))
    }

    fn create_event(&mut self, id: Ident, var_type: u32) -> Result<usize> {
        let index = self
            .events
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoCapacity)?;
        self.events[index] = Some(EventRecord::new(id, var_type));
        Ok(index)
    }

    /// DEFINE: create or (with FORCE) redefine an event, optionally seeded.
    fn define_event(
        &mut self,
        id: Ident,
        type_word: u32,
        seed: Option<&[u8]>,
        size_hint: usize,
    ) -> Result<()> {
        let index = match self.find_event(&id) {
            Some(index) => {
                if type_word & FLAG_FORCE == 0 {
                    return Err(Error::Protocol(format!("event {} already defined", id)));
                }
                index
            }
            None => self.create_event(id, 0)?,
        };
        let var_type = type_word & VAR_TYPE_MASK;
        let size = match seed {
            Some(data) => data.len(),
            None if size_hint > 0 => size_hint,
            None => VarType::from_type_word(type_word)
                .map(VarType::canonical_size)
                .unwrap_or(0),
        };
        if size > VALUE_SIZE_MAX {
            return Err(Error::Protocol(format!(
                "seed of {} bytes exceeds the {} byte value cell",
                size, VALUE_SIZE_MAX
            )));
        }
        let event = self.events[index].as_mut().expect("slot just resolved");
        event.var_type = var_type;
        event.value = match seed {
            Some(data) => data.to_vec(),
            None => vec![0u8; size],
        };
        Ok(())
    }

    fn free_event(&mut self, id: &Ident) {
        if let Some(index) = self.find_event(id) {
            // Subscriber set is discarded with the record.
            self.events[index] = None;
        }
    }

    fn type_accepts(declared: u32, requested: u32) -> bool {
        declared == VarType::Any.bits() || requested == VarType::Any.bits() || declared == requested
    }

    // ===== Write path =====

    /// WRITE from a network client or the local API (`from == None`).
    fn handle_write(
        &mut self,
        from: Option<ClientKey>,
        id: Ident,
        type_word: u32,
        payload: &[u8],
        out: &mut Outbox,
    ) -> Result<()> {
        let index = match self.find_event(&id) {
            Some(index) => index,
            None => {
                if type_word & FLAG_FORCE == 0 {
                    return Err(Error::Protocol(format!("event {} not defined", id)));
                }
                self.create_event(id, type_word & VAR_TYPE_MASK)?
            }
        };

        let declared = self.events[index].as_ref().expect("resolved").var_type;
        let requested = type_word & VAR_TYPE_MASK;
        if !Self::type_accepts(declared, requested) {
            return Err(Error::TypeMismatch {
                declared,
                requested,
            });
        }
        if payload.len() > VALUE_SIZE_MAX {
            return Err(Error::Protocol(format!(
                "value of {} bytes exceeds the {} byte cell",
                payload.len(),
                VALUE_SIZE_MAX
            )));
        }

        let counter = self.update_counter;
        self.update_counter += 1;

        let event = self.events[index].as_mut().expect("resolved");
        if event.producer != from {
            event.producer = from;
            event.producer_changes += 1;
        }
        event.value.clear();
        event.value.extend_from_slice(payload);
        event.write_count += 1;
        event.update_counter = counter;
        event.last_write = unix_now();

        if let Some(cb) = &event.callback {
            out.callbacks
                .push((Arc::clone(cb), event.id.label(), event.value.clone()));
        }
        if let Some(key) = from {
            if let Some(c) = self.client_mut(key) {
                c.write_count += 1;
            }
        }

        self.fan_out(index, type_word & (FLAG_SYNC | FLAG_ECHO), out);
        Ok(())
    }

    /// Deliver the current value to every subscriber.
    ///
    /// The producer is skipped unless ECHO is set; SYNC stamps a delivery
    /// deadline. Send errors are the event loop's business.
    fn fan_out(&mut self, index: usize, flags: u32, out: &mut Outbox) {
        let (packet, targets) = {
            let event = self.events[index].as_ref().expect("resolved");
            let mut packet = Self::event_packet(event, 0);
            if flags & FLAG_SYNC != 0 {
                packet.header.type_word |= FLAG_SYNC;
                let (secs, nanos) = timesync::deadline_after(self.sync_offset);
                packet.header.sync0 = secs;
                packet.header.sync1 = nanos;
            }
            let targets: Vec<ClientKey> = event
                .consumers
                .iter()
                .flatten()
                .copied()
                .filter(|key| flags & FLAG_ECHO != 0 || Some(*key) != event.producer)
                .collect();
            (packet, targets)
        };
        for key in targets {
            self.note_tx(key);
            out.send(Destination::Client(key), &packet);
        }
    }

    fn event_packet(event: &EventRecord, extra_status: u32) -> Packet {
        let mut packet = Packet::with_payload(
            Opcode::Event.bits() | event.var_type | extra_status,
            event.id,
            event.value.clone(),
        );
        packet.header.update_counter = event.update_counter;
        packet
    }

    // ===== Subscribe path =====

    fn handle_subscribe(
        &mut self,
        from: ClientKey,
        id: Ident,
        type_word: u32,
        last_seen: u64,
        out: &mut Outbox,
    ) -> Result<()> {
        let index = match self.find_event(&id) {
            Some(index) => index,
            None => {
                if type_word & FLAG_FORCE == 0 {
                    return Err(Error::Protocol(format!("event {} not defined", id)));
                }
                self.create_event(id, type_word & VAR_TYPE_MASK)?
            }
        };

        let declared = self.events[index].as_ref().expect("resolved").var_type;
        let requested = type_word & VAR_TYPE_MASK;
        if !Self::type_accepts(declared, requested) {
            return Err(Error::TypeMismatch {
                declared,
                requested,
            });
        }

        let added = {
            let event = self.events[index].as_mut().expect("resolved");
            let already = event.consumers.iter().any(|slot| *slot == Some(from));
            if already {
                false
            } else {
                let free = event
                    .consumers
                    .iter()
                    .position(Option::is_none)
                    .ok_or(Error::NoCapacity)?;
                event.consumers[free] = Some(from);
                event.consumers_count += 1;
                true
            }
        };
        if added {
            if let Some(c) = self.client_mut(from) {
                c.subscribe_count += 1;
            }
        }

        // Stale subscriber: one synchronous LOST redelivery, no history replay.
        let event = self.events[index].as_ref().expect("resolved");
        if last_seen < event.update_counter {
            let packet = Self::event_packet(event, STATUS_LOST);
            self.note_tx(from);
            out.send(Destination::Client(from), &packet);
        }
        Ok(())
    }

    fn handle_unsubscribe(&mut self, from: ClientKey, id: &Ident) {
        let Some(index) = self.find_event(id) else {
            return;
        };
        let removed = {
            let event = self.events[index].as_mut().expect("resolved");
            let mut removed = false;
            for slot in &mut event.consumers {
                if *slot == Some(from) {
                    *slot = None;
                    event.consumers_count = event.consumers_count.saturating_sub(1);
                    removed = true;
                    break;
                }
            }
            removed
        };
        if removed {
            if let Some(c) = self.client_mut(from) {
                c.subscribe_count = c.subscribe_count.saturating_sub(1);
            }
        }
    }

    // ===== Read path =====

    fn handle_read(&mut self, from: ClientKey, id: Ident, out: &mut Outbox) {
        let packet = match self.find_event(&id) {
            Some(index) => {
                let event = self.events[index].as_ref().expect("resolved");
                let mut packet = Packet::with_payload(
                    Opcode::Read.bits() | event.var_type,
                    id,
                    event.value.clone(),
                );
                packet.header.update_counter = event.update_counter;
                packet
            }
            None => Packet::request(Opcode::Read.bits() | VarType::NotDefined.bits(), id),
        };
        self.note_tx(from);
        out.send(Destination::Client(from), &packet);
    }

    // ===== Channels =====

    fn handle_channel(
        &mut self,
        from: ClientKey,
        packet: &Packet,
        out: &mut Outbox,
    ) -> Result<()> {
        match packet.header.type_word & CHANNEL_PHASE_MASK {
            CHANNEL_ANONS => {
                let ticket = ChannelTicket::decode(&packet.payload)
                    .ok_or_else(|| Error::Protocol("short channel ticket".into()))?;
                self.announce_channel(from, packet.header.id, ticket)
            }
            CHANNEL_REQUEST => {
                self.request_channel(from, packet.header.id, out);
                Ok(())
            }
            phase => Err(Error::Protocol(format!(
                "unexpected channel phase 0x{:04x}",
                phase
            ))),
        }
    }

    fn announce_channel(
        &mut self,
        from: ClientKey,
        id: Ident,
        mut ticket: ChannelTicket,
    ) -> Result<()> {
        // The producer rarely knows its own address; trust the socket.
        ticket.ip = match self.client(from).map(|c| c.addr.ip()) {
            Some(IpAddr::V4(ip)) => ip,
            _ => Ipv4Addr::UNSPECIFIED,
        };

        let slot = self
            .channels
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|ch| ch.id == id));
        let index = match slot {
            Some(index) => index,
            None => {
                let index = self
                    .channels
                    .iter()
                    .position(Option::is_none)
                    .ok_or(Error::NoCapacity)?;
                self.channels[index] = Some(ChannelRecord {
                    id,
                    ticket,
                    producer: None,
                    producer_changes: 0,
                    anons_count: 0,
                    request_count: 0,
                });
                index
            }
        };
        let channel = self.channels[index].as_mut().expect("resolved");
        channel.ticket = ticket;
        channel.anons_count += 1;
        if channel.producer != Some(from) {
            channel.producer = Some(from);
            channel.producer_changes += 1;
        }
        Ok(())
    }

    fn request_channel(&mut self, from: ClientKey, id: Ident, out: &mut Outbox) {
        let Some(channel) = self
            .channels
            .iter_mut()
            .flatten()
            .find(|ch| ch.id == id)
        else {
            log::debug!("[broker] channel request for unknown {}", id);
            return;
        };
        channel.request_count += 1;
        let packet = Packet::with_payload(
            Opcode::Channel.bits() | CHANNEL_TICKET,
            id,
            channel.ticket.encode(),
        );
        self.note_tx(from);
        out.send(Destination::Client(from), &packet);
    }

    // ===== Enumeration =====

    fn stream_list(
        &mut self,
        to: ClientKey,
        opcode: Opcode,
        sequence: u8,
        records: Vec<Vec<u8>>,
        record_size: usize,
        out: &mut Outbox,
    ) {
        let per_packet = (PAYLOAD_SIZE_MAX / record_size).max(1);
        let total = records.len().div_ceil(per_packet).max(1).min(255);

        let mut chunks: Vec<&[Vec<u8>]> = records.chunks(per_packet).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let last_index = chunks.len() - 1;
        for (index, chunk) in chunks.iter().enumerate() {
            let header = ListHeader {
                index: index as u8,
                total_hint: total as u8,
                records: chunk.len() as u8,
                sequence,
                last: index == last_index,
            };
            let mut payload = Vec::with_capacity(chunk.len() * record_size);
            for record in *chunk {
                payload.extend_from_slice(record);
            }
            let packet = Packet::with_payload(opcode.bits(), header.to_ident(), payload);
            self.note_tx(to);
            out.send(Destination::Client(to), &packet);
        }
    }

    fn stream_event_list(&mut self, to: ClientKey, sequence: u8, out: &mut Outbox) {
        let records: Vec<Vec<u8>> = self
            .events
            .iter()
            .flatten()
            .map(|event| {
                let mut short_data = [0u8; SHORT_DATA_SIZE];
                let head = event.value.len().min(SHORT_DATA_SIZE);
                short_data[..head].copy_from_slice(&event.value[..head]);
                let info = EventInfo {
                    id: event.id,
                    var_type: event.var_type,
                    short_data,
                    data_size: event.value.len() as u16,
                    time: event.last_write,
                    count: event.write_count,
                    consumers_count: event.consumers_count,
                    producers_count: event.producer_changes,
                };
                let mut buf = Vec::with_capacity(EventInfo::SIZE);
                info.encode_into(&mut buf);
                buf
            })
            .collect();
        self.stream_list(to, Opcode::EventList, sequence, records, EventInfo::SIZE, out);
    }

    fn stream_client_list(&mut self, to: ClientKey, sequence: u8, out: &mut Outbox) {
        let records: Vec<Vec<u8>> = self
            .clients
            .iter()
            .flatten()
            .map(|c| {
                let info = ClientInfo {
                    id: c.id,
                    subscribe_count: c.subscribe_count,
                    write_count: c.write_count,
                    rx_packets: c.rx_packets,
                    tx_packets: c.tx_packets,
                    ip: match c.addr.ip() {
                        IpAddr::V4(ip) => ip,
                        IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                    },
                };
                let mut buf = Vec::with_capacity(ClientInfo::SIZE);
                info.encode_into(&mut buf);
                buf
            })
            .collect();
        self.stream_list(to, Opcode::ClientList, sequence, records, ClientInfo::SIZE, out);
    }

    fn stream_channel_list(&mut self, to: ClientKey, sequence: u8, out: &mut Outbox) {
        let records: Vec<Vec<u8>> = self
            .channels
            .iter()
            .flatten()
            .map(|ch| {
                let info = ChannelInfo {
                    id: ch.id,
                    anons_count: ch.anons_count,
                    request_count: ch.request_count,
                    ip: ch.ticket.ip,
                    port: ch.ticket.port,
                };
                let mut buf = Vec::with_capacity(ChannelInfo::SIZE);
                info.encode_into(&mut buf);
                buf
            })
            .collect();
        self.stream_list(
            to,
            Opcode::ChannelList,
            sequence,
            records,
            ChannelInfo::SIZE,
            out,
        );
    }

    // ===== Handshake =====

    fn send_status(&mut self, to: Destination, code: StatusCode, out: &mut Outbox) {
        let mut packet = Packet::request(Opcode::ServerStatus.bits(), self.id);
        packet.header.update_counter = code.counter();
        if let Destination::Client(key) = to {
            self.note_tx(key);
        }
        out.send(to, &packet);
    }

    fn handle_client_id(&mut self, from: ClientKey, packet: &Packet, out: &mut Outbox) {
        let major = packet.header.sync0;
        if major != VERSION_MAJOR {
            log::info!(
                "[broker] refusing client {} with protocol major {}",
                packet.header.id,
                major
            );
            self.send_status(Destination::Client(from), StatusCode::NotSupport, out);
            out.closes.push(from);
            return;
        }
        if let Some(c) = self.client_mut(from) {
            c.id = packet.header.id;
            c.version = ((major & 0xff) << 8) | (packet.header.sync1 & 0xff);
        }
        self.send_status(Destination::Client(from), StatusCode::NotFound, out);
    }

    // ===== Dispatch =====

    /// Process one decoded packet from a known client.
    pub fn dispatch(&mut self, from: ClientKey, packet: &Packet, out: &mut Outbox) {
        if let Some(c) = self.client_mut(from) {
            c.rx_packets += 1;
        }
        let header = &packet.header;
        let Some(opcode) = Opcode::from_type_word(header.type_word) else {
            log::debug!("[broker] dropping reserved opcode 0x{:08x}", header.type_word);
            return;
        };

        let result = match opcode {
            Opcode::ClientId => {
                self.handle_client_id(from, packet, out);
                Ok(())
            }
            Opcode::Define => self.define_event(
                header.id,
                header.type_word,
                (!packet.payload.is_empty()).then_some(&packet.payload[..]),
                header.payload_len(),
            ),
            Opcode::Undefine => {
                self.free_event(&header.id);
                Ok(())
            }
            Opcode::Write => self.handle_write(
                Some(from),
                header.id,
                header.type_word,
                &packet.payload,
                out,
            ),
            Opcode::Read => {
                self.handle_read(from, header.id, out);
                Ok(())
            }
            Opcode::Subscribe => self.handle_subscribe(
                from,
                header.id,
                header.type_word,
                header.update_counter,
                out,
            ),
            Opcode::Unsubscribe => {
                self.handle_unsubscribe(from, &header.id);
                Ok(())
            }
            Opcode::EventList => {
                self.stream_event_list(from, header.id.as_bytes()[0], out);
                Ok(())
            }
            Opcode::ClientList => {
                self.stream_client_list(from, header.id.as_bytes()[0], out);
                Ok(())
            }
            Opcode::ChannelList => {
                self.stream_channel_list(from, header.id.as_bytes()[0], out);
                Ok(())
            }
            Opcode::Channel => self.handle_channel(from, packet, out),
            Opcode::Empty | Opcode::Event | Opcode::ServerStatus | Opcode::Ack => Ok(()),
        };

        // Transient per-packet failures are logged and dropped, never fatal.
        if let Err(e) = result {
            log::debug!(
                "[broker] {:?} for {} dropped: {}",
                opcode,
                header.id,
                e
            );
        }
    }

    /// Process a datagram; unknown sources must identify first.
    pub fn dispatch_datagram(&mut self, from_addr: SocketAddr, packet: &Packet, out: &mut Outbox) {
        let key = match self.find_udp_client_by_addr(from_addr) {
            Some(key) => key,
            None => {
                if Opcode::from_type_word(packet.header.type_word) != Some(Opcode::ClientId) {
                    log::debug!("[broker] unidentified datagram source {}", from_addr);
                    self.send_status(
                        Destination::Datagram(from_addr),
                        StatusCode::UnknownClient,
                        out,
                    );
                    return;
                }
                match self.find_udp_client_by_id(&packet.header.id) {
                    Some(key) => {
                        // Same client, new source address.
                        if let Some(c) = self.client_mut(key) {
                            c.addr = from_addr;
                        }
                        key
                    }
                    None => match self.add_client(ClientLink::Udp, from_addr) {
                        Ok(key) => key,
                        Err(e) => {
                            log::warn!("[broker] datagram client {} rejected: {}", from_addr, e);
                            return;
                        }
                    },
                }
            }
        };
        self.dispatch(key, packet, out);
    }

    // ===== Local (broker-side application) API =====

    pub fn define_local(
        &mut self,
        name: &str,
        type_word: u32,
        seed: Option<&[u8]>,
    ) -> Result<()> {
        self.define_event(Ident::from_label(name), type_word, seed, 0)
    }

    pub fn undefine_local(&mut self, name: &str) {
        self.free_event(&Ident::from_label(name));
    }

    pub fn write_local(
        &mut self,
        name: &str,
        type_word: u32,
        data: &[u8],
        out: &mut Outbox,
    ) -> Result<()> {
        self.handle_write(None, Ident::from_label(name), type_word, data, out)
    }

    pub fn read_local(&mut self, name: &str) -> Result<(u32, Vec<u8>)> {
        let index = self
            .find_event(&Ident::from_label(name))
            .ok_or_else(|| Error::Protocol(format!("event {} not defined", name)))?;
        let event = self.events[index].as_ref().expect("resolved");
        Ok((event.var_type, event.value.clone()))
    }

    pub fn subscribe_local(
        &mut self,
        name: &str,
        type_word: u32,
        callback: LocalCallback,
    ) -> Result<()> {
        let id = Ident::from_label(name);
        let index = match self.find_event(&id) {
            Some(index) => index,
            None => {
                if type_word & FLAG_FORCE == 0 {
                    return Err(Error::Protocol(format!("event {} not defined", name)));
                }
                self.create_event(id, type_word & VAR_TYPE_MASK)?
            }
        };
        self.events[index].as_mut().expect("resolved").callback = Some(callback);
        Ok(())
    }

    pub fn unsubscribe_local(&mut self, name: &str) {
        if let Some(index) = self.find_event(&Ident::from_label(name)) {
            self.events[index].as_mut().expect("resolved").callback = None;
        }
    }

    // ===== Introspection (tests and statistics) =====

    pub fn event_count(&self) -> usize {
        self.events.iter().flatten().count()
    }

    pub fn client_count(&self) -> usize {
        self.clients.iter().flatten().count()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.iter().flatten().count()
    }

    pub fn update_counter(&self) -> u64 {
        self.update_counter
    }

    /// Invariant: every event's non-null consumer entries match its count and
    /// resolve to live clients.
    #[cfg(test)]
    pub fn consumers_consistent(&self) -> bool {
        self.events.iter().flatten().all(|event| {
            let live = event
                .consumers
                .iter()
                .flatten()
                .filter(|key| self.client(**key).is_some())
                .count();
            let present = event.consumers.iter().flatten().count();
            live == present && present == event.consumers_count as usize
        })
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state() -> BrokerState {
        BrokerState::new(Ident::from_label("hub"))
    }

    fn tcp_client(state: &mut BrokerState, n: u8) -> ClientKey {
        let addr: SocketAddr = format!("192.168.1.{}:50000", n).parse().expect("addr");
        state.add_client(ClientLink::Tcp, addr).expect("slot free")
    }

    fn write_packet(name: &str, var: VarType, flags: u32, payload: &[u8]) -> Packet {
        Packet::with_payload(
            Opcode::Write.bits() | var.bits() | flags,
            Ident::from_label(name),
            payload.to_vec(),
        )
    }

    fn subscribe_packet(name: &str, var: VarType, flags: u32, last_seen: u64) -> Packet {
        let mut p = Packet::request(
            Opcode::Subscribe.bits() | var.bits() | flags,
            Ident::from_label(name),
        );
        p.header.update_counter = last_seen;
        p
    }

    fn decode_sends(out: &Outbox) -> Vec<(Destination, Packet)> {
        out.sends
            .iter()
            .map(|(to, frame)| (*to, Packet::decode(frame).expect("valid frame")))
            .collect()
    }

    #[test]
    fn test_define_then_read() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        s.define_local("count", VarType::Int32.bits(), Some(&83i32.to_le_bytes()))
            .expect("define");

        let mut out = Outbox::new();
        s.handle_read(a, Ident::from_label("count"), &mut out);
        let sends = decode_sends(&out);
        assert_eq!(sends.len(), 1);
        let (_, reply) = &sends[0];
        assert_eq!(reply.header.type_word & VAR_TYPE_MASK, VarType::Int32.bits());
        assert_eq!(reply.payload, 83i32.to_le_bytes());
    }

    #[test]
    fn test_read_missing_event() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let mut out = Outbox::new();
        s.handle_read(a, Ident::from_label("ghost"), &mut out);
        let sends = decode_sends(&out);
        let (_, reply) = &sends[0];
        assert_eq!(reply.header.type_word & VAR_TYPE_MASK, VarType::NotDefined.bits());
        assert_eq!(reply.header.payload_len(), 0);
    }

    #[test]
    fn test_write_requires_definition_without_force() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let mut out = Outbox::new();
        s.dispatch(a, &write_packet("mode", VarType::Int32, 0, &1i32.to_le_bytes()), &mut out);
        assert_eq!(s.event_count(), 0);

        s.dispatch(
            a,
            &write_packet("mode", VarType::Int32, FLAG_FORCE, &1i32.to_le_bytes()),
            &mut out,
        );
        assert_eq!(s.event_count(), 1);
    }

    #[test]
    fn test_fan_out_skips_producer_unless_echo() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let b = tcp_client(&mut s, 2);
        let c = tcp_client(&mut s, 3);
        let d = tcp_client(&mut s, 4);
        s.define_local("temp", VarType::Float.bits(), None).expect("define");

        let mut out = Outbox::new();
        for key in [a, b, c, d] {
            s.dispatch(key, &subscribe_packet("temp", VarType::Float, 0, 0), &mut out);
        }
        out = Outbox::new();
        s.dispatch(
            a,
            &write_packet("temp", VarType::Float, 0, &3.14f32.to_le_bytes()),
            &mut out,
        );
        let sends = decode_sends(&out);
        assert_eq!(sends.len(), 3, "B, C, D each get exactly one EVENT");
        for (to, packet) in &sends {
            assert_ne!(*to, Destination::Client(a), "producer is skipped");
            assert_eq!(packet.payload, 3.14f32.to_le_bytes());
            assert_eq!(
                Opcode::from_type_word(packet.header.type_word),
                Some(Opcode::Event)
            );
        }

        // With ECHO the producer receives its own write too.
        out = Outbox::new();
        s.dispatch(
            a,
            &write_packet("temp", VarType::Float, FLAG_ECHO, &2.71f32.to_le_bytes()),
            &mut out,
        );
        assert_eq!(out.sends.len(), 4);
    }

    #[test]
    fn test_write_type_mismatch_dropped() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        s.define_local("temp", VarType::Float.bits(), None).expect("define");

        let mut out = Outbox::new();
        s.dispatch(a, &write_packet("temp", VarType::String, 0, b"hot\0"), &mut out);
        let (_, value) = s.read_local("temp").expect("still defined");
        assert!(value.is_empty(), "mismatched write was dropped");
    }

    #[test]
    fn test_any_accepts_either_side() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        s.define_local("blob", VarType::Any.bits(), None).expect("define");
        let mut out = Outbox::new();
        s.dispatch(a, &write_packet("blob", VarType::String, 0, b"x\0"), &mut out);
        assert_eq!(s.read_local("blob").expect("defined").1, b"x\0");

        s.define_local("num", VarType::Int32.bits(), None).expect("define");
        s.dispatch(a, &write_packet("num", VarType::Any, 0, &7i32.to_le_bytes()), &mut out);
        assert_eq!(s.read_local("num").expect("defined").1, 7i32.to_le_bytes());
    }

    #[test]
    fn test_update_counter_strictly_monotone() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        s.define_local("n", VarType::Int32.bits(), None).expect("define");
        let mut seen = Vec::new();
        for i in 0..10i32 {
            let mut out = Outbox::new();
            s.dispatch(a, &write_packet("n", VarType::Int32, 0, &i.to_le_bytes()), &mut out);
            seen.push(s.update_counter());
        }
        for pair in seen.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_lost_redelivery_on_stale_subscribe() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let b = tcp_client(&mut s, 2);
        s.define_local("mode", VarType::Int32.bits(), None).expect("define");

        let mut out = Outbox::new();
        s.dispatch(a, &write_packet("mode", VarType::Int32, 0, &5i32.to_le_bytes()), &mut out);

        // B subscribes claiming it never saw anything.
        out = Outbox::new();
        s.dispatch(b, &subscribe_packet("mode", VarType::Int32, 0, 0), &mut out);
        let sends = decode_sends(&out);
        assert_eq!(sends.len(), 1);
        let (to, packet) = &sends[0];
        assert_eq!(*to, Destination::Client(b));
        assert_ne!(packet.header.type_word & STATUS_LOST, 0, "marked LOST");
        assert_eq!(packet.payload, 5i32.to_le_bytes());

        // Re-subscribing with the current counter stays silent.
        let current = packet.header.update_counter;
        out = Outbox::new();
        s.dispatch(b, &subscribe_packet("mode", VarType::Int32, 0, current), &mut out);
        assert!(out.sends.is_empty());
    }

    #[test]
    fn test_duplicate_subscribe_is_idempotent() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let b = tcp_client(&mut s, 2);
        s.define_local("x", VarType::Int32.bits(), None).expect("define");

        let mut out = Outbox::new();
        s.dispatch(b, &subscribe_packet("x", VarType::Int32, 0, 0), &mut out);
        s.dispatch(b, &subscribe_packet("x", VarType::Int32, 0, 0), &mut out);
        out = Outbox::new();
        s.dispatch(a, &write_packet("x", VarType::Int32, 0, &1i32.to_le_bytes()), &mut out);
        assert_eq!(out.sends.len(), 1, "one subscription, one delivery");
        assert!(s.consumers_consistent());
    }

    #[test]
    fn test_subscribe_type_mismatch_rejected() {
        let mut s = state();
        let b = tcp_client(&mut s, 2);
        s.define_local("temp", VarType::Float.bits(), None).expect("define");
        let mut out = Outbox::new();
        s.dispatch(b, &subscribe_packet("temp", VarType::Int32, 0, 0), &mut out);
        assert!(out.sends.is_empty());
        assert!(s.consumers_consistent());
        assert_eq!(s.client(b).expect("live").subscribe_count, 0);
    }

    #[test]
    fn test_remove_client_scrubs_tables() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let b = tcp_client(&mut s, 2);
        s.define_local("x", VarType::Any.bits(), None).expect("define");

        let mut out = Outbox::new();
        s.dispatch(b, &subscribe_packet("x", VarType::Any, 0, 0), &mut out);
        let ticket = ChannelTicket::new(Ipv4Addr::UNSPECIFIED, 7000, 0);
        let anons = Packet::with_payload(
            Opcode::Channel.bits() | CHANNEL_ANONS,
            Ident::from_label("pipe"),
            ticket.encode(),
        );
        s.dispatch(b, &anons, &mut out);
        assert_eq!(s.channel_count(), 1);

        s.remove_client(b);
        assert_eq!(s.client_count(), 1);
        assert_eq!(s.channel_count(), 0, "producer's channels are deleted");
        assert!(s.consumers_consistent());

        // Fan-out after removal reaches nobody.
        out = Outbox::new();
        s.dispatch(a, &write_packet("x", VarType::Any, FLAG_FORCE, b"v"), &mut out);
        assert!(out.sends.is_empty());
    }

    #[test]
    fn test_generation_guard_blocks_stale_keys() {
        let mut s = state();
        let b = tcp_client(&mut s, 2);
        s.remove_client(b);
        let b2 = s
            .add_client(ClientLink::Tcp, "192.168.1.9:1".parse().expect("addr"))
            .expect("slot reused");
        assert_eq!(b.index, b2.index, "slot is reused");
        assert!(s.client(b).is_none(), "stale key no longer resolves");
        assert!(s.client(b2).is_some());
    }

    #[test]
    fn test_client_table_capacity() {
        let mut s = state();
        for n in 0..CLIENT_TABLE_CAPACITY {
            let addr: SocketAddr = format!("10.0.0.{}:{}", n % 250, 1000 + n).parse().expect("addr");
            s.add_client(ClientLink::Tcp, addr).expect("capacity left");
        }
        let addr: SocketAddr = "10.0.1.1:9999".parse().expect("addr");
        assert!(matches!(
            s.add_client(ClientLink::Tcp, addr),
            Err(Error::NoCapacity)
        ));
    }

    #[test]
    fn test_event_table_capacity() {
        let mut s = state();
        for n in 0..EVENT_TABLE_CAPACITY {
            s.define_local(&format!("ev{}", n), VarType::Empty.bits(), None)
                .expect("capacity left");
        }
        assert!(matches!(
            s.define_local("overflow", VarType::Empty.bits(), None),
            Err(Error::NoCapacity)
        ));
    }

    #[test]
    fn test_define_redefinition_needs_force() {
        let mut s = state();
        s.define_local("cfg", VarType::Int32.bits(), None).expect("define");
        assert!(s.define_local("cfg", VarType::Int64.bits(), None).is_err());
        s.define_local("cfg", VarType::Int64.bits() | FLAG_FORCE, None)
            .expect("FORCE permits redefinition");
        assert_eq!(s.read_local("cfg").expect("defined").0, VarType::Int64.bits());
    }

    #[test]
    fn test_version_handshake() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let mut hello = Packet::request(Opcode::ClientId.bits(), Ident::from_label("node-a"));
        hello.header.sync0 = VERSION_MAJOR;
        hello.header.sync1 = 1;

        let mut out = Outbox::new();
        s.dispatch(a, &hello, &mut out);
        let sends = decode_sends(&out);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].1.header.update_counter, StatusCode::NotFound.counter());
        assert!(out.closes.is_empty());
        assert_eq!(s.client(a).expect("live").version, (VERSION_MAJOR << 8) | 1);

        // Major mismatch: NOTSUPPORT plus disconnect.
        let b = tcp_client(&mut s, 2);
        let mut old = Packet::request(Opcode::ClientId.bits(), Ident::from_label("node-b"));
        old.header.sync0 = 1;
        out = Outbox::new();
        s.dispatch(b, &old, &mut out);
        let sends = decode_sends(&out);
        assert_eq!(sends[0].1.header.update_counter, StatusCode::NotSupport.counter());
        assert_eq!(out.closes, vec![b]);
    }

    #[test]
    fn test_datagram_unknown_source_gets_status() {
        let mut s = state();
        let addr: SocketAddr = "10.1.1.1:5555".parse().expect("addr");
        let mut out = Outbox::new();
        s.dispatch_datagram(addr, &write_packet("x", VarType::Int32, 0, &[0; 4]), &mut out);

        assert_eq!(s.client_count(), 0);
        let sends = decode_sends(&out);
        assert_eq!(sends.len(), 1);
        assert_eq!(sends[0].0, Destination::Datagram(addr));
        assert_eq!(
            sends[0].1.header.update_counter,
            StatusCode::UnknownClient.counter()
        );
    }

    #[test]
    fn test_datagram_client_id_registers_and_rebinds() {
        let mut s = state();
        let addr1: SocketAddr = "10.1.1.1:5555".parse().expect("addr");
        let mut hello = Packet::request(Opcode::ClientId.bits(), Ident::from_label("u1"));
        hello.header.sync0 = VERSION_MAJOR;

        let mut out = Outbox::new();
        s.dispatch_datagram(addr1, &hello, &mut out);
        assert_eq!(s.client_count(), 1);
        let key = s.find_udp_client_by_addr(addr1).expect("registered");

        // The same identity from a new source address rebinds the record.
        let addr2: SocketAddr = "10.1.1.1:5999".parse().expect("addr");
        out = Outbox::new();
        s.dispatch_datagram(addr2, &hello, &mut out);
        assert_eq!(s.client_count(), 1);
        assert_eq!(s.client(key).expect("live").addr, addr2);
    }

    #[test]
    fn test_channel_ticket_ip_rewrite() {
        let mut s = state();
        let a = tcp_client(&mut s, 7);
        let claimed = ChannelTicket::new(Ipv4Addr::new(8, 8, 8, 8), 6000, 2);
        let anons = Packet::with_payload(
            Opcode::Channel.bits() | CHANNEL_ANONS,
            Ident::from_label("pipe"),
            claimed.encode(),
        );
        let mut out = Outbox::new();
        s.dispatch(a, &anons, &mut out);

        let request = Packet::request(
            Opcode::Channel.bits() | CHANNEL_REQUEST,
            Ident::from_label("pipe"),
        );
        out = Outbox::new();
        s.dispatch(a, &request, &mut out);
        let sends = decode_sends(&out);
        let ticket = ChannelTicket::decode(&sends[0].1.payload).expect("ticket payload");
        assert_eq!(
            ticket.ip,
            Ipv4Addr::new(192, 168, 1, 7),
            "broker substitutes the observed source address"
        );
        assert_eq!(ticket.port, 6000);
        assert_eq!(ticket.flags, 2);
    }

    #[test]
    fn test_enumeration_chunking() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        for n in 0..120 {
            s.define_local(&format!("ev{:03}", n), VarType::Int32.bits(), None)
                .expect("capacity");
        }
        let mut request = Packet::request(Opcode::EventList.bits(), Ident::default());
        let mut id = [0u8; 32];
        id[0] = 7; // sequence chosen by the client
        request.header.id = Ident::from_bytes(id);

        let mut out = Outbox::new();
        s.dispatch(a, &request, &mut out);
        let sends = decode_sends(&out);

        let per_packet = PAYLOAD_SIZE_MAX / EventInfo::SIZE;
        let expected = 120usize.div_ceil(per_packet);
        assert_eq!(sends.len(), expected);

        let mut total = 0usize;
        for (i, (_, packet)) in sends.iter().enumerate() {
            let hdr = ListHeader::from_ident(&packet.header.id);
            assert_eq!(hdr.sequence, 7);
            assert_eq!(hdr.index, i as u8);
            assert_eq!(hdr.last, i == sends.len() - 1);
            assert_eq!(
                packet.header.payload_len(),
                usize::from(hdr.records) * EventInfo::SIZE
            );
            total += usize::from(hdr.records);
        }
        assert_eq!(total, 120);
    }

    #[test]
    fn test_enumeration_empty_table() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let request = Packet::request(Opcode::ChannelList.bits(), Ident::default());
        let mut out = Outbox::new();
        s.dispatch(a, &request, &mut out);
        let sends = decode_sends(&out);
        assert_eq!(sends.len(), 1);
        let hdr = ListHeader::from_ident(&sends[0].1.header.id);
        assert_eq!(hdr.records, 0);
        assert!(hdr.last);
    }

    #[test]
    fn test_local_callback_deferred_to_outbox() {
        let mut s = state();
        let a = tcp_client(&mut s, 1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        s.subscribe_local(
            "mode",
            VarType::Int32.bits() | FLAG_FORCE,
            Arc::new(move |name, data| {
                assert_eq!(name, "mode");
                assert_eq!(data, 9i32.to_le_bytes());
                hits_cb.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .expect("subscribe local");

        let mut out = Outbox::new();
        s.dispatch(a, &write_packet("mode", VarType::Int32, 0, &9i32.to_le_bytes()), &mut out);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "not invoked under the lock");
        assert_eq!(out.callbacks.len(), 1);
        let (cb, name, data) = out.callbacks.remove(0);
        cb(&name, &data);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_undefine_discards_subscribers() {
        let mut s = state();
        let b = tcp_client(&mut s, 2);
        s.define_local("x", VarType::Int32.bits(), None).expect("define");
        let mut out = Outbox::new();
        s.dispatch(b, &subscribe_packet("x", VarType::Int32, 0, 0), &mut out);

        let undefine = Packet::request(Opcode::Undefine.bits(), Ident::from_label("x"));
        s.dispatch(b, &undefine, &mut out);
        assert_eq!(s.event_count(), 0);
    }
}
