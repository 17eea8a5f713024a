// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Broker readiness loop.
//!
//! A single thread owns every broker socket and multiplexes readiness
//! through `mio`: the TCP listener, the UDP datagram socket, one token per
//! accepted client, and a waker the broker handle uses to push locally
//! produced traffic (and the shutdown request) into the loop.
//!
//! All table mutation happens behind the state mutex; socket writes happen
//! here, after the lock is released.

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use mio::net::{TcpListener, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;

use crate::broker::state::{BrokerState, ClientKey, ClientLink, Destination, Outbox};
use crate::config::{BROKER_KEEPALIVE_IDLE, HEADER_SIZE, PAYLOAD_SIZE_MAX};
use crate::protocol::{Framer, Packet};
#[cfg(feature = "crypt")]
use crate::protocol::{Opcode, StatusCode};
use crate::transport::tcp;

#[cfg(feature = "crypt")]
use crate::protocol::crypt::{self, CryptKey};

/// Token for the TCP listener.
pub(crate) const LISTENER_TOKEN: Token = Token(0);

/// Token for the UDP datagram socket.
pub(crate) const UDP_TOKEN: Token = Token(1);

/// Token for the waker (command channel).
pub(crate) const WAKER_TOKEN: Token = Token(2);

/// First token handed to accepted connections.
const CLIENT_TOKEN_BASE: usize = 3;

/// Maximum events processed per poll round.
const MAX_EVENTS: usize = 128;

/// Commands posted by the broker handle.
pub(crate) enum Command {
    /// Frames produced by the local API, to be flushed to sockets.
    Dispatch(Outbox),
    /// Close everything and exit the loop.
    Shutdown,
}

/// Per-connection socket state.
struct ClientIo {
    stream: mio::net::TcpStream,
    framer: Framer,
    key: ClientKey,
}

pub(crate) struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    udp: UdpSocket,
    state: Arc<Mutex<BrokerState>>,
    clients: HashMap<Token, ClientIo>,
    tokens: HashMap<ClientKey, Token>,
    next_token: usize,
    commands: Receiver<Command>,
    stop: Arc<AtomicBool>,
    #[cfg(feature = "crypt")]
    crypt: Option<CryptKey>,
}

impl EventLoop {
    pub(crate) fn new(
        poll: Poll,
        mut listener: TcpListener,
        mut udp: UdpSocket,
        state: Arc<Mutex<BrokerState>>,
        commands: Receiver<Command>,
        stop: Arc<AtomicBool>,
        #[cfg(feature = "crypt")] crypt: Option<CryptKey>,
    ) -> io::Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        poll.registry()
            .register(&mut udp, UDP_TOKEN, Interest::READABLE)?;
        Ok(Self {
            poll,
            listener,
            udp,
            state,
            clients: HashMap::new(),
            tokens: HashMap::new(),
            next_token: CLIENT_TOKEN_BASE,
            commands,
            stop,
            #[cfg(feature = "crypt")]
            crypt,
        })
    }

    /// Run until shutdown is requested.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(MAX_EVENTS);
        log::info!(
            "[broker] serving on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into())
        );

        'outer: loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("[broker] poll failed: {}", e);
                break;
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_clients(),
                    UDP_TOKEN => self.read_datagrams(),
                    WAKER_TOKEN => {
                        if self.drain_commands() {
                            break 'outer;
                        }
                    }
                    token => self.client_readable(token),
                }
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }
        self.close_all();
        log::info!("[broker] event loop stopped");
    }

    /// Returns true when shutdown was requested.
    fn drain_commands(&mut self) -> bool {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Dispatch(outbox) => self.flush(outbox),
                Command::Shutdown => return true,
            }
        }
        false
    }

    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    if let Err(e) = tcp::tune_accepted(&stream, BROKER_KEEPALIVE_IDLE) {
                        log::debug!("[broker] tuning {} failed: {}", addr, e);
                    }
                    let key = match self.state.lock().add_client(ClientLink::Tcp, addr) {
                        Ok(key) => key,
                        Err(e) => {
                            log::warn!("[broker] rejecting {}: {}", addr, e);
                            continue;
                        }
                    };
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        log::error!("[broker] register {} failed: {}", addr, e);
                        self.state.lock().remove_client(key);
                        continue;
                    }
                    log::debug!("[broker] client connected from {}", addr);
                    self.clients.insert(
                        token,
                        ClientIo {
                            stream,
                            framer: Framer::new(),
                            key,
                        },
                    );
                    self.tokens.insert(key, token);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::debug!("[broker] accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn client_readable(&mut self, token: Token) {
        let mut frames = Vec::new();
        let mut dead = false;
        let key = {
            let Some(io_state) = self.clients.get_mut(&token) else {
                return;
            };
            loop {
                let spare = io_state.framer.writable();
                match io_state.stream.read(spare) {
                    Ok(0) => {
                        dead = true;
                        break;
                    }
                    Ok(n) => {
                        io_state.framer.advance(n);
                        while let Some(frame) = io_state.framer.next_frame() {
                            frames.push(frame);
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        log::debug!("[broker] read error: {}", e);
                        dead = true;
                        break;
                    }
                }
            }
            io_state.key
        };

        for frame in frames {
            if self.handle_frame(key, frame).is_err() {
                dead = true;
                break;
            }
        }
        if dead {
            self.close_token(token);
        }
    }

    /// Decode and dispatch one frame; an envelope failure is fatal.
    fn handle_frame(&mut self, key: ClientKey, frame: Vec<u8>) -> std::result::Result<(), ()> {
        #[allow(unused_mut)]
        let mut frame = frame;
        #[cfg(feature = "crypt")]
        if let Some(crypt_key) = &self.crypt {
            if crypt::open_frame(crypt_key, &mut frame).is_err() {
                log::warn!("[broker] envelope verification failed, dropping client");
                self.send_crypt_reject(key);
                return Err(());
            }
        }
        match Packet::decode(&frame) {
            Ok(packet) => {
                let mut outbox = Outbox::new();
                self.state.lock().dispatch(key, &packet, &mut outbox);
                self.flush(outbox);
                Ok(())
            }
            Err(e) => {
                log::debug!("[broker] undecodable frame: {}", e);
                Ok(())
            }
        }
    }

    #[cfg(feature = "crypt")]
    fn send_crypt_reject(&mut self, key: ClientKey) {
        let broker_id = self.state.lock().broker_id();
        let mut packet = Packet::request(Opcode::ServerStatus.bits(), broker_id);
        packet.header.update_counter = StatusCode::Crypt.counter();
        // Sent in the clear so the peer can read the verdict.
        self.write_to_client(key, packet.encode());
    }

    fn read_datagrams(&mut self) {
        let mut buf = [0u8; HEADER_SIZE + PAYLOAD_SIZE_MAX];
        loop {
            match self.udp.recv_from(&mut buf) {
                Ok((n, addr)) => {
                    if n < HEADER_SIZE {
                        continue;
                    }
                    #[allow(unused_mut)]
                    let mut frame = buf[..n].to_vec();
                    #[cfg(feature = "crypt")]
                    if let Some(crypt_key) = &self.crypt {
                        if crypt::open_frame(crypt_key, &mut frame).is_err() {
                            log::debug!("[broker] dropping unverifiable datagram from {}", addr);
                            continue;
                        }
                    }
                    match Packet::decode_datagram(&frame) {
                        Ok(packet) => {
                            let mut outbox = Outbox::new();
                            self.state
                                .lock()
                                .dispatch_datagram(addr, &packet, &mut outbox);
                            self.flush(outbox);
                        }
                        Err(e) => log::debug!("[broker] bad datagram from {}: {}", addr, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // Transient network errors are ignored; the socket stays up.
                    log::debug!("[broker] datagram receive error: {}", e);
                    break;
                }
            }
        }
    }

    /// Flush side effects after the table lock is released.
    pub(crate) fn flush(&mut self, mut outbox: Outbox) {
        for (callback, name, data) in outbox.callbacks.drain(..) {
            callback(&name, &data);
        }
        for (dest, frame) in outbox.sends.drain(..) {
            #[allow(unused_mut)]
            let mut frame = frame;
            #[cfg(feature = "crypt")]
            if let Some(crypt_key) = &self.crypt {
                if let Err(e) = crypt::seal_frame(crypt_key, &mut frame) {
                    log::warn!("[broker] sealing outbound frame failed: {}", e);
                    continue;
                }
            }
            match dest {
                Destination::Client(key) => self.write_to_client(key, frame),
                Destination::Datagram(addr) => {
                    if let Err(e) = self.udp.send_to(&frame, addr) {
                        log::debug!("[broker] datagram to {} failed: {}", addr, e);
                    }
                }
            }
        }
        for key in outbox.closes.drain(..) {
            if let Some(token) = self.tokens.get(&key).copied() {
                self.close_token(token);
            } else {
                self.state.lock().remove_client(key);
            }
        }
    }

    /// Send one frame to a client over its transport.
    ///
    /// Send errors increment the tx-error counter and never disconnect; the
    /// read path owns connection teardown.
    fn write_to_client(&mut self, key: ClientKey, frame: Vec<u8>) {
        let link = {
            let state = self.state.lock();
            state.client(key).map(|c| (c.link, c.addr))
        };
        match link {
            Some((ClientLink::Tcp, _)) => {
                if let Some(token) = self.tokens.get(&key) {
                    if let Some(io_state) = self.clients.get_mut(token) {
                        if let Err(e) = tcp::send_all(&mut io_state.stream, &frame) {
                            log::debug!("[broker] send to client failed: {}", e);
                            self.state.lock().note_tx_error(key);
                        }
                    }
                }
            }
            Some((ClientLink::Udp, addr)) => {
                if let Err(e) = self.udp.send_to(&frame, addr) {
                    log::debug!("[broker] datagram to {} failed: {}", addr, e);
                    self.state.lock().note_tx_error(key);
                }
            }
            None => {}
        }
    }

    fn close_token(&mut self, token: Token) {
        if let Some(mut io_state) = self.clients.remove(&token) {
            let _ = self.poll.registry().deregister(&mut io_state.stream);
            self.tokens.remove(&io_state.key);
            self.state.lock().remove_client(io_state.key);
            log::debug!("[broker] client disconnected");
        }
    }

    fn close_all(&mut self) {
        let tokens: Vec<Token> = self.clients.keys().copied().collect();
        for token in tokens {
            self.close_token(token);
        }
        // Listener and UDP socket close on drop.
    }
}
