// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TCP listener and client connector.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::time::Duration;

use crate::config::CLIENT_KEEPALIVE_IDLE;
use crate::transport::tune_stream;

/// Open a non-blocking listener suitable for the broker's mio loop.
pub fn listen(addr: SocketAddr) -> io::Result<mio::net::TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    let std_listener: std::net::TcpListener = socket.into();
    Ok(mio::net::TcpListener::from_std(std_listener))
}

/// Configure a freshly accepted broker-side stream.
///
/// Keepalive is long (the broker tolerates idle clients); linger zero makes
/// an aborted close reset the peer immediately instead of lingering in
/// TIME_WAIT with unread data.
pub fn tune_accepted(stream: &mio::net::TcpStream, keepalive_idle: Duration) -> io::Result<()> {
    tune_stream(stream, keepalive_idle)?;
    SockRef::from(stream).set_linger(Some(Duration::ZERO))?;
    Ok(())
}

/// Open a blocking client connection with the client-side tuning applied.
pub fn connect(addr: SocketAddr, timeout: Duration) -> io::Result<std::net::TcpStream> {
    let stream = std::net::TcpStream::connect_timeout(&addr, timeout)?;
    tune_stream(&stream, CLIENT_KEEPALIVE_IDLE)?;
    Ok(stream)
}

/// Write the whole buffer, looping over partial writes.
///
/// `WouldBlock` on a non-blocking socket is reported as an error: the send
/// policy counts it against the peer and never stalls the dispatcher.
pub fn send_all<W: Write>(writer: &mut W, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_listen_on_ephemeral_port() {
        let listener = listen("127.0.0.1:0".parse().expect("addr")).expect("listen");
        let addr = listener.local_addr().expect("local addr");
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_connect_and_send_all() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let handle = std::thread::spawn(move || {
            let (mut peer, _) = listener.accept().expect("accept");
            let mut buf = Vec::new();
            peer.read_to_end(&mut buf).expect("read");
            buf
        });

        let mut stream = connect(addr, Duration::from_secs(1)).expect("connect");
        send_all(&mut stream, b"chunked payload").expect("send all");
        drop(stream);

        assert_eq!(handle.join().expect("server thread"), b"chunked payload");
    }

    #[test]
    fn test_connect_timeout_to_dead_port() {
        // TEST-NET-1 address is guaranteed unroutable; connect must not hang.
        let addr: SocketAddr = "192.0.2.1:4444".parse().expect("addr");
        let started = std::time::Instant::now();
        let result = connect(addr, Duration::from_millis(200));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_send_all_write_zero() {
        struct Zero;
        impl Write for Zero {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let err = send_all(&mut Zero, b"data").expect_err("zero write is an error");
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
