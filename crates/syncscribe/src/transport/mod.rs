// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Socket plumbing: TCP listen/accept/connect, UDP datagram sockets and the
//! option tuning both sides apply.
//!
//! The broker multiplexes readiness through `mio`; the client runtime uses
//! plain blocking sockets owned by its worker thread. All option setting
//! goes through `socket2` so the tuning is identical on both paths.

pub mod tcp;
pub mod udp;

use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;

use crate::config::{KEEPALIVE_RETRIES, SOCKET_BUFFER_SIZE};

/// Apply the common stream tuning: NODELAY, enlarged buffers and keepalive.
///
/// Failures to resize buffers are ignored (the kernel clamps them anyway);
/// keepalive and NODELAY failures are reported.
pub fn tune_stream<'a, S>(stream: &'a S, keepalive_idle: Duration) -> io::Result<()>
where
    SockRef<'a>: From<&'a S>,
{
    let sock = SockRef::from(stream);
    sock.set_nodelay(true)?;
    let _ = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE);

    let keepalive = TcpKeepalive::new()
        .with_time(keepalive_idle)
        .with_interval(Duration::from_secs(1));
    #[cfg(unix)]
    let keepalive = keepalive.with_retries(KEEPALIVE_RETRIES);
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Enlarge datagram socket buffers.
pub fn tune_datagram<'a, S>(socket: &'a S)
where
    SockRef<'a>: From<&'a S>,
{
    let sock = SockRef::from(socket);
    let _ = sock.set_recv_buffer_size(SOCKET_BUFFER_SIZE);
    let _ = sock.set_send_buffer_size(SOCKET_BUFFER_SIZE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    #[test]
    fn test_tune_stream_applies_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
        let addr = listener.local_addr().expect("local addr");
        let stream = TcpStream::connect(addr).expect("connect");

        tune_stream(&stream, Duration::from_secs(30)).expect("tuning succeeds");
        assert!(stream.nodelay().expect("query nodelay"));
    }

    #[test]
    fn test_tune_datagram_does_not_fail() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("bind ephemeral");
        tune_datagram(&socket);
    }
}
