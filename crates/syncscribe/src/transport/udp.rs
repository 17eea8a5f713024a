// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! UDP sockets: broker datagram listener, client socket, SSDP multicast.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::time::Duration;

use crate::config::{SSDP_GROUP, SSDP_PORT};
use crate::transport::tune_datagram;

/// Open the broker's non-blocking datagram socket on the service port.
pub fn bind(addr: SocketAddr) -> io::Result<mio::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    let std_socket: UdpSocket = socket.into();
    tune_datagram(&std_socket);
    Ok(mio::net::UdpSocket::from_std(std_socket))
}

/// Open a client datagram socket connected to the broker.
///
/// The socket carries a short receive timeout so the worker can observe the
/// terminal flag; a UDP socket has no half to shut down.
pub fn connect(server: SocketAddr, recv_tick: Duration) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(server)?;
    socket.set_read_timeout(Some(recv_tick))?;
    tune_datagram(&socket);
    Ok(socket)
}

/// Open a socket on the SSDP port, joined to the discovery group.
pub fn multicast_listener(recv_tick: Duration) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, SSDP_PORT);
    socket.bind(&SocketAddr::from(bind_addr).into())?;
    let socket: UdpSocket = socket.into();

    socket.join_multicast_v4(&SSDP_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    let _ = socket.set_multicast_ttl_v4(1);
    socket.set_read_timeout(Some(recv_tick))?;
    Ok(socket)
}

/// The SSDP group address as a socket address.
pub fn multicast_group() -> SocketAddr {
    SocketAddr::from(SocketAddrV4::new(SSDP_GROUP, SSDP_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral() {
        let socket = bind("127.0.0.1:0".parse().expect("addr")).expect("bind");
        assert_ne!(socket.local_addr().expect("local addr").port(), 0);
    }

    #[test]
    fn test_connect_round_trip() {
        let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
        let server_addr = server.local_addr().expect("addr");

        let client = connect(server_addr, Duration::from_millis(500)).expect("connect");
        client.send(b"ping").expect("send");

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).expect("recv");
        assert_eq!(&buf[..n], b"ping");

        server.send_to(b"pong", from).expect("reply");
        let n = client.recv(&mut buf).expect("recv reply");
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn test_connect_recv_times_out() {
        let server = UdpSocket::bind("127.0.0.1:0").expect("bind server");
        let client =
            connect(server.local_addr().expect("addr"), Duration::from_millis(50)).expect("connect");
        let mut buf = [0u8; 4];
        let err = client.recv(&mut buf).expect_err("no datagram pending");
        assert!(
            matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut),
            "unexpected kind {:?}",
            err.kind()
        );
    }

    #[test]
    fn test_multicast_group_address() {
        assert_eq!(multicast_group().to_string(), "239.255.255.250:1900");
    }
}
