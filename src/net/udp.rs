//! UDP socket (§3 "UDP Socket"): datagram send/receive plus multicast
//! group membership, driven the same register-once/drain-to-`WouldBlock` way
//! as [`super::tcp::TcpSocket`].

use super::sysnet;
use crate::error::{Error, Result};
use crate::event_loop::LoopHandle;
use crate::interest::Interest;
use crate::poller::RawFdLike;
use crate::token::Token;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Default)]
pub struct UdpConfig {
    /// Local address to bind; `None` lets the OS pick an ephemeral port.
    pub bind_addr: Option<SocketAddr>,
}

pub trait UdpHandler: Send {
    fn on_datagram(&mut self, _socket: &UdpSocket, _data: &[u8], _from: SocketAddr) {}
    fn on_error(&mut self, _socket: &UdpSocket, _err: Error) {}
}

struct Inner {
    socket: Option<std::net::UdpSocket>,
    loop_handle: LoopHandle,
    token: Token,
    handler: Box<dyn UdpHandler>,
}

/// A bound UDP endpoint.
#[derive(Clone)]
pub struct UdpSocket {
    inner: Arc<Mutex<Inner>>,
}

impl UdpSocket {
    pub fn bind(loop_handle: LoopHandle, config: UdpConfig, handler: Box<dyn UdpHandler>) -> Result<UdpSocket> {
        let addr = config.bind_addr.unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        #[cfg(unix)]
        let socket = {
            let fd = sysnet::new_ip_socket(addr, libc::SOCK_DGRAM).map_err(Error::SockError)?;
            sysnet::bind(fd, &addr).map_err(Error::SockError)?;
            unsafe { sysnet::udp_socket_from_raw(fd) }
        };
        #[cfg(windows)]
        let socket = {
            let sock = sysnet::new_ip_socket(addr, windows_sys::Win32::Networking::WinSock::SOCK_DGRAM as i32)
                .map_err(Error::SockError)?;
            sysnet::bind_addr(sock, &addr).map_err(Error::SockError)?;
            unsafe { sysnet::udp_socket_from_raw(sock) }
        };
        socket.set_nonblocking(true).map_err(Error::SockError)?;

        let token = loop_handle.next_token()?;
        let fd = RawFdLike::of(&socket);
        let inner = Arc::new(Mutex::new(Inner { socket: Some(socket), loop_handle: loop_handle.clone(), token, handler }));

        let dispatch_inner = inner.clone();
        loop_handle.register(fd, token, Interest::READABLE, move |_event| {
            drain_datagrams(&dispatch_inner);
        })?;

        Ok(UdpSocket { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.lock().unwrap().socket.as_ref().ok_or(Error::InvalidState)?.local_addr().map_err(Error::SockError)
    }

    pub fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<usize> {
        let guard = self.inner.lock().unwrap();
        let socket = guard.socket.as_ref().ok_or(Error::InvalidState)?;
        socket.send_to(data, target).map_err(Error::SockError)
    }

    /// Join a multicast group on the socket's bound interface.
    pub fn join_multicast(&self, group: IpAddr) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let socket = guard.socket.as_ref().ok_or(Error::InvalidState)?;
        match group {
            IpAddr::V4(g) => socket.join_multicast_v4(&g, &Ipv4Addr::UNSPECIFIED).map_err(Error::SockError),
            IpAddr::V6(g) => socket.join_multicast_v6(&g, 0).map_err(Error::SockError),
        }
    }

    /// Leave a multicast group. Rejected once the socket has been closed
    /// (§9 Open Question: UDP multicast-leave-on-closed-socket is
    /// `INVALID_STATE`, not a silent no-op).
    pub fn leave_multicast(&self, group: IpAddr) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let socket = guard.socket.as_ref().ok_or(Error::InvalidState)?;
        match group {
            IpAddr::V4(g) => socket.leave_multicast_v4(&g, &Ipv4Addr::UNSPECIFIED).map_err(Error::SockError),
            IpAddr::V6(g) => socket.leave_multicast_v6(&g, 0).map_err(Error::SockError),
        }
    }

    pub fn close(&self) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        if let Some(socket) = guard.socket.take() {
            let fd = RawFdLike::of(&socket);
            guard.loop_handle.unregister(fd, guard.token)?;
        }
        Ok(())
    }
}

fn drain_datagrams(inner: &Arc<Mutex<Inner>>) {
    let mut buf = [0u8; 64 * 1024];
    loop {
        let result = {
            let guard = inner.lock().unwrap();
            let Some(socket) = guard.socket.as_ref() else { return };
            socket.recv_from(&mut buf)
        };
        match result {
            Ok((n, from)) => {
                let socket = UdpSocket { inner: inner.clone() };
                inner.lock().unwrap().handler.on_datagram(&socket, &buf[..n], from);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                let socket = UdpSocket { inner: inner.clone() };
                inner.lock().unwrap().handler.on_error(&socket, Error::SockError(e));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::sys::default_poller;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct Echo {
        received: Arc<Mutex<Vec<u8>>>,
        count: Arc<AtomicUsize>,
    }

    impl UdpHandler for Echo {
        fn on_datagram(&mut self, _socket: &UdpSocket, data: &[u8], _from: SocketAddr) {
            self.received.lock().unwrap().extend_from_slice(data);
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn send_to_and_receive_round_trip() {
        let poller = default_poller().unwrap();
        let lp = EventLoop::new(poller);
        let handle = lp.handle();

        let received = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));
        let handler = Echo { received: received.clone(), count: count.clone() };
        let socket = UdpSocket::bind(handle.clone(), UdpConfig::default(), Box::new(handler)).unwrap();
        let addr = socket.local_addr().unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"ping", addr).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            lp.step(Some(Duration::from_millis(50)), 0).unwrap();
        }
        assert_eq!(&*received.lock().unwrap(), b"ping");
    }
}
