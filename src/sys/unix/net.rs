//! Raw non-blocking socket creation shared by TCP/UDP endpoints, grounded on
//! mio's `sys/unix/net.rs` + `tcp/stream.rs`: build the fd with raw libc
//! calls (so we control `O_NONBLOCK`/`FD_CLOEXEC`/`SO_REUSEADDR` precisely),
//! then hand it to `std::net` for the actual read/write/peek machinery.

use std::io;
use std::mem::{size_of, size_of_val, MaybeUninit};
use std::net::SocketAddr;
use std::os::fd::{FromRawFd, RawFd};

pub fn socket_addr(addr: &SocketAddr) -> (*const libc::sockaddr, libc::socklen_t) {
    match addr {
        SocketAddr::V4(a) => (a as *const _ as *const libc::sockaddr, size_of_val(a) as libc::socklen_t),
        SocketAddr::V6(a) => (a as *const _ as *const libc::sockaddr, size_of_val(a) as libc::socklen_t),
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Create a non-blocking, close-on-exec socket for `addr`'s family.
pub fn new_ip_socket(addr: SocketAddr, socket_type: libc::c_int) -> io::Result<RawFd> {
    let domain = match addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };
    new_socket(domain, socket_type)
}

pub fn new_socket(domain: libc::c_int, socket_type: libc::c_int) -> io::Result<RawFd> {
    let ty = socket_type | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC;
    cvt(unsafe { libc::socket(domain, ty, 0) })
}

pub fn set_reuseaddr(fd: RawFd) -> io::Result<()> {
    let val: libc::c_int = 1;
    cvt(unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &val as *const _ as *const libc::c_void,
            size_of_val(&val) as libc::socklen_t,
        )
    })
    .map(|_| ())
}

pub fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = socket_addr(addr);
    cvt(unsafe { libc::bind(fd, raw, len) }).map(|_| ())
}

pub fn listen(fd: RawFd, backlog: i32) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog) }).map(|_| ())
}

pub fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<bool> {
    let (raw, len) = socket_addr(addr);
    match cvt(unsafe { libc::connect(fd, raw, len) }) {
        Ok(_) => Ok(true),
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

/// `accept4` with `SOCK_NONBLOCK|SOCK_CLOEXEC` where available, falling back
/// to `accept` + manual flag-setting on platforms lacking it (kqueue BSDs).
pub fn accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let accepted = cvt(unsafe {
        libc::accept4(
            fd,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    })?;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let accepted = {
        let s = cvt(unsafe { libc::accept(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len) })?;
        unsafe {
            libc::fcntl(s, libc::F_SETFL, libc::O_NONBLOCK);
            libc::fcntl(s, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        s
    };

    let addr = unsafe { to_socket_addr(storage.as_ptr())? };
    Ok((accepted, addr))
}

/// SAFETY: `storage` must have been filled by `getsockname`/`getpeername`/`accept`.
pub unsafe fn to_socket_addr(storage: *const libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match (*storage).ss_family as libc::c_int {
        libc::AF_INET => Ok(SocketAddr::V4(*(storage as *const libc::sockaddr_in as *const _))),
        libc::AF_INET6 => Ok(SocketAddr::V6(*(storage as *const libc::sockaddr_in6 as *const _))),
        _ => Err(io::ErrorKind::InvalidInput.into()),
    }
}

pub fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::uninit();
    let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    cvt(unsafe { libc::getpeername(fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len) })?;
    unsafe { to_socket_addr(storage.as_ptr()) }
}

pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(fd, libc::SOL_SOCKET, libc::SO_ERROR, &mut err as *mut _ as *mut libc::c_void, &mut len)
    })?;
    if err == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(err))
    }
}

/// SAFETY: `fd` must be a valid, owned file descriptor of the right kind.
pub unsafe fn tcp_stream_from_raw(fd: RawFd) -> std::net::TcpStream {
    std::net::TcpStream::from_raw_fd(fd)
}

pub unsafe fn tcp_listener_from_raw(fd: RawFd) -> std::net::TcpListener {
    std::net::TcpListener::from_raw_fd(fd)
}

pub unsafe fn udp_socket_from_raw(fd: RawFd) -> std::net::UdpSocket {
    std::net::UdpSocket::from_raw_fd(fd)
}
