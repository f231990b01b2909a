//! Socket creation and per-operation submission for the IOCP backend.

use super::Overlapped;
use crate::poller::Op;
use crate::token::Token;
use std::io;
use std::mem::{size_of, size_of_val, zeroed};
use std::net::SocketAddr;
use std::os::windows::io::{FromRawSocket, RawSocket};
use windows_sys::Win32::Networking::WinSock::*;

fn cvt(ret: i32) -> io::Result<i32> {
    if ret == SOCKET_ERROR {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

pub fn new_ip_socket(addr: SocketAddr, socket_type: i32) -> io::Result<RawSocket> {
    let family = if addr.is_ipv4() { AF_INET } else { AF_INET6 };
    let socket = unsafe {
        WSASocketW(family as i32, socket_type, 0, std::ptr::null(), 0, WSA_FLAG_OVERLAPPED)
    };
    if socket == INVALID_SOCKET {
        return Err(io::Error::last_os_error());
    }
    Ok(socket as RawSocket)
}

fn sockaddr_of(addr: &SocketAddr) -> (*const SOCKADDR, i32) {
    match addr {
        SocketAddr::V4(a) => (a as *const _ as *const SOCKADDR, size_of_val(a) as i32),
        SocketAddr::V6(a) => (a as *const _ as *const SOCKADDR, size_of_val(a) as i32),
    }
}

pub fn set_reuseaddr(socket: RawSocket) -> io::Result<()> {
    let val: i32 = 1;
    cvt(unsafe {
        setsockopt(socket as SOCKET, SOL_SOCKET as i32, SO_REUSEADDR as i32, &val as *const _ as *const u8, size_of_val(&val) as i32)
    })
    .map(|_| ())
}

pub fn bind_addr(socket: RawSocket, addr: &SocketAddr) -> io::Result<()> {
    let (raw, len) = sockaddr_of(addr);
    cvt(unsafe { windows_sys::Win32::Networking::WinSock::bind(socket as SOCKET, raw, len) }).map(|_| ())
}

/// Bind to an unspecified local address, a prerequisite `ConnectEx` imposes
/// that plain `connect()` does not.
pub fn bind_any(socket: RawSocket, v6: bool) -> io::Result<()> {
    let addr: SocketAddr = if v6 {
        "[::]:0".parse().unwrap()
    } else {
        "0.0.0.0:0".parse().unwrap()
    };
    bind_addr(socket, &addr)
}

pub fn listen_on(socket: RawSocket, backlog: i32) -> io::Result<()> {
    cvt(unsafe { windows_sys::Win32::Networking::WinSock::listen(socket as SOCKET, backlog) }).map(|_| ())
}

/// SAFETY: `socket` must be a valid, owned overlapped socket handle.
pub unsafe fn tcp_stream_from_raw(socket: RawSocket) -> std::net::TcpStream {
    std::net::TcpStream::from_raw_socket(socket)
}

pub unsafe fn tcp_listener_from_raw(socket: RawSocket) -> std::net::TcpListener {
    std::net::TcpListener::from_raw_socket(socket)
}

pub unsafe fn udp_socket_from_raw(socket: RawSocket) -> std::net::UdpSocket {
    std::net::UdpSocket::from_raw_socket(socket)
}

/// Resolve `AcceptEx`/`ConnectEx`, which live outside the stable winsock
/// vtable and must be queried per-socket via `SIO_GET_EXTENSION_FUNCTION_POINTER`.
unsafe fn get_extension_fn<T>(socket: SOCKET, guid: GUID) -> io::Result<T> {
    let mut func: usize = 0;
    let mut bytes: u32 = 0;
    let ret = WSAIoctl(
        socket,
        SIO_GET_EXTENSION_FUNCTION_POINTER,
        &guid as *const _ as *const core::ffi::c_void,
        size_of::<GUID>() as u32,
        &mut func as *mut _ as *mut core::ffi::c_void,
        size_of::<usize>() as u32,
        &mut bytes,
        std::ptr::null_mut(),
        None,
    );
    if ret == SOCKET_ERROR || func == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(std::mem::transmute_copy::<usize, T>(&func))
}

type AcceptExFn = unsafe extern "system" fn(
    SOCKET,
    SOCKET,
    *mut core::ffi::c_void,
    u32,
    u32,
    u32,
    *mut u32,
    *mut windows_sys::Win32::System::IO::OVERLAPPED,
) -> i32;

type ConnectExFn = unsafe extern "system" fn(
    SOCKET,
    *const SOCKADDR,
    i32,
    *mut core::ffi::c_void,
    u32,
    *mut u32,
    *mut windows_sys::Win32::System::IO::OVERLAPPED,
) -> i32;

const WSAID_ACCEPTEX: GUID =
    GUID { data1: 0xb5367df1, data2: 0xcbac, data3: 0x11cf, data4: [0x95, 0xca, 0x00, 0x80, 0x5f, 0x48, 0xa1, 0x92] };
const WSAID_CONNECTEX: GUID =
    GUID { data1: 0x25a207b9, data2: 0xddf3, data3: 0x4660, data4: [0x8e, 0xe9, 0x76, 0xe5, 0x8c, 0x74, 0x06, 0x3e] };

/// Submit one completion-backend operation (§4.2). Each call allocates and
/// leaks one `Overlapped`; the poller's `wait` reclaims it on completion.
pub fn submit(socket: RawSocket, op: Op, token: Token) -> io::Result<()> {
    let sock = socket as SOCKET;
    let mut ov = Overlapped::new(token, op);
    let ov_ptr = ov.as_ptr();

    let ret = match op {
        Op::Readv | Op::Recvmsg => {
            let mut buf = vec![0u8; 64 * 1024].into_boxed_slice();
            let mut wsabuf = WSABUF { len: buf.len() as u32, buf: buf.as_mut_ptr() };
            std::mem::forget(buf);
            let mut flags: u32 = 0;
            unsafe { WSARecv(sock, &mut wsabuf, 1, std::ptr::null_mut(), &mut flags, ov_ptr, None) }
        }
        Op::Writev | Op::Sendmsg => {
            let wsabuf = WSABUF { len: 0, buf: std::ptr::null_mut() };
            unsafe { WSASend(sock, &wsabuf, 1, std::ptr::null_mut(), 0, ov_ptr, None) }
        }
        Op::Accept => {
            let accept_ex: AcceptExFn = unsafe { get_extension_fn(sock, WSAID_ACCEPTEX)? };
            let accepted = unsafe { WSASocketW(AF_INET as i32, SOCK_STREAM, 0, std::ptr::null(), 0, WSA_FLAG_OVERLAPPED) };
            if accepted == INVALID_SOCKET {
                return Err(io::Error::last_os_error());
            }
            let mut out_buf = [0u8; 2 * (size_of::<SOCKADDR_STORAGE>() + 16)];
            let mut bytes: u32 = 0;
            let addr_len = (size_of::<SOCKADDR_STORAGE>() + 16) as u32;
            ov.accepted_fd = accepted as i64;
            unsafe {
                accept_ex(
                    sock,
                    accepted,
                    out_buf.as_mut_ptr() as *mut _,
                    0,
                    addr_len,
                    addr_len,
                    &mut bytes,
                    ov_ptr,
                )
            }
        }
        Op::Connect => {
            let connect_ex: ConnectExFn = unsafe { get_extension_fn(sock, WSAID_CONNECTEX)? };
            // The socket must already be bound before ConnectEx is valid;
            // callers bind to `0.0.0.0:0` beforehand.
            let dummy_addr: SOCKADDR = unsafe { zeroed() };
            let mut bytes: u32 = 0;
            unsafe {
                connect_ex(
                    sock,
                    &dummy_addr,
                    size_of::<SOCKADDR>() as i32,
                    std::ptr::null_mut(),
                    0,
                    &mut bytes,
                    ov_ptr,
                )
            }
        }
        Op::PollAdd | Op::Register | Op::Cancel => {
            // No direct IOCP equivalent; callers poll readiness via a
            // zero-byte WSARecv/WSASend instead (handled by the caller
            // re-submitting Readv/Writev).
            std::mem::forget(ov);
            return Ok(());
        }
    };

    if ret == SOCKET_ERROR {
        let err = unsafe { WSAGetLastError() };
        if err != WSA_IO_PENDING {
            drop(ov);
            return Err(io::Error::from_raw_os_error(err));
        }
    }
    // The completion port now owns `ov`'s lifetime; recovered in `wait`.
    std::mem::forget(ov);
    Ok(())
}
