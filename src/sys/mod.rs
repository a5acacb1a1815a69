// Copyright 2025 The sctp-channel Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::api::Association;
use crate::api::Attachment;
use crate::api::HandlerResult;
use crate::api::InitMaxStreams;
use crate::api::MessageInfo;
use crate::api::NotificationHandler;
use crate::api::OptionValue;
use crate::api::PpId;
use crate::api::SocketOption;
use crate::api::StreamId;
use crate::config::OptionTarget;
use bitflags::bitflags;
use log::warn;
use socket2::Domain;
use socket2::Protocol;
use socket2::SockAddr;
use socket2::Socket;
use socket2::Type;
use std::io;
use std::mem;
use std::mem::ManuallyDrop;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

pub(crate) mod notification;

pub(crate) const SOL_SCTP: libc::c_int = 132;

const SCTP_INITMSG: libc::c_int = 2;
const SCTP_NODELAY: libc::c_int = 3;
const SCTP_PRIMARY_ADDR: libc::c_int = 6;
const SCTP_EVENTS: libc::c_int = 11;
const SCTP_STATUS: libc::c_int = 14;
const SCTP_SOCKOPT_BINDX_ADD: libc::c_int = 100;
const SCTP_SOCKOPT_BINDX_REM: libc::c_int = 101;
const SCTP_GET_PEER_ADDRS: libc::c_int = 108;
const SCTP_GET_LOCAL_ADDRS: libc::c_int = 109;

const SCTP_SNDRCV: libc::c_int = 1;
const SCTP_UNORDERED: u16 = 1;

/// Association states from `SCTP_STATUS`. An association exists once established, and
/// keeps existing through the shutdown phases.
const SCTP_ESTABLISHED: i32 = 4;

bitflags! {
    /// Flags reported by the kernel for a received datagram.
    pub(crate) struct RecvFlags: i32 {
        const EOR = libc::MSG_EOR;
        const NOTIFICATION = 0x8000;
    }
}

/// Per-message ancillary data, matching the kernel `sctp_sndrcvinfo` layout.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub(crate) struct SndRcvInfo {
    pub stream: u16,
    pub ssn: u16,
    pub flags: u16,
    pub ppid: u32,
    pub context: u32,
    pub timetolive: u32,
    pub tsn: u32,
    pub cumtsn: u32,
    pub assoc_id: i32,
}

/// Argument for the `SCTP_EVENTS` socket option. One flag per subscribable event class.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
struct EventSubscribe {
    data_io_event: u8,
    association_event: u8,
    address_event: u8,
    send_failure_event: u8,
    peer_error_event: u8,
    shutdown_event: u8,
    partial_delivery_event: u8,
    adaptation_layer_event: u8,
    authentication_event: u8,
    sender_dry_event: u8,
}

/// `SCTP_STATUS` result. Only the fixed head is interpreted; the trailing primary path
/// info keeps the kernel's packed size without being decoded.
#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(C)]
struct StatusRaw {
    assoc_id: i32,
    state: i32,
    rwnd: u32,
    unackdata: u16,
    penddata: u16,
    instrms: u16,
    outstrms: u16,
    fragmentation_point: u32,
    primary: [u8; 152],
}

/// `SCTP_INITMSG` option payload.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
struct InitMsgRaw {
    num_ostreams: u16,
    max_instreams: u16,
    max_attempts: u16,
    max_init_timeo: u16,
}

/// `SCTP_PRIMARY_ADDR` option payload. The kernel declares this packed with 4-byte
/// alignment, which places the address at offset 4.
#[allow(dead_code)]
#[derive(Clone, Copy)]
#[repr(C, packed(4))]
struct PrimRaw {
    assoc_id: i32,
    addr: libc::sockaddr_storage,
}

/// Metadata of one received datagram.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RecvInfo {
    pub len: usize,
    pub stream_id: StreamId,
    pub ppid: PpId,
    pub unordered: bool,
}

/// A kernel one-to-one SCTP endpoint.
///
/// Wraps the operating system socket and exposes the message-oriented surface the
/// channel consumes. Notifications are subscribed at open time and delivered inline
/// during [`SctpEndpoint::receive`]. The endpoint can be closed explicitly exactly
/// once; dropping an unclosed endpoint closes the socket.
pub(crate) struct SctpEndpoint {
    sock: ManuallyDrop<Socket>,
    closed: AtomicBool,
}

impl SctpEndpoint {
    /// Opens a new endpoint and subscribes to association, address, send failure and
    /// shutdown notifications.
    pub fn open() -> io::Result<SctpEndpoint> {
        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::from(libc::IPPROTO_SCTP)))?;
        Self::subscribe_events(&sock)?;
        Ok(SctpEndpoint { sock: ManuallyDrop::new(sock), closed: AtomicBool::new(false) })
    }

    fn subscribe_events(sock: &Socket) -> io::Result<()> {
        let sub = EventSubscribe {
            data_io_event: 1,
            association_event: 1,
            address_event: 1,
            send_failure_event: 1,
            shutdown_event: 1,
            ..Default::default()
        };
        unsafe { setsockopt(sock.as_raw_fd(), SOL_SCTP, SCTP_EVENTS, sub) }
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Closes the underlying socket. Repeated calls are no-ops.
    pub fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match unsafe { libc::close(self.sock.as_raw_fd()) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.sock.set_nonblocking(nonblocking)
    }

    pub fn bind(&self, addr: SocketAddr) -> io::Result<()> {
        self.sock.bind(&SockAddr::from(addr))
    }

    /// Adds a secondary local address to the endpoint.
    ///
    /// The address inherits the port of the primary binding, so the endpoint must
    /// already be bound.
    pub fn bind_address(&self, addr: IpAddr) -> io::Result<()> {
        self.bindx(addr, SCTP_SOCKOPT_BINDX_ADD)
    }

    /// Removes a secondary local address from the endpoint.
    pub fn unbind_address(&self, addr: IpAddr) -> io::Result<()> {
        self.bindx(addr, SCTP_SOCKOPT_BINDX_REM)
    }

    fn bindx(&self, addr: IpAddr, op: libc::c_int) -> io::Result<()> {
        let port = self
            .local_addrs()?
            .first()
            .map(|a| a.port())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "socket is not bound"))?;
        let packed = pack_sockaddrs(&[SocketAddr::new(addr, port)]);
        match unsafe {
            libc::setsockopt(
                self.sock.as_raw_fd(),
                SOL_SCTP,
                op,
                packed.as_ptr() as *const libc::c_void,
                packed.len() as libc::socklen_t,
            )
        } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        }
    }

    /// Initiates a connection. On a non-blocking endpoint a pending connect reports
    /// success here and completes via [`SctpEndpoint::finish_connect`].
    pub fn connect(&self, addr: SocketAddr) -> io::Result<()> {
        match self.sock.connect(&SockAddr::from(addr)) {
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
            other => other,
        }
    }

    /// Completes a pending non-blocking connect by collecting `SO_ERROR`.
    pub fn finish_connect(&self) -> io::Result<()> {
        match self.sock.take_error()? {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Marks the endpoint as passive. Server-side surface, exercised by the loopback
    /// tests.
    #[allow(dead_code)]
    pub fn listen(&self, backlog: i32) -> io::Result<()> {
        self.sock.listen(backlog)
    }

    #[allow(dead_code)]
    pub fn accept(&self) -> io::Result<(SctpEndpoint, SocketAddr)> {
        let (sock, addr) = self.sock.accept()?;
        let addr = addr
            .as_socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address is not valid"))?;
        Ok((SctpEndpoint { sock: ManuallyDrop::new(sock), closed: AtomicBool::new(false) }, addr))
    }

    /// Receives one datagram into `buf`.
    ///
    /// Notifications arriving ahead of data are parsed and dispatched to `handler`
    /// inline, on the calling thread. Receiving continues while the handler returns
    /// [`HandlerResult::Continue`] and stops on [`HandlerResult::Return`]. Returns
    /// `None` when no message is available, when the peer has shut down the
    /// association, or when the handler stopped the receive.
    pub fn receive(
        &self,
        buf: &mut [u8],
        attachment: Option<Attachment>,
        handler: &dyn NotificationHandler,
    ) -> io::Result<Option<RecvInfo>> {
        loop {
            let (len, flags, info) = match self.recvmsg(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                other => other?,
            };

            if flags.contains(RecvFlags::NOTIFICATION) {
                match notification::parse_notification(&buf[..len]) {
                    Ok(Some(n)) => {
                        if handler.handle_notification(n, attachment.clone()) == HandlerResult::Return {
                            return Ok(None);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Discarding malformed sctp notification: {}", e),
                }
                continue;
            }

            if len == 0 {
                // Orderly shutdown of the association.
                return Ok(None);
            }

            let info = info.unwrap_or_default();
            return Ok(Some(RecvInfo {
                len,
                stream_id: StreamId(info.stream),
                ppid: PpId(info.ppid),
                unordered: info.flags & SCTP_UNORDERED != 0,
            }));
        }
    }

    fn recvmsg(&self, buf: &mut [u8]) -> io::Result<(usize, RecvFlags, Option<SndRcvInfo>)> {
        let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut libc::c_void, iov_len: buf.len() };
        let mut control = [0u8; 256];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        let n = loop {
            match unsafe { libc::recvmsg(self.sock.as_raw_fd(), &mut msg, 0) } {
                -1 => {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    return Err(e);
                }
                n => break n as usize,
            }
        };

        let flags = RecvFlags::from_bits_truncate(msg.msg_flags);
        let mut info = None;
        unsafe {
            let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
            while !cmsg.is_null() {
                if (*cmsg).cmsg_level == libc::IPPROTO_SCTP && (*cmsg).cmsg_type == SCTP_SNDRCV {
                    info = Some(ptr::read_unaligned(libc::CMSG_DATA(cmsg) as *const SndRcvInfo));
                }
                cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
            }
        }
        Ok((n, flags, info))
    }

    /// Sends one datagram carrying the metadata in `info`.
    ///
    /// The kernel treats the payload as a whole message; the returned byte count
    /// matching the payload length is the caller's all-or-nothing check.
    pub fn send(&self, buf: &[u8], info: &MessageInfo) -> io::Result<usize> {
        let mut sndinfo = SndRcvInfo {
            stream: info.stream_id.0,
            ppid: info.ppid.0,
            ..Default::default()
        };
        if info.unordered {
            sndinfo.flags |= SCTP_UNORDERED;
        }

        let dest = info.address.map(SockAddr::from);
        let mut iov = libc::iovec { iov_base: buf.as_ptr() as *mut libc::c_void, iov_len: buf.len() };
        let space = unsafe { libc::CMSG_SPACE(mem::size_of::<SndRcvInfo>() as u32) } as usize;
        let mut control = vec![0u8; space];

        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        if let Some(dest) = dest.as_ref() {
            msg.msg_name = dest.as_ptr() as *mut libc::c_void;
            msg.msg_namelen = dest.len();
        }
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = control.len() as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::IPPROTO_SCTP;
            (*cmsg).cmsg_type = SCTP_SNDRCV;
            (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<SndRcvInfo>() as u32) as _;
            ptr::write_unaligned(libc::CMSG_DATA(cmsg) as *mut SndRcvInfo, sndinfo);
        }

        loop {
            match unsafe { libc::sendmsg(self.sock.as_raw_fd(), &msg, 0) } {
                -1 => {
                    let e = io::Error::last_os_error();
                    if e.raw_os_error() == Some(libc::EINTR) {
                        continue;
                    }
                    return Err(e);
                }
                n => return Ok(n as usize),
            }
        }
    }

    /// Returns the current association, or `None` when no association exists.
    pub fn association(&self) -> io::Result<Option<Association>> {
        let status = match unsafe {
            getsockopt::<StatusRaw>(self.sock.as_raw_fd(), SOL_SCTP, SCTP_STATUS)
        } {
            Err(e)
                if e.raw_os_error() == Some(libc::EINVAL)
                    || e.raw_os_error() == Some(libc::ENOTCONN) =>
            {
                return Ok(None)
            }
            other => other?,
        };
        if status.state < SCTP_ESTABLISHED {
            return Ok(None);
        }
        Ok(Some(Association {
            id: status.assoc_id,
            inbound_streams: status.instrms,
            outbound_streams: status.outstrms,
            peer_rwnd: status.rwnd,
        }))
    }

    /// Enumerates all local addresses the endpoint is bound to.
    pub fn local_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.getaddrs(SCTP_GET_LOCAL_ADDRS)
    }

    /// Enumerates all peer addresses of the current association.
    pub fn remote_addrs(&self) -> io::Result<Vec<SocketAddr>> {
        self.getaddrs(SCTP_GET_PEER_ADDRS)
    }

    fn getaddrs(&self, opt: libc::c_int) -> io::Result<Vec<SocketAddr>> {
        // Header is { assoc_id: i32, addr_num: u32 } followed by packed sockaddrs.
        let mut buf = vec![0u8; 4096];
        let mut len = buf.len() as libc::socklen_t;
        match unsafe {
            libc::getsockopt(
                self.sock.as_raw_fd(),
                SOL_SCTP,
                opt,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        } {
            -1 => return Err(io::Error::last_os_error()),
            _ => {}
        }

        let addr_num = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let mut addrs = Vec::with_capacity(addr_num);
        let mut offset = 8;
        for _ in 0..addr_num {
            let (addr, used) = unpack_sockaddr(&buf[offset..len as usize])
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "malformed address list"))?;
            addrs.push(addr);
            offset += used;
        }
        Ok(addrs)
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        unsafe { setsockopt(self.sock.as_raw_fd(), SOL_SCTP, SCTP_NODELAY, nodelay as libc::c_int) }
    }

    pub fn nodelay(&self) -> io::Result<bool> {
        unsafe {
            getsockopt::<libc::c_int>(self.sock.as_raw_fd(), SOL_SCTP, SCTP_NODELAY).map(|v| v != 0)
        }
    }

    pub fn set_init_maxstreams(&self, init: InitMaxStreams) -> io::Result<()> {
        let raw = InitMsgRaw {
            num_ostreams: init.max_out_streams,
            max_instreams: init.max_in_streams,
            ..Default::default()
        };
        unsafe { setsockopt(self.sock.as_raw_fd(), SOL_SCTP, SCTP_INITMSG, raw) }
    }

    pub fn init_maxstreams(&self) -> io::Result<InitMaxStreams> {
        let raw = unsafe { getsockopt::<InitMsgRaw>(self.sock.as_raw_fd(), SOL_SCTP, SCTP_INITMSG)? };
        Ok(InitMaxStreams { max_out_streams: raw.num_ostreams, max_in_streams: raw.max_instreams })
    }

    pub fn set_primary_address(&self, addr: SocketAddr) -> io::Result<()> {
        let sockaddr = SockAddr::from(addr);
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        unsafe {
            ptr::copy_nonoverlapping(
                sockaddr.as_ptr() as *const u8,
                &mut storage as *mut libc::sockaddr_storage as *mut u8,
                sockaddr.len() as usize,
            );
        }
        let prim = PrimRaw { assoc_id: 0, addr: storage };
        unsafe { setsockopt(self.sock.as_raw_fd(), SOL_SCTP, SCTP_PRIMARY_ADDR, prim) }
    }

    pub fn primary_address(&self) -> io::Result<SocketAddr> {
        let prim = unsafe { getsockopt::<PrimRaw>(self.sock.as_raw_fd(), SOL_SCTP, SCTP_PRIMARY_ADDR)? };
        let storage = prim.addr;
        sockaddr_storage_to_addr(&storage)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "address is not valid"))
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        self.sock.set_recv_buffer_size(size)
    }

    pub fn recv_buffer_size(&self) -> io::Result<usize> {
        self.sock.recv_buffer_size()
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        self.sock.set_send_buffer_size(size)
    }

    pub fn send_buffer_size(&self) -> io::Result<usize> {
        self.sock.send_buffer_size()
    }

    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        self.sock.set_reuse_address(reuse)
    }

    pub fn reuse_address(&self) -> io::Result<bool> {
        self.sock.reuse_address()
    }

    pub fn set_linger(&self, linger: Option<std::time::Duration>) -> io::Result<()> {
        self.sock.set_linger(linger)
    }

    pub fn linger(&self) -> io::Result<Option<std::time::Duration>> {
        self.sock.linger()
    }
}

impl AsRawFd for SctpEndpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }
}

impl Drop for SctpEndpoint {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            unsafe { ManuallyDrop::drop(&mut self.sock) };
        }
    }
}

impl OptionTarget for SctpEndpoint {
    fn apply(&self, option: SocketOption, value: &OptionValue) -> io::Result<()> {
        match (option, value) {
            (SocketOption::SoRcvbuf, OptionValue::Int(v)) => self.set_recv_buffer_size(*v as usize),
            (SocketOption::SoSndbuf, OptionValue::Int(v)) => self.set_send_buffer_size(*v as usize),
            (SocketOption::SoReuseaddr, OptionValue::Bool(v)) => self.set_reuse_address(*v),
            (SocketOption::SoLinger, OptionValue::Linger(v)) => self.set_linger(*v),
            (SocketOption::SctpNodelay, OptionValue::Bool(v)) => self.set_nodelay(*v),
            (SocketOption::SctpInitMaxstreams, OptionValue::InitMaxStreams(v)) => {
                self.set_init_maxstreams(*v)
            }
            (SocketOption::SctpPrimaryAddr, OptionValue::Addr(v)) => self.set_primary_address(*v),
            _ => Err(io::Error::new(io::ErrorKind::Unsupported, "option is not kernel-backed")),
        }
    }

    fn read(&self, option: SocketOption) -> io::Result<OptionValue> {
        match option {
            SocketOption::SoRcvbuf => self.recv_buffer_size().map(|v| OptionValue::Int(v as i32)),
            SocketOption::SoSndbuf => self.send_buffer_size().map(|v| OptionValue::Int(v as i32)),
            SocketOption::SoReuseaddr => self.reuse_address().map(OptionValue::Bool),
            SocketOption::SoLinger => self.linger().map(OptionValue::Linger),
            SocketOption::SctpNodelay => self.nodelay().map(OptionValue::Bool),
            SocketOption::SctpInitMaxstreams => {
                self.init_maxstreams().map(OptionValue::InitMaxStreams)
            }
            SocketOption::SctpPrimaryAddr => match self.primary_address() {
                Ok(addr) => Ok(OptionValue::Addr(addr)),
                // No association yet.
                Err(_) => Ok(OptionValue::Addr(SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    0,
                ))),
            },
            _ => Err(io::Error::new(io::ErrorKind::Unsupported, "option is not kernel-backed")),
        }
    }
}

/// Packs socket addresses back to back, the layout `sctp_bindx` expects.
fn pack_sockaddrs(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::new();
    for addr in addrs {
        let sockaddr = SockAddr::from(*addr);
        let bytes = unsafe {
            std::slice::from_raw_parts(sockaddr.as_ptr() as *const u8, sockaddr.len() as usize)
        };
        out.extend_from_slice(bytes);
    }
    out
}

/// Reads one packed sockaddr from `bytes`, returning the address and its encoded size.
fn unpack_sockaddr(bytes: &[u8]) -> Option<(SocketAddr, usize)> {
    if bytes.len() < 2 {
        return None;
    }
    let family = u16::from_ne_bytes([bytes[0], bytes[1]]);
    let size = match family as libc::c_int {
        libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
        _ => return None,
    };
    if bytes.len() < size {
        return None;
    }
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    unsafe {
        ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            &mut storage as *mut libc::sockaddr_storage as *mut u8,
            size,
        );
    }
    sockaddr_storage_to_addr(&storage).map(|addr| (addr, size))
}

pub(crate) fn sockaddr_storage_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    let len = match storage.ss_family as libc::c_int {
        libc::AF_INET => mem::size_of::<libc::sockaddr_in>(),
        libc::AF_INET6 => mem::size_of::<libc::sockaddr_in6>(),
        _ => return None,
    };
    let sockaddr = unsafe { SockAddr::new(*storage, len as libc::socklen_t) };
    sockaddr.as_socket()
}

/// Caller must ensure `T` is the payload type the kernel expects for `opt`.
unsafe fn setsockopt<T>(fd: libc::c_int, level: libc::c_int, opt: libc::c_int, payload: T) -> io::Result<()> {
    match libc::setsockopt(
        fd,
        level,
        opt,
        &payload as *const T as *const libc::c_void,
        mem::size_of::<T>() as libc::socklen_t,
    ) {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(()),
    }
}

/// Caller must ensure `T` is the payload type the kernel expects for `opt`.
unsafe fn getsockopt<T>(fd: libc::c_int, level: libc::c_int, opt: libc::c_int) -> io::Result<T> {
    let mut payload = mem::MaybeUninit::<T>::uninit();
    let mut len = mem::size_of::<T>() as libc::socklen_t;
    match libc::getsockopt(fd, level, opt, payload.as_mut_ptr().cast(), &mut len) {
        -1 => Err(io::Error::last_os_error()),
        _ => Ok(payload.assume_init()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_and_unpack_round_trip() {
        let addr: SocketAddr = "127.0.0.1:9899".parse().unwrap();
        let packed = pack_sockaddrs(&[addr]);
        assert_eq!(packed.len(), mem::size_of::<libc::sockaddr_in>());
        let (parsed, used) = unpack_sockaddr(&packed).unwrap();
        assert_eq!(parsed, addr);
        assert_eq!(used, packed.len());
    }

    #[test]
    fn unpack_rejects_unknown_family() {
        let bytes = [0xffu8; 32];
        assert!(unpack_sockaddr(&bytes).is_none());
    }

    #[test]
    fn sndrcvinfo_matches_kernel_size() {
        assert_eq!(mem::size_of::<SndRcvInfo>(), 32);
    }

    #[test]
    fn prim_places_address_at_packed_offset() {
        assert_eq!(mem::offset_of!(PrimRaw, addr), 4);
    }
}
