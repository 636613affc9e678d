// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use socket2::{Domain, MaybeUninitSlice, Protocol, SockAddr, Socket, Type};
use tracing::{Level, event};

use crate::buf::Transfer;
use crate::drivers::{Native, retry};
use crate::pal::RawSource;
use crate::stream::with_default_access;
use crate::{Error, ErrorCode, IoFlags, OptionId, OptionValue, Result, Stream, StreamFlags, StreamKind, StreamOps};

/// Pending connections a listening socket queues before refusing more.
pub const LISTEN_BACKLOG: i32 = 128;

type RawFlags = i32;

pub(crate) struct SocketDriver {
    socket: Option<Socket>,
    datagram: bool,
    server: bool,
    peer: Option<SockAddr>,
}

impl SocketDriver {
    fn open(kind: StreamKind, addr: SocketAddr, flags: StreamFlags) -> Result<Self> {
        let datagram = match kind {
            StreamKind::Socket => false,
            StreamKind::Datagram => true,
            _ => return Err(Error::invalid_argument()),
        };
        let server = flags.contains(StreamFlags::SERVER);
        let socket = new_socket(addr, datagram, flags.nonblocking())?;

        let mut peer = None;
        if server {
            socket.set_reuse_address(true)?;
            socket.bind(&addr.into())?;
            if !datagram {
                socket.listen(LISTEN_BACKLOG)?;
            }
        } else if datagram {
            socket.bind(&unspecified_like(addr).into())?;
            peer = Some(addr.into());
        } else {
            match socket.connect(&addr.into()) {
                Ok(()) => {}
                Err(error) if connect_in_progress(&error) => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(Self {
            socket: Some(socket),
            datagram,
            server,
            peer,
        })
    }

    fn adopt(socket: Socket, datagram: bool) -> Self {
        Self {
            socket: Some(socket),
            datagram,
            server: false,
            peer: None,
        }
    }

    fn socket(&self) -> Result<&Socket> {
        self.socket.as_ref().ok_or(Error::Code(ErrorCode::BadHandle))
    }

    fn accept(&self, nonblocking: bool) -> Result<(Socket, SockAddr)> {
        if self.datagram || !self.server {
            return Err(ErrorCode::InvalidState.into());
        }

        let listener = self.socket()?;
        let (socket, addr) = retry(|| listener.accept())?;
        socket.set_nonblocking(nonblocking)?;
        #[cfg(any(target_os = "macos", target_os = "ios"))]
        socket.set_nosigpipe(true)?;

        Ok((socket, addr))
    }

    fn recv_from(&mut self, buf: &mut [u8], flags: RawFlags) -> Result<(usize, SockAddr)> {
        let socket = self.socket()?;
        let (count, from) = retry(|| socket.recv_from_with_flags(as_uninit(buf), flags))?;
        if self.datagram && self.server {
            self.peer = Some(from.clone());
        }
        Ok((count, from))
    }

    fn send_to(&self, buf: &[u8], addr: &SockAddr, flags: RawFlags) -> Result<usize> {
        let socket = self.socket()?;
        Ok(retry(|| socket.send_to_with_flags(buf, addr, flags | no_signal()))?)
    }

    fn peer(&self) -> Result<SockAddr> {
        if self.datagram {
            return self.peer.clone().ok_or(Error::Code(ErrorCode::NotConnected));
        }
        Ok(self.socket()?.peer_addr()?)
    }

    fn local(&self) -> Result<SockAddr> {
        Ok(self.socket()?.local_addr()?)
    }
}

impl StreamOps for SocketDriver {
    fn read(&mut self, buf: &mut [u8], flags: IoFlags) -> Result<usize> {
        let flags = message_flags(flags);
        if self.datagram {
            return self.recv_from(buf, flags).map(|(count, _)| count);
        }

        let socket = self.socket()?;
        Ok(retry(|| socket.recv_with_flags(as_uninit(buf), flags))?)
    }

    fn write(&mut self, buf: &[u8], flags: IoFlags) -> Result<usize> {
        let flags = message_flags(flags);
        if self.datagram {
            let peer = self.peer()?;
            return self.send_to(buf, &peer, flags);
        }

        let socket = self.socket()?;
        Ok(retry(|| socket.send_with_flags(buf, flags | no_signal()))?)
    }

    fn has_vectored(&self) -> bool {
        true
    }

    fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>], flags: IoFlags) -> Result<usize> {
        if self.datagram {
            // One datagram lands in one scratch buffer and is scattered afterwards.
            let mut scratch = vec![0_u8; bufs.iter().map(|buf| buf.len()).sum()];
            let count = self.read(&mut scratch, flags)?;
            let mut remaining = &scratch[..count];
            for buf in bufs.iter_mut() {
                let take = remaining.len().min(buf.len());
                buf[..take].copy_from_slice(&remaining[..take]);
                remaining = &remaining[take..];
            }
            return Ok(count);
        }

        let flags = message_flags(flags);
        let socket = self.socket()?;
        let mut slices: Vec<MaybeUninitSlice<'_>> = bufs
            .iter_mut()
            .map(|buf| MaybeUninitSlice::new(as_uninit(buf)))
            .collect();

        let (count, _) = retry(|| socket.recv_vectored_with_flags(&mut slices, flags))?;
        Ok(count)
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>], flags: IoFlags) -> Result<usize> {
        if self.datagram {
            let gathered = bufs.iter().flat_map(|buf| buf.iter().copied()).collect::<Vec<u8>>();
            return self.write(&gathered, flags);
        }

        let flags = message_flags(flags);
        let socket = self.socket()?;
        Ok(retry(|| socket.send_vectored_with_flags(bufs, flags | no_signal()))?)
    }

    fn get_option(&mut self, id: OptionId) -> Result<OptionValue> {
        let socket = self.socket()?;

        let value = match id {
            OptionId::TCP_NODELAY => OptionValue::Bool(socket.nodelay()?),
            OptionId::SO_KEEPALIVE => OptionValue::Bool(socket.keepalive()?),
            OptionId::SO_REUSEADDR => OptionValue::Bool(socket.reuse_address()?),
            OptionId::SO_BROADCAST => OptionValue::Bool(socket.broadcast()?),
            OptionId::SO_RCVBUF => socket.recv_buffer_size()?.into(),
            OptionId::SO_SNDBUF => socket.send_buffer_size()?.into(),
            OptionId::SO_LINGER => OptionValue::Duration(socket.linger()?),
            OptionId::SO_OOBINLINE => OptionValue::Bool(socket.out_of_band_inline()?),
            OptionId::SO_DONTROUTE => OptionValue::Bool(raw::get(socket, raw::DONTROUTE)? != 0),
            OptionId::SO_RCVTIMEO => OptionValue::Duration(socket.read_timeout()?),
            OptionId::SO_SNDTIMEO => OptionValue::Duration(socket.write_timeout()?),
            OptionId::SO_RCVLOWAT => OptionValue::Int(raw::get(socket, raw::RCVLOWAT)?.into()),
            OptionId::SO_SNDLOWAT => OptionValue::Int(raw::get(socket, raw::SNDLOWAT)?.into()),
            OptionId::SOCKET_ERROR => {
                OptionValue::Int(socket.take_error()?.and_then(|error| error.raw_os_error()).unwrap_or(0).into())
            }
            OptionId::LOCAL_ADDR => OptionValue::Addr(to_socket_addr(&self.local()?)?),
            OptionId::LOCAL_PORT => OptionValue::Int(to_socket_addr(&self.local()?)?.port().into()),
            OptionId::PEER_ADDR => OptionValue::Addr(to_socket_addr(&self.peer()?)?),
            OptionId::PEER_PORT => OptionValue::Int(to_socket_addr(&self.peer()?)?.port().into()),
            _ => return Err(Error::unsupported()),
        };

        Ok(value)
    }

    fn set_option(&mut self, id: OptionId, value: &OptionValue) -> Result<()> {
        let socket = self.socket()?;

        match id {
            OptionId::BLOCKING => socket.set_nonblocking(!value.as_bool()?)?,
            OptionId::TCP_NODELAY => socket.set_nodelay(value.as_bool()?)?,
            OptionId::SO_KEEPALIVE => socket.set_keepalive(value.as_bool()?)?,
            OptionId::SO_REUSEADDR => socket.set_reuse_address(value.as_bool()?)?,
            OptionId::SO_BROADCAST => socket.set_broadcast(value.as_bool()?)?,
            OptionId::SO_RCVBUF => socket.set_recv_buffer_size(value.as_usize()?)?,
            OptionId::SO_SNDBUF => socket.set_send_buffer_size(value.as_usize()?)?,
            OptionId::SO_LINGER => socket.set_linger(value.as_duration()?)?,
            OptionId::SO_OOBINLINE => socket.set_out_of_band_inline(value.as_bool()?)?,
            OptionId::SO_DONTROUTE => raw::set(socket, raw::DONTROUTE, i32::from(value.as_bool()?))?,
            OptionId::SO_RCVTIMEO => socket.set_read_timeout(value.as_duration()?)?,
            OptionId::SO_SNDTIMEO => socket.set_write_timeout(value.as_duration()?)?,
            OptionId::SO_RCVLOWAT => raw::set(socket, raw::RCVLOWAT, to_raw_int(value)?)?,
            OptionId::SO_SNDLOWAT => raw::set(socket, raw::SNDLOWAT, to_raw_int(value)?)?,
            _ => return Err(Error::unsupported()),
        }

        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        drop(self.socket.take());
        Ok(())
    }

    fn raw_source(&self) -> Option<RawSource> {
        let socket = self.socket.as_ref()?;

        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            Some(RawSource::Fd(socket.as_raw_fd()))
        }
        #[cfg(windows)]
        {
            use std::os::windows::io::AsRawSocket;
            Some(RawSource::Socket(socket.as_raw_socket()))
        }
    }

    fn forget_handle(&mut self) {
        if let Some(socket) = self.socket.take() {
            #[cfg(unix)]
            {
                use std::os::fd::IntoRawFd;
                let _fd = socket.into_raw_fd();
            }
            #[cfg(windows)]
            {
                use std::os::windows::io::IntoRawSocket;
                let _socket = socket.into_raw_socket();
            }
        }
    }
}

fn new_socket(addr: SocketAddr, datagram: bool, nonblocking: bool) -> io::Result<Socket> {
    let (ty, protocol) = if datagram {
        (Type::DGRAM, Protocol::UDP)
    } else {
        (Type::STREAM, Protocol::TCP)
    };

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
    let socket = {
        let ty = if nonblocking { ty.nonblocking() } else { ty };
        Socket::new(Domain::for_address(addr), ty, Some(protocol))?
    };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
    let socket = {
        let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;
        socket.set_nonblocking(nonblocking)?;
        socket
    };

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    socket.set_nosigpipe(true)?;

    Ok(socket)
}

fn connect_in_progress(error: &io::Error) -> bool {
    #[cfg(unix)]
    if error.raw_os_error() == Some(libc::EINPROGRESS) {
        return true;
    }

    error.kind() == io::ErrorKind::WouldBlock
}

fn unspecified_like(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(_) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    }
}

fn to_socket_addr(addr: &SockAddr) -> Result<SocketAddr> {
    addr.as_socket().ok_or(Error::Code(ErrorCode::AddressNotAvailable))
}

fn to_raw_int(value: &OptionValue) -> Result<i32> {
    i32::try_from(value.as_int()?).map_err(|_overflow| Error::invalid_argument())
}

/// Views an initialized buffer as possibly uninitialized memory for the receive calls.
fn as_uninit(buf: &mut [u8]) -> &mut [MaybeUninit<u8>] {
    // SAFETY: `MaybeUninit<u8>` has the layout of `u8`, and the receive calls only ever write
    // initialized bytes into the buffer.
    unsafe { &mut *(std::ptr::from_mut::<[u8]>(buf) as *mut [MaybeUninit<u8>]) }
}

/// Translates per-call message bits. Bits the platform lacks are ignored.
fn message_flags(flags: IoFlags) -> RawFlags {
    let mut raw = 0;

    #[cfg(unix)]
    {
        let table = [
            (IoFlags::DONTROUTE, libc::MSG_DONTROUTE),
            (IoFlags::DONTWAIT, libc::MSG_DONTWAIT),
            (IoFlags::EOR, libc::MSG_EOR),
            (IoFlags::OOB, libc::MSG_OOB),
        ];
        for (flag, bit) in table {
            if flags.contains(flag) {
                raw |= bit;
            }
        }

        #[cfg(target_os = "linux")]
        for (flag, bit) in [
            (IoFlags::CONFIRM, libc::MSG_CONFIRM),
            (IoFlags::MORE, libc::MSG_MORE),
            (IoFlags::FASTOPEN, libc::MSG_FASTOPEN),
        ] {
            if flags.contains(flag) {
                raw |= bit;
            }
        }
    }

    #[cfg(windows)]
    {
        use windows_sys::Win32::Networking::WinSock::{MSG_DONTROUTE, MSG_OOB};

        if flags.contains(IoFlags::DONTROUTE) {
            raw |= MSG_DONTROUTE;
        }
        if flags.contains(IoFlags::OOB) {
            raw |= MSG_OOB;
        }
    }

    raw
}

/// The bit that keeps a send on a disconnected socket from raising `SIGPIPE`.
fn no_signal() -> RawFlags {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd"))]
    {
        libc::MSG_NOSIGNAL
    }
    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd")))]
    {
        0
    }
}

/// Integer socket options the socket library does not cover.
mod raw {
    use std::io;

    use socket2::Socket;

    pub(super) struct RawOption {
        level: i32,
        name: i32,
    }

    #[cfg(unix)]
    pub(super) const DONTROUTE: RawOption = RawOption {
        level: libc::SOL_SOCKET,
        name: libc::SO_DONTROUTE,
    };
    #[cfg(unix)]
    pub(super) const RCVLOWAT: RawOption = RawOption {
        level: libc::SOL_SOCKET,
        name: libc::SO_RCVLOWAT,
    };
    #[cfg(unix)]
    pub(super) const SNDLOWAT: RawOption = RawOption {
        level: libc::SOL_SOCKET,
        name: libc::SO_SNDLOWAT,
    };

    #[cfg(windows)]
    pub(super) const DONTROUTE: RawOption = RawOption {
        level: windows_sys::Win32::Networking::WinSock::SOL_SOCKET,
        name: windows_sys::Win32::Networking::WinSock::SO_DONTROUTE,
    };
    #[cfg(windows)]
    pub(super) const RCVLOWAT: RawOption = RawOption {
        level: windows_sys::Win32::Networking::WinSock::SOL_SOCKET,
        name: windows_sys::Win32::Networking::WinSock::SO_RCVLOWAT,
    };
    #[cfg(windows)]
    pub(super) const SNDLOWAT: RawOption = RawOption {
        level: windows_sys::Win32::Networking::WinSock::SOL_SOCKET,
        name: windows_sys::Win32::Networking::WinSock::SO_SNDLOWAT,
    };

    #[cfg(unix)]
    #[expect(clippy::cast_possible_truncation, reason = "the size of an int always fits")]
    const INT_LEN: libc::socklen_t = size_of::<libc::c_int>() as libc::socklen_t;

    #[cfg(unix)]
    pub(super) fn get(socket: &Socket, option: RawOption) -> io::Result<i32> {
        use std::os::fd::AsRawFd;

        let mut value: libc::c_int = 0;
        let mut len = INT_LEN;

        // SAFETY: `value` and `len` are valid for writes and describe an int-sized buffer.
        let ret = unsafe {
            libc::getsockopt(
                socket.as_raw_fd(),
                option.level,
                option.name,
                (&raw mut value).cast(),
                &raw mut len,
            )
        };
        crate::pal::unix::check(ret)?;
        Ok(value)
    }

    #[cfg(unix)]
    pub(super) fn set(socket: &Socket, option: RawOption, value: i32) -> io::Result<()> {
        use std::os::fd::AsRawFd;

        // SAFETY: `value` is valid for reads of `INT_LEN` bytes.
        let ret = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                option.level,
                option.name,
                (&raw const value).cast(),
                INT_LEN,
            )
        };
        crate::pal::unix::check(ret)?;
        Ok(())
    }

    #[cfg(windows)]
    pub(super) fn get(socket: &Socket, option: RawOption) -> io::Result<i32> {
        use std::os::windows::io::AsRawSocket;

        use windows_sys::Win32::Networking::WinSock::{SOCKET, SOCKET_ERROR, getsockopt};

        let mut value: i32 = 0;
        let mut len = 4_i32;

        // SAFETY: `value` and `len` are valid for writes and describe an int-sized buffer.
        let ret = unsafe {
            getsockopt(
                socket.as_raw_socket() as SOCKET,
                option.level,
                option.name,
                (&raw mut value).cast(),
                &raw mut len,
            )
        };
        if ret == SOCKET_ERROR { Err(io::Error::last_os_error()) } else { Ok(value) }
    }

    #[cfg(windows)]
    pub(super) fn set(socket: &Socket, option: RawOption, value: i32) -> io::Result<()> {
        use std::os::windows::io::AsRawSocket;

        use windows_sys::Win32::Networking::WinSock::{SOCKET, SOCKET_ERROR, setsockopt};

        // SAFETY: `value` is valid for reads of four bytes.
        let ret = unsafe {
            setsockopt(
                socket.as_raw_socket() as SOCKET,
                option.level,
                option.name,
                (&raw const value).cast(),
                4,
            )
        };
        if ret == SOCKET_ERROR { Err(io::Error::last_os_error()) } else { Ok(()) }
    }
}

impl Stream {
    /// Opens a stream or datagram socket for `addr`.
    ///
    /// With [`StreamFlags::SERVER`] the socket is bound to `addr` (with address reuse enabled)
    /// and, for stream sockets, listens with a backlog of [`LISTEN_BACKLOG`]. Otherwise a stream
    /// socket connects to `addr`; a non-blocking connect that is still in progress counts as
    /// success and completes once the socket becomes writable. A datagram client binds an
    /// ephemeral local address and sends every write to `addr`.
    ///
    /// Without access bits the socket is opened for both directions.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidArgument`] unless `kind` is [`StreamKind::Socket`] or
    /// [`StreamKind::Datagram`]; otherwise the failure reported by the operating system, such as
    /// [`ErrorCode::ConnectionRefused`] or [`ErrorCode::AddressInUse`].
    pub fn open_socket(kind: StreamKind, addr: SocketAddr, flags: StreamFlags) -> Result<Self> {
        let flags = with_default_access(flags, StreamFlags::RDWR);
        let driver = SocketDriver::open(kind, addr, flags)?;

        Ok(Self::from_native(kind, flags, Native::Socket(driver)))
    }

    /// Binds a listening TCP socket.
    ///
    /// # Errors
    ///
    /// As for [`open_socket()`][Self::open_socket].
    pub fn tcp_listen(addr: SocketAddr, flags: StreamFlags) -> Result<Self> {
        Self::open_socket(StreamKind::Socket, addr, flags | StreamFlags::SERVER)
    }

    /// Connects a TCP socket.
    ///
    /// # Errors
    ///
    /// As for [`open_socket()`][Self::open_socket].
    pub fn tcp_connect(addr: SocketAddr, flags: StreamFlags) -> Result<Self> {
        Self::open_socket(StreamKind::Socket, addr, flags - StreamFlags::SERVER)
    }

    /// Binds a UDP socket that answers whoever sent the last datagram.
    ///
    /// # Errors
    ///
    /// As for [`open_socket()`][Self::open_socket].
    pub fn udp_bind(addr: SocketAddr, flags: StreamFlags) -> Result<Self> {
        Self::open_socket(StreamKind::Datagram, addr, flags | StreamFlags::SERVER)
    }

    /// Opens a UDP socket whose writes go to `addr`.
    ///
    /// # Errors
    ///
    /// As for [`open_socket()`][Self::open_socket].
    pub fn udp_connect(addr: SocketAddr, flags: StreamFlags) -> Result<Self> {
        Self::open_socket(StreamKind::Datagram, addr, flags - StreamFlags::SERVER)
    }

    pub(crate) fn from_socket(socket: Socket, kind: StreamKind, flags: StreamFlags) -> Self {
        let driver = SocketDriver::adopt(socket, kind == StreamKind::Datagram);
        Self::from_native(kind, with_default_access(flags, StreamFlags::RDWR), Native::Socket(driver))
    }

    /// Accepts a pending connection on a listening socket.
    ///
    /// The new stream inherits the listener's flags except [`StreamFlags::SERVER`].
    ///
    /// # Errors
    ///
    /// [`ErrorCode::WouldBlock`] on a non-blocking listener without pending connections,
    /// [`ErrorCode::InvalidState`] if the socket is not listening, [`ErrorCode::Unsupported`]
    /// for other kinds.
    pub fn accept(&mut self) -> Result<(Self, SocketAddr)> {
        let flags = self.flags();
        let (socket, addr) = self.socket_driver()?.accept(flags.nonblocking())?;
        let peer = to_socket_addr(&addr)?;

        let stream = Self::from_native(
            StreamKind::Socket,
            flags - StreamFlags::SERVER,
            Native::Socket(SocketDriver::adopt(socket, false)),
        );
        event!(Level::DEBUG, message = "accepted connection", listener = %self.id(), id = %stream.id(), peer = %peer);

        Ok((stream, peer))
    }

    /// Receives once and reports the sender.
    ///
    /// # Errors
    ///
    /// As for [`read()`][Self::read]; [`ErrorCode::Unsupported`] for kinds that are not sockets.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(Transfer, SocketAddr)> {
        let requested = buf.len();
        let (count, from) = self.socket_driver_mut()?.recv_from(buf, 0)?;

        Ok((Transfer::new(count, requested), to_socket_addr(&from)?))
    }

    /// Sends once to `addr`.
    ///
    /// # Errors
    ///
    /// As for [`write()`][Self::write]; [`ErrorCode::Unsupported`] for kinds that are not
    /// sockets.
    pub fn send_to(&mut self, buf: &[u8], addr: SocketAddr) -> Result<Transfer> {
        let count = self.socket_driver()?.send_to(buf, &addr.into(), 0)?;
        Ok(Transfer::new(count, buf.len()))
    }

    /// Shuts down one or both directions of a connection.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotConnected`] for unconnected sockets; [`ErrorCode::Unsupported`] for kinds
    /// that are not sockets.
    pub fn shutdown(&mut self, how: Shutdown) -> Result<()> {
        Ok(self.socket_driver()?.socket()?.shutdown(how)?)
    }

    /// The local address of a socket.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::Unsupported`] for kinds that are not sockets.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        to_socket_addr(&self.socket_driver_ref()?.local()?)
    }

    /// The remote address of a socket: the connected peer, or for datagram sockets the address
    /// writes go to.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NotConnected`] if there is none; [`ErrorCode::Unsupported`] for kinds that
    /// are not sockets.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        to_socket_addr(&self.socket_driver_ref()?.peer()?)
    }

    fn socket_driver(&mut self) -> Result<&SocketDriver> {
        self.socket_driver_mut().map(|driver| &*driver)
    }

    fn socket_driver_mut(&mut self) -> Result<&mut SocketDriver> {
        match self.native_mut()? {
            Native::Socket(driver) => Ok(driver),
            _ => Err(Error::unsupported()),
        }
    }

    fn socket_driver_ref(&self) -> Result<&SocketDriver> {
        match self.native()? {
            Native::Socket(driver) => Ok(driver),
            _ => Err(Error::unsupported()),
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0)
    }

    fn connected_pair() -> (Stream, Stream) {
        let mut listener = Stream::tcp_listen(loopback(), StreamFlags::empty()).unwrap();
        let client = Stream::tcp_connect(listener.local_addr().unwrap(), StreamFlags::empty()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn tcp_exchange() {
        let (mut client, mut server) = connected_pair();

        client.write_all(b"ping").unwrap();
        let mut buf = [0_u8; 4];
        server.read_all(&mut buf).unwrap();

        assert_eq!(&buf, b"ping");
        assert_eq!(server.kind(), StreamKind::Socket);
        assert!(!server.flags().contains(StreamFlags::SERVER));
        assert_eq!(server.peer_addr().unwrap(), client.local_addr().unwrap());
    }

    #[test]
    fn listener_reports_its_port() {
        let mut listener = Stream::tcp_listen(loopback(), StreamFlags::empty()).unwrap();

        let OptionValue::Int(port) = listener.get_option(OptionId::LOCAL_PORT).unwrap() else {
            panic!("port must be an integer");
        };

        assert_ne!(port, 0);
        assert_eq!(i64::from(listener.local_addr().unwrap().port()), port);
        assert_eq!(listener.get_option(OptionId::SO_REUSEADDR).unwrap(), OptionValue::Bool(true));
    }

    #[test]
    fn nonblocking_accept_would_block() {
        let mut listener = Stream::tcp_listen(loopback(), StreamFlags::NONBLOCK).unwrap();

        let error = listener.accept().unwrap_err();

        assert_eq!(error.code(), ErrorCode::WouldBlock);
    }

    #[test]
    fn accept_needs_a_listener() {
        let (mut client, _server) = connected_pair();

        assert_eq!(client.accept().unwrap_err().code(), ErrorCode::InvalidState);
    }

    #[test]
    fn refused_connection() {
        let addr = {
            let listener = Stream::tcp_listen(loopback(), StreamFlags::empty()).unwrap();
            listener.local_addr().unwrap()
        };

        let error = Stream::tcp_connect(addr, StreamFlags::empty()).unwrap_err();

        assert_eq!(error.code(), ErrorCode::ConnectionRefused);
    }

    #[test]
    fn shutdown_signals_end_of_stream() {
        let (mut client, mut server) = connected_pair();

        client.write(b"last").unwrap();
        client.shutdown(Shutdown::Write).unwrap();

        let mut buf = [0_u8; 16];
        let transfer = server.read_all(&mut buf).unwrap();
        assert_eq!(transfer.len(), 4);
        assert!(transfer.is_end_of_stream());
    }

    #[test]
    fn vectored_tcp() {
        let (mut client, mut server) = connected_pair();

        client
            .write_vectored(&[IoSlice::new(b"ab"), IoSlice::new(b"cd")], IoFlags::DOALL)
            .unwrap();

        let mut first = [0_u8; 1];
        let mut second = [0_u8; 3];
        let transfer = server
            .read_vectored(&mut [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)], IoFlags::DOALL)
            .unwrap();

        assert_eq!(transfer.len(), 4);
        assert_eq!(&first, b"a");
        assert_eq!(&second, b"bcd");
    }

    #[test]
    fn udp_replies_to_last_sender() {
        let mut server = Stream::udp_bind(loopback(), StreamFlags::empty()).unwrap();
        let mut client = Stream::udp_connect(server.local_addr().unwrap(), StreamFlags::empty()).unwrap();
        assert_eq!(client.kind(), StreamKind::Datagram);

        client.write(b"hello").unwrap();
        let mut buf = [0_u8; 32];
        let transfer = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..transfer.len()], b"hello");

        server.write(b"welcome").unwrap();
        let transfer = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..transfer.len()], b"welcome");
    }

    #[test]
    fn unanswered_udp_server_has_no_peer() {
        let mut server = Stream::udp_bind(loopback(), StreamFlags::empty()).unwrap();

        assert_eq!(server.write(b"x").unwrap_err().code(), ErrorCode::NotConnected);
    }

    #[test]
    fn datagram_vectored_gathers_and_scatters() {
        let mut server = Stream::udp_bind(loopback(), StreamFlags::empty()).unwrap();
        let mut client = Stream::udp_connect(server.local_addr().unwrap(), StreamFlags::empty()).unwrap();

        client
            .write_vectored(&[IoSlice::new(b"one"), IoSlice::new(b"two")], IoFlags::empty())
            .unwrap();

        let mut first = [0_u8; 4];
        let mut second = [0_u8; 4];
        let transfer = server
            .read_vectored(&mut [IoSliceMut::new(&mut first), IoSliceMut::new(&mut second)], IoFlags::empty())
            .unwrap();

        assert_eq!(transfer.len(), 6);
        assert_eq!(&first, b"onet");
        assert_eq!(&second[..2], b"wo");
    }

    #[test]
    fn recv_from_and_send_to() {
        let mut server = Stream::udp_bind(loopback(), StreamFlags::empty()).unwrap();
        let mut client = Stream::udp_bind(loopback(), StreamFlags::empty()).unwrap();

        client.send_to(b"direct", server.local_addr().unwrap()).unwrap();

        let mut buf = [0_u8; 16];
        let (transfer, from) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..transfer.len()], b"direct");
        assert_eq!(from, client.local_addr().unwrap());
    }

    #[test]
    fn socket_options() {
        let (mut client, _server) = connected_pair();

        client.set_option(OptionId::TCP_NODELAY, true).unwrap();
        client.set_option(OptionId::SO_KEEPALIVE, true).unwrap();
        client.set_option(OptionId::SO_RCVTIMEO, Duration::from_secs(2)).unwrap();
        client.set_option(OptionId::SO_LINGER, Duration::from_secs(1)).unwrap();

        assert_eq!(client.get_option(OptionId::TCP_NODELAY).unwrap(), OptionValue::Bool(true));
        assert_eq!(client.get_option(OptionId::SO_KEEPALIVE).unwrap(), OptionValue::Bool(true));
        assert_eq!(
            client.get_option(OptionId::SO_RCVTIMEO).unwrap(),
            OptionValue::Duration(Some(Duration::from_secs(2)))
        );
        assert_eq!(
            client.get_option(OptionId::SO_LINGER).unwrap(),
            OptionValue::Duration(Some(Duration::from_secs(1)))
        );
        assert_eq!(client.get_option(OptionId::SOCKET_ERROR).unwrap(), OptionValue::Int(0));
        assert_eq!(client.get_option(OptionId::SO_DONTROUTE).unwrap(), OptionValue::Bool(false));
        assert_eq!(client.get_option(OptionId::FILE_PATH).unwrap_err().code(), ErrorCode::Unsupported);

        let OptionValue::Addr(peer) = client.get_option(OptionId::PEER_ADDR).unwrap() else {
            panic!("peer must be an address");
        };
        assert_eq!(peer, client.peer_addr().unwrap());
    }

    #[test]
    fn blocking_toggle() {
        let (mut client, _server) = connected_pair();

        client.set_option(OptionId::BLOCKING, false).unwrap();
        assert!(client.flags().nonblocking());

        let error = client.read(&mut [0; 8]).unwrap_err();
        assert_eq!(error.code(), ErrorCode::WouldBlock);
    }

    #[test]
    fn socket_calls_on_other_kinds() {
        let mut stream = Stream::from_memory(vec![0; 4], StreamFlags::RDWR);

        assert_eq!(stream.accept().unwrap_err().code(), ErrorCode::Unsupported);
        assert_eq!(stream.local_addr().unwrap_err().code(), ErrorCode::Unsupported);
    }

    #[test]
    fn invalid_kind_is_rejected() {
        let error = Stream::open_socket(StreamKind::Pipe, loopback(), StreamFlags::empty()).unwrap_err();

        assert_eq!(error.code(), ErrorCode::InvalidArgument);
    }
}
