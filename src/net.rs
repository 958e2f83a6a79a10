use std::fmt;
use std::io::{self, Read, Write};
use std::mem;
use std::net::{Shutdown, SocketAddrV4, TcpStream};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddress {
    Unix(PathBuf),
    Inet(SocketAddrV4),
}

impl SocketAddress {
    pub fn is_unix(&self) -> bool {
        matches!(self, SocketAddress::Unix(_))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Unix(path) => write!(f, "{}", path.display()),
            SocketAddress::Inet(addr) => write!(f, "{addr}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum NetError {
    #[error("timed out")]
    Timeout,
    #[error("connect failed: {0}")]
    Connect(io::Error),
    #[error("socket error: {0}")]
    Socket(io::Error),
}

/// A connected stream socket of either family.
#[derive(Debug)]
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.shutdown(how),
            Stream::Tcp(s) => s.shutdown(how),
        }
    }

    /// Bounds every subsequent blocking read and write on the socket.
    pub fn set_io_timeout(&self, timeout: Duration) -> io::Result<()> {
        let timeout = Some(timeout.max(Duration::from_millis(1)));
        match self {
            Stream::Unix(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
            Stream::Tcp(s) => {
                s.set_read_timeout(timeout)?;
                s.set_write_timeout(timeout)
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Stream::Unix(s) => s.as_raw_fd(),
            Stream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

/// Connects to `addr`, giving up after `timeout`.
///
/// Uses a non-blocking `connect(2)` followed by a `poll(2)` for writability.
/// The socket's original blocking mode is restored before returning,
/// whatever the outcome. On error the descriptor is closed.
pub fn connect_with_timeout(addr: &SocketAddress, timeout: Duration) -> Result<Stream, NetError> {
    let fd = new_socket(addr).map_err(NetError::Socket)?;
    let raw = fd.as_raw_fd();

    let flags = fcntl_getfl(raw).map_err(NetError::Socket)?;
    fcntl_setfl(raw, flags | libc::O_NONBLOCK).map_err(NetError::Socket)?;

    let connected = connect_raw(raw, addr, timeout);
    let restored = fcntl_setfl(raw, flags);

    connected?;
    restored.map_err(NetError::Socket)?;

    Ok(match addr {
        SocketAddress::Unix(_) => Stream::Unix(UnixStream::from(fd)),
        SocketAddress::Inet(_) => Stream::Tcp(TcpStream::from(fd)),
    })
}

/// Waits until `sock` is readable. Returns 0 on timeout.
pub fn wait_readable<S: AsRawFd>(sock: &S, timeout: Duration) -> Result<usize, NetError> {
    wait_for(sock.as_raw_fd(), libc::POLLIN, timeout)
}

/// Waits until `sock` is writable. Returns 0 on timeout.
pub fn wait_writable<S: AsRawFd>(sock: &S, timeout: Duration) -> Result<usize, NetError> {
    wait_for(sock.as_raw_fd(), libc::POLLOUT, timeout)
}

/// Reads until end of stream or until `capacity` bytes have been collected.
/// Whatever the peer sends beyond `capacity` is left unread.
pub fn read_bounded<R: Read>(reader: &mut R, capacity: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; capacity];
    let mut size = 0;
    while size < capacity {
        match reader.read(&mut buf[size..]) {
            Ok(0) => break,
            Ok(n) => size += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(size);
    Ok(buf)
}

/// Waits up to `timeout` for the peer to start replying, then collects the
/// reply with [`read_bounded`].
pub fn read_reply(
    stream: &mut Stream,
    timeout: Duration,
    capacity: usize,
) -> Result<Vec<u8>, NetError> {
    if wait_readable(stream, timeout)? == 0 {
        return Err(NetError::Timeout);
    }
    read_bounded(stream, capacity).map_err(|e| match e.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NetError::Timeout,
        _ => NetError::Socket(e),
    })
}

fn wait_for(fd: RawFd, events: libc::c_short, timeout: Duration) -> Result<usize, NetError> {
    // A socket may have failed asynchronously since the last operation.
    if let Some(e) = pending_error(fd).map_err(NetError::Socket)? {
        log::warn!("SO_ERROR set on socket before poll: {e}");
        return Err(NetError::Socket(e));
    }

    let ready = poll_fd(fd, events, timeout).map_err(NetError::Socket)?;

    if let Some(e) = pending_error(fd).map_err(NetError::Socket)? {
        log::warn!("SO_ERROR set on socket after poll: {e}");
        return Err(NetError::Socket(e));
    }
    Ok(ready)
}

fn connect_raw(fd: RawFd, addr: &SocketAddress, timeout: Duration) -> Result<(), NetError> {
    match with_sockaddr(addr, |sa, len| {
        if unsafe { libc::connect(fd, sa, len) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }) {
        Ok(()) => return Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {}
        Err(e) => return Err(NetError::Connect(e)),
    }

    match poll_fd(fd, libc::POLLOUT, timeout) {
        Ok(0) => Err(NetError::Timeout),
        Ok(_) => match pending_error(fd) {
            Ok(None) => Ok(()),
            Ok(Some(e)) => Err(NetError::Connect(e)),
            Err(e) => Err(NetError::Socket(e)),
        },
        Err(e) => Err(NetError::Connect(e)),
    }
}

fn new_socket(addr: &SocketAddress) -> io::Result<OwnedFd> {
    let domain = match addr {
        SocketAddress::Unix(_) => libc::AF_UNIX,
        SocketAddress::Inet(_) => libc::AF_INET,
    };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

fn with_sockaddr<F>(addr: &SocketAddress, f: F) -> io::Result<()>
where
    F: FnOnce(*const libc::sockaddr, libc::socklen_t) -> io::Result<()>,
{
    match addr {
        SocketAddress::Unix(path) => {
            let mut sun: libc::sockaddr_un = unsafe { mem::zeroed() };
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = path.as_os_str().as_bytes();
            // Leave room for the terminating NUL.
            if bytes.len() >= sun.sun_path.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unix socket path too long: {}", path.display()),
                ));
            }
            for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            f(
                &sun as *const libc::sockaddr_un as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
            )
        }
        SocketAddress::Inet(addr) => {
            let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = addr.port().to_be();
            sin.sin_addr = libc::in_addr {
                s_addr: u32::from(*addr.ip()).to_be(),
            };
            f(
                &sin as *const libc::sockaddr_in as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
    }
}

fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<usize> {
    let millis = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        let r = unsafe { libc::poll(&mut pfd, 1, millis) };
        if r >= 0 {
            return Ok(r as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn pending_error(fd: RawFd) -> io::Result<Option<io::Error>> {
    let mut error: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut error as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok((error != 0).then(|| io::Error::from_raw_os_error(error)))
}

fn fcntl_getfl(fd: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

fn fcntl_setfl(fd: RawFd, flags: libc::c_int) -> io::Result<()> {
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};
    use std::os::unix::net::UnixListener;

    fn is_nonblocking<S: AsRawFd>(s: &S) -> bool {
        fcntl_getfl(s.as_raw_fd()).unwrap() & libc::O_NONBLOCK != 0
    }

    #[test]
    fn test_connect_unix_restores_blocking_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.sock");
        let _listener = UnixListener::bind(&path).unwrap();

        let stream =
            connect_with_timeout(&SocketAddress::Unix(path), Duration::from_millis(500)).unwrap();
        assert!(matches!(stream, Stream::Unix(_)));
        assert!(!is_nonblocking(&stream));
    }

    #[test]
    fn test_connect_missing_unix_socket() {
        let dir = tempfile::tempdir().unwrap();
        let addr = SocketAddress::Unix(dir.path().join("nothing-here.sock"));
        match connect_with_timeout(&addr, Duration::from_millis(500)) {
            Err(NetError::Connect(e)) => assert_eq!(e.raw_os_error(), Some(libc::ENOENT)),
            other => panic!("expected connect error, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_tcp_refused() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let addr = SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        match connect_with_timeout(&addr, Duration::from_millis(500)) {
            Err(NetError::Connect(e)) => {
                assert_eq!(e.raw_os_error(), Some(libc::ECONNREFUSED))
            }
            other => panic!("expected connection refused, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_tcp_and_wait() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        let stream = connect_with_timeout(&addr, Duration::from_millis(500)).unwrap();
        assert!(!is_nonblocking(&stream));
        assert_eq!(wait_writable(&stream, Duration::from_millis(500)).unwrap(), 1);
        // Nothing has been sent yet.
        assert_eq!(wait_readable(&stream, Duration::from_millis(50)).unwrap(), 0);

        let (mut peer, _) = listener.accept().unwrap();
        peer.write_all(b"hello").unwrap();
        assert_eq!(wait_readable(&stream, Duration::from_millis(500)).unwrap(), 1);
    }

    #[test]
    fn test_read_bounded_truncates() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.write_all(&[b'x'; 100]).unwrap();
        drop(a);
        let data = read_bounded(&mut b, 64).unwrap();
        assert_eq!(data.len(), 64);

        let (mut a, mut b) = UnixStream::pair().unwrap();
        a.write_all(b"short").unwrap();
        drop(a);
        assert_eq!(read_bounded(&mut b, 64).unwrap(), b"short");
    }

    /// Accepts a connection on `listener` and closes it with an RST.
    fn reset_peer(listener: &TcpListener) {
        let (peer, _) = listener.accept().unwrap();
        let linger = libc::linger {
            l_onoff: 1,
            l_linger: 0,
        };
        let rc = unsafe {
            libc::setsockopt(
                peer.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &linger as *const libc::linger as *const libc::c_void,
                mem::size_of::<libc::linger>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        drop(peer);
        std::thread::sleep(Duration::from_millis(50));
    }

    fn open_fds() -> usize {
        std::fs::read_dir("/proc/self/fd").unwrap().count()
    }

    #[test]
    fn test_wait_fails_fast_on_reset() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let addr = SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        // SO_ERROR is cleared once read, so each check needs its own connection.
        let stream = connect_with_timeout(&addr, Duration::from_millis(500)).unwrap();
        reset_peer(&listener);
        let started = std::time::Instant::now();
        match wait_readable(&stream, Duration::from_secs(5)) {
            Err(NetError::Socket(e)) => assert_eq!(e.raw_os_error(), Some(libc::ECONNRESET)),
            other => panic!("expected connection reset, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(1));

        let stream = connect_with_timeout(&addr, Duration::from_millis(500)).unwrap();
        reset_peer(&listener);
        match wait_writable(&stream, Duration::from_secs(5)) {
            Err(NetError::Socket(e)) => assert_eq!(e.raw_os_error(), Some(libc::ECONNRESET)),
            other => panic!("expected connection reset, got {other:?}"),
        }
    }

    #[test]
    fn test_connect_timeout() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        // Shrink the backlog so later handshakes are never answered.
        assert_eq!(unsafe { libc::listen(listener.as_raw_fd(), 0) }, 0);
        let port = listener.local_addr().unwrap().port();
        let addr = SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));

        let mut held = Vec::new();
        let mut timed_out = false;
        for _ in 0..8 {
            let started = std::time::Instant::now();
            match connect_with_timeout(&addr, Duration::from_millis(100)) {
                Ok(stream) => held.push(stream),
                Err(NetError::Timeout) => {
                    assert!(started.elapsed() >= Duration::from_millis(90));
                    assert!(started.elapsed() < Duration::from_secs(2));
                    timed_out = true;
                    break;
                }
                Err(e) => panic!("expected timeout, got {e:?}"),
            }
        }
        assert!(timed_out, "backlog never filled");
    }

    #[test]
    fn test_failed_connects_close_descriptors() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let refused = SocketAddress::Inet(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        let dir = tempfile::tempdir().unwrap();
        let missing = SocketAddress::Unix(dir.path().join("gone.sock"));

        let before = open_fds();
        for _ in 0..200 {
            assert!(connect_with_timeout(&refused, Duration::from_millis(200)).is_err());
            assert!(connect_with_timeout(&missing, Duration::from_millis(200)).is_err());
        }
        // Other tests run in parallel, so allow some slack.
        assert!(open_fds() < before + 50);
    }

    #[test]
    fn test_unix_path_too_long() {
        let addr = SocketAddress::Unix(PathBuf::from(format!("/tmp/{}", "a".repeat(200))));
        assert!(matches!(
            connect_with_timeout(&addr, Duration::from_millis(100)),
            Err(NetError::Connect(_))
        ));
    }
}
