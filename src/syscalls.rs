use std::io;
use std::mem;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::WebResult;

/// Outcome of one non-blocking read/write attempt on a socket or
/// file descriptor. Transient would-block conditions are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoAttempt {
    /// `n > 0` bytes transferred.
    Data(usize),
    /// Read returned 0: end of file / peer closed.
    Eof,
    /// EAGAIN / EWOULDBLOCK / EINTR: ask again when ready.
    WouldBlock,
}

/// Create a non-blocking TCP listener with SO_REUSEPORT so every
/// worker can bind its own copy of the same address.
pub fn create_listen_socket(host: &str, port: u16) -> WebResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: std::net::SocketAddr = addr_str
        .parse()
        .map_err(|_| crate::error::WebError::Address(addr_str.clone()))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        bind_addr(fd, &addr)?;

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &std::net::SocketAddr) -> WebResult<()> {
    unsafe {
        match addr {
            std::net::SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
            std::net::SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    let err = io::Error::last_os_error();
                    libc::close(fd);
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }
}

/// The port a bound socket actually listens on. Needed when binding
/// port 0 (tests).
pub fn local_port(fd: c_int) -> WebResult<u16> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin: &libc::sockaddr_in = &*(&storage as *const _ as *const libc::sockaddr_in);
                Ok(u16::from_be(sin.sin_port))
            }
            libc::AF_INET6 => {
                let sin6: &libc::sockaddr_in6 =
                    &*(&storage as *const _ as *const libc::sockaddr_in6);
                Ok(u16::from_be(sin6.sin6_port))
            }
            _ => Err(crate::error::WebError::Other(
                "unknown socket family".to_string(),
            )),
        }
    }
}

/// Accept one pending connection. Returns the non-blocking client fd
/// with the textual peer ip and port, or None when the accept queue
/// is drained.
pub fn accept_connection(listen_fd: c_int) -> WebResult<Option<(c_int, String, String)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }

        let (ip, port) = match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin: &libc::sockaddr_in = &*(&storage as *const _ as *const libc::sockaddr_in);
                let ip = std::net::Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                (ip.to_string(), u16::from_be(sin.sin_port).to_string())
            }
            libc::AF_INET6 => {
                let sin6: &libc::sockaddr_in6 =
                    &*(&storage as *const _ as *const libc::sockaddr_in6);
                let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                (ip.to_string(), u16::from_be(sin6.sin6_port).to_string())
            }
            _ => ("unknown".to_string(), "0".to_string()),
        };

        Ok(Some((fd, ip, port)))
    }
}

pub fn close_fd(fd: c_int) {
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
}

/// `recv(MSG_DONTWAIT)` into the given slice.
pub fn recv_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<IoAttempt> {
    unsafe {
        let res = libc::recv(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        );
        classify_read(res)
    }
}

/// Plain `read()`, for file descriptors opened by the static-file
/// responder.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> io::Result<IoAttempt> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        classify_read(res)
    }
}

/// `send()` with the given flags (usually MSG_DONTWAIT).
pub fn send_nonblocking(fd: c_int, buf: &[u8], flags: c_int) -> io::Result<IoAttempt> {
    unsafe {
        let res = libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags | libc::MSG_NOSIGNAL,
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if is_transient(&err) {
                return Ok(IoAttempt::WouldBlock);
            }
            return Err(err);
        }
        Ok(IoAttempt::Data(res as usize))
    }
}

fn classify_read(res: isize) -> io::Result<IoAttempt> {
    if res > 0 {
        Ok(IoAttempt::Data(res as usize))
    } else if res == 0 {
        Ok(IoAttempt::Eof)
    } else {
        let err = io::Error::last_os_error();
        if is_transient(&err) {
            Ok(IoAttempt::WouldBlock)
        } else {
            Err(err)
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Open a file read-only and non-blocking, reporting the raw OS error
/// so the caller can distinguish EBUSY/EAGAIN from anything else.
pub fn open_nonblocking_read(path: &std::path::Path) -> Result<c_int, io::Error> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

    unsafe {
        let fd = libc::open(cpath.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK);
        if fd < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(fd)
        }
    }
}

/// Toggle TCP_CORK on the output socket. Unsupported platforms and
/// invalid fds are a quiet no-op.
pub fn set_tcp_cork(fd: c_int, on: bool) -> io::Result<()> {
    if fd < 0 {
        return Ok(());
    }

    #[cfg(target_os = "linux")]
    unsafe {
        let val: c_int = if on { 1 } else { 0 };
        if libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_CORK,
            &val as *const _ as *const c_void,
            mem::size_of_val(&val) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }

    #[cfg(not(target_os = "linux"))]
    let _ = on;

    Ok(())
}

pub fn gettid() -> i64 {
    #[cfg(target_os = "linux")]
    unsafe {
        libc::syscall(libc::SYS_gettid) as i64
    }
    #[cfg(not(target_os = "linux"))]
    {
        0
    }
}

// ---- Epoll (Linux) ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    pub use libc::{EPOLLIN, EPOLLOUT, epoll_event};

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> WebResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> WebResult<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> WebResult<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
        }

        fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> WebResult<()> {
            let mut event = epoll_event {
                events: interests as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> WebResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> WebResult<usize> {
            unsafe {
                let res = libc::epoll_wait(
                    self.fd,
                    events.as_mut_ptr(),
                    events.len() as c_int,
                    timeout_ms,
                );
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
