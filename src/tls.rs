/// Outcome of one non-blocking operation on an encrypted transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsIo {
    /// `n` bytes were transferred.
    Done(usize),
    /// The peer closed the connection cleanly.
    Closed,
    /// The transport needs the socket to become readable first.
    WantRead,
    /// The transport needs the socket to become writable first.
    WantWrite,
    /// Unrecoverable transport error.
    Fatal,
}

/// Readiness state derived from the transport's last would-block
/// reason. Lives on the transport, not the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsState {
    #[default]
    Idle,
    WantRead,
    WantWrite,
    Fatal,
}

impl TlsState {
    pub fn from_io(io: &TlsIo) -> Self {
        match io {
            TlsIo::WantRead => TlsState::WantRead,
            TlsIo::WantWrite => TlsState::WantWrite,
            TlsIo::Fatal => TlsState::Fatal,
            TlsIo::Done(_) | TlsIo::Closed => TlsState::Idle,
        }
    }
}

/// Abstract encrypted transport. The engine never touches TLS
/// primitives: it only consumes read/write results and the
/// would-block reason they carry.
pub trait TlsStream: Send {
    fn read(&mut self, buf: &mut [u8]) -> TlsIo;
    fn write(&mut self, buf: &[u8]) -> TlsIo;
    fn close(&mut self);
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_from_io() {
        assert_eq!(TlsState::from_io(&TlsIo::Done(3)), TlsState::Idle);
        assert_eq!(TlsState::from_io(&TlsIo::WantRead), TlsState::WantRead);
        assert_eq!(TlsState::from_io(&TlsIo::WantWrite), TlsState::WantWrite);
        assert_eq!(TlsState::from_io(&TlsIo::Fatal), TlsState::Fatal);
    }
}
