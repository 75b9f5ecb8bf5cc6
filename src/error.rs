/// Faults detected while decoding or interpreting multiplexer traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// Frame check sequence did not verify.
    Fcs,
    /// Frame or control message could not be interpreted.
    Malformed,
    /// Length field exceeds the configured maximum information length.
    TooLong,
    /// Peer sent a frame that does not fit the state of its DLCI.
    UnexpectedFrame,
}

#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    // Link and bus errors
    Transport(embedded_io_async::ErrorKind),
    Bus(embedded_hal::i2c::ErrorKind),
    Protocol(ProtocolError),
    Timeout,

    // Transient, caller may retry
    FlowControlled,

    // Programming errors
    InvalidArgument,
    InvalidLength,

    // Channel table errors
    ResourceExhausted,
    AlreadyOpen,
    NotOpen,
    NotEnabled,
    Rejected,
    InvalidHandle,
    /// The previous session must be released with `Mux::teardown` first.
    TeardownRequired,
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter<'_>) {
        match self {
            Self::Transport(e) => defmt::write!(f, "Transport({:?})", e),
            Self::Bus(e) => defmt::write!(f, "Bus({:?})", e),
            Self::Protocol(e) => defmt::write!(f, "Protocol({:?})", e),
            Self::Timeout => defmt::write!(f, "Timeout"),
            Self::FlowControlled => defmt::write!(f, "FlowControlled"),
            Self::InvalidArgument => defmt::write!(f, "InvalidArgument"),
            Self::InvalidLength => defmt::write!(f, "InvalidLength"),
            Self::ResourceExhausted => defmt::write!(f, "ResourceExhausted"),
            Self::AlreadyOpen => defmt::write!(f, "AlreadyOpen"),
            Self::NotOpen => defmt::write!(f, "NotOpen"),
            Self::NotEnabled => defmt::write!(f, "NotEnabled"),
            Self::Rejected => defmt::write!(f, "Rejected"),
            Self::InvalidHandle => defmt::write!(f, "InvalidHandle"),
            Self::TeardownRequired => defmt::write!(f, "TeardownRequired"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<embassy_time::TimeoutError> for Error {
    fn from(_: embassy_time::TimeoutError) -> Self {
        Self::Timeout
    }
}

impl Error {
    pub(crate) fn transport<E: embedded_io_async::Error>(e: E) -> Self {
        Self::Transport(e.kind())
    }

    pub(crate) fn bus<E: embedded_hal::i2c::Error>(e: E) -> Self {
        Self::Bus(e.kind())
    }
}
