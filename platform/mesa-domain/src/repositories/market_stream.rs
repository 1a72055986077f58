use crate::value_objects::tick::Tick;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamError {
    Disconnected(String),
    Protocol(String),
    InvalidData(String),
    EndOfStream,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Disconnected(msg) => write!(f, "disconnected: {msg}"),
            StreamError::Protocol(msg) => write!(f, "protocol: {msg}"),
            StreamError::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            StreamError::EndOfStream => write!(f, "end of stream"),
        }
    }
}

/// Blocking source of ticks for one instrument.
pub trait MarketStream {
    fn next_tick(&mut self) -> Result<Tick, StreamError>;
}

/// Opens (and reopens after a disconnect) the tick stream. `connect` doubles as the
/// startup handshake: it returns once the source is ready to deliver ticks.
pub trait MarketConnector {
    type Stream: MarketStream;

    fn connect(&mut self) -> Result<Self::Stream, StreamError>;
}

/// In-memory stream, used by replays over preloaded data and by tests.
#[derive(Debug, Clone, Default)]
pub struct VecTickStream {
    ticks: std::collections::VecDeque<Tick>,
}

impl VecTickStream {
    pub fn new(ticks: Vec<Tick>) -> Self {
        Self {
            ticks: ticks.into(),
        }
    }
}

impl MarketStream for VecTickStream {
    fn next_tick(&mut self) -> Result<Tick, StreamError> {
        self.ticks.pop_front().ok_or(StreamError::EndOfStream)
    }
}
