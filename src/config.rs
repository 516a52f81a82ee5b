use crate::abnf::sip::GENERIC_PARAMS_MAX;

/// Largest SIP message accepted over a stream transport.
pub const MAX_SIP_MESSAGE_SIZE: usize = 65535;
/// Messages parsed from the remainder of a single read.
pub const MAX_COMPOUND_FRAMES: usize = 10;
/// Consecutive failed reads tolerated before the connection is torn down.
pub const MAX_READ_EXCEPTIONS: usize = 5;
pub const MAX_HEADER_LINES: usize = 2048;

/// Bounds applied by the incremental message parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    pub max_message_size: usize,
    pub max_header_lines: usize,
    pub max_generic_params: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_message_size: MAX_SIP_MESSAGE_SIZE,
            max_header_lines: MAX_HEADER_LINES,
            max_generic_params: GENERIC_PARAMS_MAX,
        }
    }
}

/// Transport tunables
///
/// ```rust
/// use rsipstream::TransportConfig;
///
/// let config = TransportConfig::default()
///     .with_max_compound_frames(4)
///     .with_max_read_exceptions(3);
/// assert_eq!(config.max_compound_frames, 4);
/// assert_eq!(config.parser_limits().max_message_size, 65535);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub read_buffer_size: usize,
    pub max_message_size: usize,
    pub max_compound_frames: usize,
    pub max_read_exceptions: usize,
    pub max_generic_params: usize,
    pub max_header_lines: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: MAX_SIP_MESSAGE_SIZE,
            max_message_size: MAX_SIP_MESSAGE_SIZE,
            max_compound_frames: MAX_COMPOUND_FRAMES,
            max_read_exceptions: MAX_READ_EXCEPTIONS,
            max_generic_params: GENERIC_PARAMS_MAX,
            max_header_lines: MAX_HEADER_LINES,
        }
    }
}

impl TransportConfig {
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    pub fn with_max_compound_frames(mut self, frames: usize) -> Self {
        self.max_compound_frames = frames;
        self
    }

    pub fn with_max_read_exceptions(mut self, count: usize) -> Self {
        self.max_read_exceptions = count.max(1);
        self
    }

    pub fn with_max_generic_params(mut self, count: usize) -> Self {
        self.max_generic_params = count;
        self
    }

    pub fn with_max_header_lines(mut self, count: usize) -> Self {
        self.max_header_lines = count;
        self
    }

    pub fn parser_limits(&self) -> ParserLimits {
        ParserLimits {
            max_message_size: self.max_message_size,
            max_header_lines: self.max_header_lines,
            max_generic_params: self.max_generic_params,
        }
    }
}
