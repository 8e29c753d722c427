use url::Url;

/// The maximum allowed payload size for a single frame, in bytes, set to 1 MiB.
///
/// Frames that declare a larger payload are rejected with a 1009 close before any payload
/// byte is read.
pub const MAX_PAYLOAD_READ: u64 = 1024 * 1024;

/// The maximum size of a reassembled message, in bytes, set to 2 MiB.
///
/// Going over it while buffering a message closes the connection with 1009.
pub const MAX_READ_BUFFER: u64 = 2 * 1024 * 1024;

/// Size of the buffers leased from the connection's pool, set to 16 KiB.
///
/// Outbound messages of unknown length are fragmented at this size.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// The role the connection is taking.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// The negotiated `Sec-WebSocket-Version`.
///
/// Drafts 07 and 08 share the framing of RFC 6455 (version 13), so all three are decoded by
/// the same header parser.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum WebSocketVersion {
    V07,
    V08,
    #[default]
    V13,
}

impl WebSocketVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V07 => "7",
            Self::V08 => "8",
            Self::V13 => "13",
        }
    }
}

impl std::fmt::Display for WebSocketVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a [`WebSocketChannel`](crate::WebSocketChannel).
///
/// # Example
/// ```rust
/// use wsflow::{Options, Role};
///
/// let options = Options::default()
///     .with_role(Role::Client)
///     .with_max_message_size(64 * 1024)
///     .without_utf8();
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Whether this end masks its frames (client) or not (server).
    ///
    /// Default: [`Role::Server`]
    pub role: Role,

    /// Version negotiated during the handshake.
    pub version: WebSocketVersion,

    /// Size of pooled buffers, see [`DEFAULT_BUFFER_SIZE`].
    pub buffer_size: usize,

    /// Maximum payload a single inbound frame may declare.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`]
    pub max_frame_payload: Option<u64>,

    /// Maximum size of a buffered message. `None` disables the limit.
    ///
    /// Default: 2 MiB as defined in [`MAX_READ_BUFFER`]
    pub max_message_size: Option<u64>,

    /// Flag to determine whether text frames and close reasons are validated as UTF-8.
    ///
    /// Default: `true`
    pub check_utf8: bool,

    /// Subprotocol selected during the handshake.
    pub subprotocol: Option<String>,

    /// URL the connection was upgraded from.
    pub url: Option<Url>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            role: Role::Server,
            version: WebSocketVersion::V13,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_frame_payload: Some(MAX_PAYLOAD_READ),
            max_message_size: Some(MAX_READ_BUFFER),
            check_utf8: true,
            subprotocol: None,
            url: None,
        }
    }
}

impl Options {
    pub fn with_role(self, role: Role) -> Self {
        Self { role, ..self }
    }

    pub fn with_version(self, version: WebSocketVersion) -> Self {
        Self { version, ..self }
    }

    /// Sets the size of pooled buffers, which is also the fragment size of streamed sends.
    pub fn with_buffer_size(self, size: usize) -> Self {
        Self {
            buffer_size: size.max(1),
            ..self
        }
    }

    /// Sets the maximum payload an inbound frame may declare.
    pub fn with_max_frame_payload(self, size: u64) -> Self {
        Self {
            max_frame_payload: Some(size),
            ..self
        }
    }

    /// Sets the maximum size of a buffered message.
    pub fn with_max_message_size(self, size: u64) -> Self {
        Self {
            max_message_size: Some(size),
            ..self
        }
    }

    /// Removes the limit on buffered message size.
    pub fn without_max_message_size(self) -> Self {
        Self {
            max_message_size: None,
            ..self
        }
    }

    /// Enables UTF-8 validation of text frames.
    pub fn with_utf8(self) -> Self {
        Self {
            check_utf8: true,
            ..self
        }
    }

    /// Disables UTF-8 validation of text frames. Close reasons are always validated.
    pub fn without_utf8(self) -> Self {
        Self {
            check_utf8: false,
            ..self
        }
    }

    pub fn with_subprotocol(self, subprotocol: impl Into<String>) -> Self {
        Self {
            subprotocol: Some(subprotocol.into()),
            ..self
        }
    }

    pub fn with_url(self, url: Url) -> Self {
        Self {
            url: Some(url),
            ..self
        }
    }

    pub(crate) fn frame_limit(&self) -> u64 {
        self.max_frame_payload.unwrap_or(u64::MAX)
    }
}
