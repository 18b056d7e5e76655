//! Global constants for the tsnode peer network
//!
//! Centralizes protocol magic numbers so the transport, RPC and discovery
//! layers agree on them.

/// Certificate rotation constants
pub mod cert {
    /// Length of one rotation window in milliseconds (14 days)
    pub const ROTATION_PERIOD_MS: i64 = 1000 * 60 * 60 * 24 * 14;

    /// Window offsets a dialer accepts, relative to its own current window
    pub const ACCEPTED_OFFSETS: [i64; 3] = [0, 1, -1];

    /// Label prefix hashed into the private scalar of each window
    pub const KEY_LABEL_PREFIX: &str = "dummykey@";

    /// Bytes of the SHA-512 digest fed into scalar derivation
    pub const SCALAR_INPUT_LEN: usize = 48;
}

/// Transport constants
pub mod transport {
    /// ALPN identifier negotiated on every session
    pub const ALPN: &[u8] = b"h3";

    /// Listen port used when none has been persisted yet
    pub const DEFAULT_LISTEN_PORT: u16 = 3963;

    /// URL scheme used for canonical peer URLs
    pub const URL_SCHEME: &str = "https";

    /// Well-known seed used to join the network
    pub const DEFAULT_BOOTSTRAP_PEER: &str = "https://198.8.58.38:3963";

    /// Keep-alive interval for idle QUIC sessions (10 seconds)
    pub const KEEP_ALIVE_SECS: u64 = 10;

    /// Upper bound for a single dial attempt (10 seconds)
    pub const DIAL_TIMEOUT_SECS: u64 = 10;

    /// UPnP lease for the listen port mapping (1 hour)
    pub const UPNP_LEASE_SECS: u32 = 60 * 60;
}

/// RPC protocol constants
pub mod rpc {
    /// Malformed frames tolerated before the channel aborts
    pub const PROTOCOL_ERROR_BUDGET: u32 = 5;

    /// Initial receive buffer size (64 KiB)
    pub const INITIAL_BUFFER_SIZE: usize = 1 << 16;

    /// Maximum accepted frame payload (4 MiB)
    pub const MAX_FRAME_SIZE: u32 = 4 * 1024 * 1024;

    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const HANDLER_ERROR: i64 = -32000;

    /// Method returning the caller's address as observed by the callee
    pub const METHOD_WHOAMI: &str = "whoami";

    /// Method returning the callee's live peer list
    pub const METHOD_PEERS: &str = "peers";
}

/// Discovery loop constants
pub mod discovery {
    /// Key prefix of persisted peer records
    pub const PEER_KEY_PREFIX: &str = "peer-";

    /// Key of the persisted listen port
    pub const LISTEN_PORT_KEY: &str = "listenPort";

    /// Interval between reconnect scans (10 seconds)
    pub const RECONNECT_INTERVAL_SECS: u64 = 10;

    /// Interval between peer exchange rounds (10 seconds)
    pub const PEX_INTERVAL_SECS: u64 = 10;

    /// Chance that a dead peer is retried on a given scan
    pub const DEAD_RETRY_PROBABILITY: f64 = 0.1;

    /// Capacity of the merged connection channel
    pub const CONNECTION_CHANNEL_SIZE: usize = 256;
}
