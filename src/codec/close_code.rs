//! Close code classification

/// What a shard does after the transport closes with a given code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    /// Reconnect and RESUME with the current session
    Resume,
    /// Reconnect with a fresh IDENTIFY
    Reidentify,
    /// Token rejected, stop the client
    AuthRejected,
    /// Configuration problem retrying cannot fix, stop the client
    Fatal,
}

/// WebSocket / gateway close code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseCode(pub u16);

impl CloseCode {
    /// Sent by us on shutdown; invalidates the session server side.
    pub const NORMAL: Self = Self(1000);
    /// Sent by us when we intend to RESUME.
    pub const RECONNECT: Self = Self(3000);

    pub const UNKNOWN_ERROR: Self = Self(4000);
    pub const UNKNOWN_OPCODE: Self = Self(4001);
    pub const DECODE_ERROR: Self = Self(4002);
    pub const NOT_AUTHENTICATED: Self = Self(4003);
    pub const AUTHENTICATION_FAILED: Self = Self(4004);
    pub const ALREADY_AUTHENTICATED: Self = Self(4005);
    pub const INVALID_SEQUENCE: Self = Self(4007);
    pub const RATE_LIMITED: Self = Self(4008);
    pub const SESSION_TIMED_OUT: Self = Self(4009);
    pub const INVALID_SHARD: Self = Self(4010);
    pub const SHARDING_REQUIRED: Self = Self(4011);
    pub const INVALID_API_VERSION: Self = Self(4012);
    pub const INVALID_INTENTS: Self = Self(4013);
    pub const DISALLOWED_INTENTS: Self = Self(4014);

    pub fn disposition(self) -> CloseDisposition {
        match self.0 {
            4004 => CloseDisposition::AuthRejected,
            4010..=4014 => CloseDisposition::Fatal,
            4007 | 4009 => CloseDisposition::Reidentify,
            _ => CloseDisposition::Resume,
        }
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            1000 => "normal",
            1001 => "going_away",
            3000 => "reconnect",
            4000 => "unknown_error",
            4001 => "unknown_opcode",
            4002 => "decode_error",
            4003 => "not_authenticated",
            4004 => "authentication_failed",
            4005 => "already_authenticated",
            4007 => "invalid_sequence",
            4008 => "rate_limited",
            4009 => "session_timed_out",
            4010 => "invalid_shard",
            4011 => "sharding_required",
            4012 => "invalid_api_version",
            4013 => "invalid_intents",
            4014 => "disallowed_intents",
            _ => "other",
        }
    }
}
