use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::Serialize;

// for draft-ietf-moq-transport-07
pub const MOQ_TRANSPORT_VERSION: u32 = 0xff000007;

/// Session-level error codes carried in CLOSE_SESSION.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum SessionErrorCode {
    NoError = 0x0,
    InternalError = 0x1,
    ProtocolViolation = 0x3,
    TooManySubscribes = 0x6,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum SubscribeErrorCode {
    InternalError = 0x0,
    InvalidRange = 0x1,
    RetryTrackAlias = 0x2,
    TrackDoesNotExist = 0x4,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum SubscribeDoneCode {
    Unsubscribed = 0x0,
    InternalError = 0x1,
    GoingAway = 0x4,
}

#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u64)]
pub enum AnnounceErrorCode {
    InternalError = 0x0,
    AnnounceNotSupported = 0x1,
}

/// Application error codes used when resetting individual data streams.
pub const RESET_CODE_SUBSCRIPTION_GONE: u64 = 0x0;
pub const RESET_CODE_TIMED_OUT: u64 = 0x1;
