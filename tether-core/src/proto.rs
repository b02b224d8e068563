//! Protocol-level constants and code tables for OMA DS 1.1 / 1.2.
//!
//! Wraps the raw numeric status and alert codes of the wire protocol as enums
//! for type-safe comparisons, plus the content types and defaults the rest of
//! the engine works against.

use serde::{Deserialize, Serialize};

/// Role of the local engine in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

/// Supported OMA DS protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "1.1")]
    V11,
    #[serde(rename = "1.2")]
    V12,
}

impl ProtocolVersion {
    /// The `VerProto` string of the SyncML header.
    pub fn ver_proto(&self) -> &'static str {
        match self {
            ProtocolVersion::V11 => "SyncML/1.1",
            ProtocolVersion::V12 => "SyncML/1.2",
        }
    }

    /// The `VerDTD` string of the SyncML header.
    pub fn ver_dtd(&self) -> &'static str {
        match self {
            ProtocolVersion::V11 => "1.1",
            ProtocolVersion::V12 => "1.2",
        }
    }

    /// The device-info URI for this protocol version.
    pub fn devinf_path(&self) -> &'static str {
        match self {
            ProtocolVersion::V11 => "./devinf11",
            ProtocolVersion::V12 => "./devinf12",
        }
    }

    pub fn from_ver_proto(s: &str) -> Option<Self> {
        match s {
            "SyncML/1.1" => Some(ProtocolVersion::V11),
            "SyncML/1.2" => Some(ProtocolVersion::V12),
            _ => None,
        }
    }
}

/// SyncML response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum StatusCode {
    // Informational 1xx
    InProgress = 101,

    // Successful 2xx
    Success = 200,
    ItemAdded = 201,
    AcceptedForProcessing = 202,
    NonAuthoritativeResponse = 203,
    NoContent = 204,
    ResetContent = 205,
    PartialContent = 206,
    ResolvedWithMerge = 207,
    ResolvedClientWinning = 208,
    ResolvedWithDuplicate = 209,
    DeleteWithoutArchive = 210,
    ItemNotDeleted = 211,
    AuthAccepted = 212,
    ChunkedItemAccepted = 213,
    Cancelled = 214,
    NotExecuted = 215,
    AtomicRollbackOk = 216,

    // Redirection 3xx
    MultipleChoices = 300,
    MovedPermanently = 301,
    Found = 302,
    SeeOther = 303,
    NotModified = 304,
    UseProxy = 305,

    // Originator exceptions 4xx
    BadRequest = 400,
    InvalidCred = 401,
    PaymentNeeded = 402,
    Forbidden = 403,
    NotFound = 404,
    CommandNotAllowed = 405,
    NotSupported = 406,
    MissingCred = 407,
    RequestTimeout = 408,
    Conflict = 409,
    Gone = 410,
    SizeRequired = 411,
    IncompleteCommand = 412,
    UriTooLong = 414,
    UnsupportedFormat = 415,
    RequestEntityTooLarge = 416,
    RetryLater = 417,
    AlreadyExists = 418,
    ResolvedWithServerData = 419,
    DeviceFull = 420,
    UnknownSearchGrammar = 421,
    BadCgiScript = 422,
    SoftDeleteConflict = 423,
    SizeMismatch = 424,
    PermissionDenied = 425,
    PartialItemNotAccepted = 426,
    ItemNotEmpty = 427,
    MoveFailed = 428,

    // Recipient exceptions 5xx
    CommandFailed = 500,
    NotImplemented = 501,
    BadGateway = 502,
    ServiceUnavailable = 503,
    GatewayTimeout = 504,
    UnsupportedDtdVersion = 505,
    ProcessingError = 506,
    AtomicFailed = 507,
    RefreshRequired = 508,
    DataStoreFailure = 510,
    ServerFailure = 511,
    SyncFailed = 512,
    UnsupportedProtocolVersion = 513,
    OperationCancelled = 514,
    AtomicRollbackFailed = 516,
    AtomicResponseTooLarge = 517,
}

/// Coarse grouping of status codes, used when reacting to peer statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Informational,
    Successful,
    Redirection,
    OriginatorException,
    RecipientException,
}

impl StatusCode {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        use StatusCode::*;
        Some(match code {
            101 => InProgress,
            200 => Success,
            201 => ItemAdded,
            202 => AcceptedForProcessing,
            203 => NonAuthoritativeResponse,
            204 => NoContent,
            205 => ResetContent,
            206 => PartialContent,
            207 => ResolvedWithMerge,
            208 => ResolvedClientWinning,
            209 => ResolvedWithDuplicate,
            210 => DeleteWithoutArchive,
            211 => ItemNotDeleted,
            212 => AuthAccepted,
            213 => ChunkedItemAccepted,
            214 => Cancelled,
            215 => NotExecuted,
            216 => AtomicRollbackOk,
            300 => MultipleChoices,
            301 => MovedPermanently,
            302 => Found,
            303 => SeeOther,
            304 => NotModified,
            305 => UseProxy,
            400 => BadRequest,
            401 => InvalidCred,
            402 => PaymentNeeded,
            403 => Forbidden,
            404 => NotFound,
            405 => CommandNotAllowed,
            406 => NotSupported,
            407 => MissingCred,
            408 => RequestTimeout,
            409 => Conflict,
            410 => Gone,
            411 => SizeRequired,
            412 => IncompleteCommand,
            414 => UriTooLong,
            415 => UnsupportedFormat,
            416 => RequestEntityTooLarge,
            417 => RetryLater,
            418 => AlreadyExists,
            419 => ResolvedWithServerData,
            420 => DeviceFull,
            421 => UnknownSearchGrammar,
            422 => BadCgiScript,
            423 => SoftDeleteConflict,
            424 => SizeMismatch,
            425 => PermissionDenied,
            426 => PartialItemNotAccepted,
            427 => ItemNotEmpty,
            428 => MoveFailed,
            500 => CommandFailed,
            501 => NotImplemented,
            502 => BadGateway,
            503 => ServiceUnavailable,
            504 => GatewayTimeout,
            505 => UnsupportedDtdVersion,
            506 => ProcessingError,
            507 => AtomicFailed,
            508 => RefreshRequired,
            510 => DataStoreFailure,
            511 => ServerFailure,
            512 => SyncFailed,
            513 => UnsupportedProtocolVersion,
            514 => OperationCancelled,
            516 => AtomicRollbackFailed,
            517 => AtomicResponseTooLarge,
            _ => return None,
        })
    }

    pub fn class(&self) -> StatusClass {
        match self.as_u16() {
            100..=199 => StatusClass::Informational,
            200..=299 => StatusClass::Successful,
            300..=399 => StatusClass::Redirection,
            400..=499 => StatusClass::OriginatorException,
            _ => StatusClass::RecipientException,
        }
    }

    /// Whether the peer considered the referenced command successful.
    pub fn is_success(&self) -> bool {
        self.class() == StatusClass::Successful
    }
}

/// SyncML alert codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum AlertCode {
    Display = 100,

    // Sync initialization, client initiated
    TwoWaySync = 200,
    SlowSync = 201,
    OneWayFromClientSync = 202,
    RefreshFromClientSync = 203,
    OneWayFromServerSync = 204,
    RefreshFromServerSync = 205,

    // Sync initialization, server alerted
    TwoWayByServer = 206,
    OneWayFromClientByServer = 207,
    RefreshFromClientByServer = 208,
    OneWayFromServerByServer = 209,
    RefreshFromServerByServer = 210,

    // Special alerts
    ResultAlert = 221,
    NextMessage = 222,
    NoEndOfData = 223,
    AlertSuspend = 224,
    AlertResume = 225,
}

impl AlertCode {
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }

    pub fn from_u16(code: u16) -> Option<Self> {
        use AlertCode::*;
        Some(match code {
            100 => Display,
            200 => TwoWaySync,
            201 => SlowSync,
            202 => OneWayFromClientSync,
            203 => RefreshFromClientSync,
            204 => OneWayFromServerSync,
            205 => RefreshFromServerSync,
            206 => TwoWayByServer,
            207 => OneWayFromClientByServer,
            208 => RefreshFromClientByServer,
            209 => OneWayFromServerByServer,
            210 => RefreshFromServerByServer,
            221 => ResultAlert,
            222 => NextMessage,
            223 => NoEndOfData,
            224 => AlertSuspend,
            225 => AlertResume,
            _ => return None,
        })
    }

    /// True for codes 200..=210, the sync-initialization alerts.
    pub fn is_sync_init(&self) -> bool {
        (200..=210).contains(&self.as_u16())
    }
}

/// Kind of modification applied to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationType {
    Addition,
    Modification,
    Deletion,
}

/// Which side's database a modification landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifiedDatabase {
    Local,
    Remote,
}

// Wire content types.
pub const CONTTYPE_XML: &str = "application/vnd.syncml+xml";
pub const CONTTYPE_WBXML: &str = "application/vnd.syncml+wbxml";
pub const CONTTYPE_DEVINF_XML: &str = "application/vnd.syncml-devinf+xml";
pub const CONTTYPE_SAN: &str = "application/vnd.syncml.ds.notification";

// Credential formats.
pub const AUTH_FORMAT_BASIC: &str = "syncml:auth-basic";
pub const AUTH_FORMAT_MD5: &str = "syncml:auth-md5";
pub const FORMAT_ENCODING_B64: &str = "b64";
// Some deployed servers label base-64 as "bin"; it is the same encoding.
pub const FORMAT_ENCODING_BIN: &str = "bin";

// Defaults.
pub const DEFAULT_MAX_CHANGES_PER_MESSAGE: u32 = 22;
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 16384;

// Outbound size budgeting: reserve a fraction of the negotiated maximum for
// the header, statuses and closing tags the estimate cannot see yet.
pub const MAX_MSG_OVERHEAD_RATIO: f64 = 0.1;
pub const MIN_MSG_OVERHEAD_BYTES: u64 = 256;
// WbXML output compresses against our XML-based size estimate.
pub const WBXML_COMPRESSION_RATE: f64 = 0.66;
