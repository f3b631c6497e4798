// Copyright © 2024 The Johns Hopkins Applied Physics Laboratory LLC.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Affero General Public License,
// version 3, as published by the Free Software Foundation.  If you
// would like to purchase a commercial license for this software, please
// contact APL’s Tech Transfer at 240-592-0817 or
// techtransfer@jhuapl.edu.
//
// This program is distributed in the hope that it will be useful, but
// WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.


//! Errors that can occur in the SOCKS5 bytestreams protocol.
//!
//! Errors come in layers.  [SOCKS5Error] covers the wire protocol
//! itself and never leaves the connection state machine; it is
//! translated into a [FailureReason] before it reaches the session
//! registry.  [RegistryError] and [BytestreamError] are reported to
//! the caller of the registry and the manager respectively.
use std::fmt::Display;
use std::fmt::Formatter;
use std::io::Error;

use constellation_common::error::ErrorScope;
use constellation_common::error::ScopedError;

/// Errors that can occur in the SOCKS5 negotiation protocol.
#[derive(Debug)]
pub enum SOCKS5Error {
    /// Unknown authentication method.
    UnknownAuthNMethod {
        /// Authentication method code.
        method: u8
    },
    /// Wrong protocol version.
    BadVersion {
        /// The protocol version.
        version: u8
    },
    /// Wrong reserved value.
    BadReserved {
        /// The value in the reserved slot.
        reserved: u8
    },
    /// Unexpected command reply code.
    BadCmdReplyKind {
        /// The reply code.
        kind: u8
    },
    /// Unknown address type.
    BadAddrType {
        /// Address type.
        ty: u8
    },
    /// Couldn't parse DNS name.
    BadDNSName,
    /// Peer rejected authentication methods.
    NoAuthNMethods,
    /// String was too long.
    TooLong,
    /// Internal proxy server failure.
    ServerFailure,
    /// Proxy server reported permission denied.
    PermissionDenied,
    /// Proxy server reported network unreachable.
    NetworkUnreachable,
    /// Proxy server reported host unreachable.
    HostUnreachable,
    /// Proxy server reported connection refused.
    ConnectionRefused,
    /// Proxy server reported TTL expired;
    TTLExpired,
    /// Proxy server reported command not supported.
    CmdNotSupported,
    /// Proxy server reported address type not supported.
    AddrTypeNotSupported
}

/// Reason a bytestream session failed.
///
/// This is what the failure callback of a session receives.  Every
/// lower-level error is mapped onto one of these before it reaches
/// the [SessionRegistry](crate::registry::SessionRegistry).
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum FailureReason {
    /// Malformed or unsupported frame, or a rejected activation.
    ProtocolError,
    /// The session was not activated before its deadline.
    Timeout,
    /// None of the streamhost candidates could be used.
    NoRoute,
    /// The socket dropped before the transfer completed.
    ConnectionLost,
    /// The session was torn down by the signaling layer.
    Cancelled
}

/// Errors reported by the session registry.
#[derive(Debug, Eq, PartialEq)]
pub enum RegistryError {
    /// A session with this id already exists.
    DuplicateSession {
        /// The session id.
        sid: String
    },
    /// A live session already uses this hash.
    HashCollision {
        /// The session hash.
        hash: String
    },
    /// No session exists with this id.
    NotFound {
        /// The session id.
        sid: String
    },
    /// A connection is already bound to this session.
    AlreadyBound {
        /// The session id.
        sid: String
    },
    /// Mutex was poisoned.
    MutexPoison
}

/// Errors reported by the
/// [BytestreamManager](crate::manager::BytestreamManager).
#[derive(Debug)]
pub enum BytestreamError {
    /// Session registry error.
    Registry {
        /// The registry error.
        error: RegistryError
    },
    /// A low-level IO error occurred.
    IOError {
        /// The IO-level error.
        error: Error
    }
}

impl FailureReason {
    /// Get the short code for this reason.
    ///
    /// These are the reason strings reported to the signaling layer.
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::ProtocolError => "PROTOCOL_ERROR",
            FailureReason::Timeout => "TIMEOUT",
            FailureReason::NoRoute => "NO_ROUTE",
            FailureReason::ConnectionLost => "CONNECTION_LOST",
            FailureReason::Cancelled => "CANCELLED"
        }
    }
}

impl From<&SOCKS5Error> for FailureReason {
    /// Every wire protocol error fails the session as a protocol
    /// error; socket errors never pass through the codec.
    #[inline]
    fn from(_: &SOCKS5Error) -> FailureReason {
        FailureReason::ProtocolError
    }
}

impl From<RegistryError> for BytestreamError {
    #[inline]
    fn from(val: RegistryError) -> BytestreamError {
        BytestreamError::Registry { error: val }
    }
}

impl From<Error> for BytestreamError {
    #[inline]
    fn from(val: Error) -> BytestreamError {
        BytestreamError::IOError { error: val }
    }
}

impl ScopedError for SOCKS5Error {
    fn scope(&self) -> ErrorScope {
        match self {
            // Protocol errors that kill the session.
            SOCKS5Error::UnknownAuthNMethod { .. } |
            SOCKS5Error::BadVersion { .. } |
            SOCKS5Error::BadCmdReplyKind { .. } |
            SOCKS5Error::BadAddrType { .. } |
            SOCKS5Error::BadReserved { .. } |
            SOCKS5Error::ServerFailure |
            SOCKS5Error::BadDNSName => ErrorScope::Session,
            // Issues with the other party or network.
            SOCKS5Error::NoAuthNMethods |
            SOCKS5Error::PermissionDenied |
            SOCKS5Error::NetworkUnreachable |
            SOCKS5Error::HostUnreachable |
            SOCKS5Error::ConnectionRefused |
            SOCKS5Error::TTLExpired |
            SOCKS5Error::CmdNotSupported |
            SOCKS5Error::AddrTypeNotSupported => ErrorScope::External,
            // Message level errors.
            SOCKS5Error::TooLong => ErrorScope::Msg
        }
    }
}

impl ScopedError for FailureReason {
    fn scope(&self) -> ErrorScope {
        match self {
            FailureReason::ProtocolError |
            FailureReason::ConnectionLost |
            FailureReason::Cancelled => ErrorScope::Session,
            FailureReason::Timeout | FailureReason::NoRoute => {
                ErrorScope::External
            }
        }
    }
}

impl ScopedError for RegistryError {
    fn scope(&self) -> ErrorScope {
        match self {
            RegistryError::DuplicateSession { .. } |
            RegistryError::HashCollision { .. } |
            RegistryError::NotFound { .. } |
            RegistryError::AlreadyBound { .. } => ErrorScope::Session,
            RegistryError::MutexPoison => ErrorScope::Unrecoverable
        }
    }
}

impl ScopedError for BytestreamError {
    fn scope(&self) -> ErrorScope {
        match self {
            BytestreamError::Registry { error } => error.scope(),
            BytestreamError::IOError { error } => error.scope()
        }
    }
}

impl Display for SOCKS5Error {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            SOCKS5Error::NoAuthNMethods => {
                write!(f, "no acceptable authentication methods")
            }
            SOCKS5Error::BadVersion { version } => {
                write!(f, "bad protocol version {}", version)
            }
            SOCKS5Error::BadReserved { reserved } => {
                write!(f, "bad reserved value ({})", reserved)
            }
            SOCKS5Error::BadAddrType { ty } => {
                write!(f, "bad address type ({})", ty)
            }
            SOCKS5Error::BadCmdReplyKind { kind } => {
                write!(f, "bad command reply kind ({})", kind)
            }
            SOCKS5Error::TooLong => write!(f, "string parameter too long"),
            SOCKS5Error::BadDNSName => {
                write!(f, "UTF-8 error while decoding DNS name")
            }
            SOCKS5Error::ServerFailure => {
                write!(f, "internal proxy server failure")
            }
            SOCKS5Error::PermissionDenied => write!(f, "permission denied"),
            SOCKS5Error::NetworkUnreachable => write!(f, "network unreachable"),
            SOCKS5Error::HostUnreachable => write!(f, "host unreachable"),
            SOCKS5Error::ConnectionRefused => write!(f, "connection refused"),
            SOCKS5Error::TTLExpired => write!(f, "TTL expired"),
            SOCKS5Error::AddrTypeNotSupported => {
                write!(f, "address type not supported")
            }
            SOCKS5Error::CmdNotSupported => write!(f, "command not supported"),
            SOCKS5Error::UnknownAuthNMethod { method } => {
                write!(f, "unknown authentication method {}", method)
            }
        }
    }
}

impl Display for FailureReason {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            FailureReason::ProtocolError => write!(f, "protocol error"),
            FailureReason::Timeout => write!(f, "session timed out"),
            FailureReason::NoRoute => {
                write!(f, "no usable streamhost candidate")
            }
            FailureReason::ConnectionLost => write!(f, "connection lost"),
            FailureReason::Cancelled => write!(f, "session cancelled")
        }
    }
}

impl Display for RegistryError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            RegistryError::DuplicateSession { sid } => {
                write!(f, "session {} already exists", sid)
            }
            RegistryError::HashCollision { hash } => {
                write!(f, "session hash {} already in use", hash)
            }
            RegistryError::NotFound { sid } => {
                write!(f, "no session with id {}", sid)
            }
            RegistryError::AlreadyBound { sid } => {
                write!(f, "session {} already has a connection", sid)
            }
            RegistryError::MutexPoison => write!(f, "mutex poisoned")
        }
    }
}

impl Display for BytestreamError {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        match self {
            BytestreamError::Registry { error } => error.fmt(f),
            BytestreamError::IOError { error } => write!(f, "{}", error)
        }
    }
}

#[test]
fn test_failure_reason_from_socks5_error() {
    let err = SOCKS5Error::BadVersion { version: 4 };

    assert_eq!(FailureReason::from(&err), FailureReason::ProtocolError);

    let err = SOCKS5Error::UnknownAuthNMethod { method: 0x02 };

    assert_eq!(FailureReason::from(&err), FailureReason::ProtocolError);
    assert!(matches!(err.scope(), ErrorScope::Session));
    assert!(matches!(SOCKS5Error::TooLong.scope(), ErrorScope::Msg));
}

#[test]
fn test_failure_reason_codes() {
    assert_eq!(FailureReason::Timeout.code(), "TIMEOUT");
    assert_eq!(FailureReason::NoRoute.code(), "NO_ROUTE");
    assert_eq!(FailureReason::ConnectionLost.code(), "CONNECTION_LOST");
    assert_eq!(FailureReason::ProtocolError.code(), "PROTOCOL_ERROR");
}
