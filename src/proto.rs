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


//! Low-level protocol encoding functions.
//!
//! Encoders produce complete frames.  Decoders operate on whatever
//! has been received so far and report [Decode::Incomplete] when
//! more bytes are needed, which is distinct from a malformed frame.
use std::net::IpAddr;

use constellation_common::net::IPEndpoint;
use constellation_common::net::IPEndpointAddr;
#[cfg(feature = "log")]
use log::error;
#[cfg(feature = "log")]
use log::trace;

use crate::error::SOCKS5Error;
use crate::params::SOCKS5Command;

const IPV4: u8 = 0x01;
const IPV6: u8 = 0x04;
const NAME: u8 = 0x03;
pub const VERSION: u8 = 0x05;

const NO_AUTH: u8 = 0x00;
const NO_METHODS: u8 = 0xff;

const CMD_SUCCESS: u8 = 0x00;
const SERVER_ERROR: u8 = 0x01;
const NOT_ALLOWED: u8 = 0x02;
const NETWORK_UNREACHABLE: u8 = 0x03;
const HOST_UNREACHABLE: u8 = 0x04;
const CONNECTION_REFUSED: u8 = 0x05;
const TTL_EXPIRED: u8 = 0x06;
const CMD_NOT_SUPPORTED: u8 = 0x07;
const ADDR_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 authentication mechanism.
///
/// Bytestreams are anonymous; any other method a peer selects is
/// reported as [SOCKS5Error::UnknownAuthNMethod].
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum AuthNMech {
    /// No authentication.
    None
}

/// SOCKS5 reply codes.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum ReplyCode {
    Success,
    ServerFailure,
    NotAllowed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TTLExpired,
    CmdNotSupported,
    AddrNotSupported
}

/// Result of decoding a frame from a possibly partial buffer.
#[derive(Debug)]
pub enum Decode<T> {
    /// Not enough bytes yet; wait for more data.
    Incomplete,
    /// A complete frame was decoded.
    Parsed {
        /// The decoded value.
        value: T,
        /// Number of bytes the frame occupied.
        consumed: usize
    },
    /// The frame is malformed.
    Invalid {
        /// The protocol error.
        error: SOCKS5Error
    }
}

/// Client greeting listing the offered authentication methods.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NegotiationRequest {
    /// Protocol version.
    version: u8,
    /// Raw method codes offered by the client.
    methods: Vec<u8>
}

/// CONNECT, BIND, or UDP ASSOCIATE request.
#[derive(Clone, Debug, PartialEq)]
pub struct SOCKS5Request {
    /// Raw command code.
    cmd: u8,
    /// Requested destination.
    target: IPEndpoint
}

/// Reply to a request.
#[derive(Clone, Debug, PartialEq)]
pub struct SOCKS5Reply {
    /// Reply code.
    code: ReplyCode,
    /// Bound address reported by the server.
    endpoint: IPEndpoint
}

/// Bounds-checked cursor over a received buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize
}

macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(val) => val,
            None => return Decode::Incomplete
        }
    };
}

impl<'a> Reader<'a> {
    #[inline]
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf: buf, pos: 0 }
    }

    #[inline]
    fn take_u8(&mut self) -> Option<u8> {
        let out = self.buf.get(self.pos).copied()?;

        self.pos += 1;

        Some(out)
    }

    #[inline]
    fn take_u16(&mut self) -> Option<u16> {
        let bytes = self.take(2)?;

        Some((bytes[0] as u16) << 8 | bytes[1] as u16)
    }

    #[inline]
    fn take(
        &mut self,
        len: usize
    ) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let out = self.buf.get(self.pos..end)?;

        self.pos = end;

        Some(out)
    }

    #[inline]
    fn consumed(&self) -> usize {
        self.pos
    }
}

impl AuthNMech {
    /// Get the protocol code for this mechanism.
    #[inline]
    pub fn code(&self) -> u8 {
        match self {
            AuthNMech::None => NO_AUTH
        }
    }

    /// Get the mechanism for a protocol code, if it is known.
    #[inline]
    pub fn from_code(code: u8) -> Option<AuthNMech> {
        match code {
            NO_AUTH => Some(AuthNMech::None),
            _ => None
        }
    }
}

impl ReplyCode {
    /// Get the protocol code for this reply.
    #[inline]
    pub fn code(&self) -> u8 {
        match self {
            ReplyCode::Success => CMD_SUCCESS,
            ReplyCode::ServerFailure => SERVER_ERROR,
            ReplyCode::NotAllowed => NOT_ALLOWED,
            ReplyCode::NetworkUnreachable => NETWORK_UNREACHABLE,
            ReplyCode::HostUnreachable => HOST_UNREACHABLE,
            ReplyCode::ConnectionRefused => CONNECTION_REFUSED,
            ReplyCode::TTLExpired => TTL_EXPIRED,
            ReplyCode::CmdNotSupported => CMD_NOT_SUPPORTED,
            ReplyCode::AddrNotSupported => ADDR_NOT_SUPPORTED
        }
    }

    /// Get the reply for a protocol code, if it is known.
    #[inline]
    pub fn from_code(code: u8) -> Option<ReplyCode> {
        match code {
            CMD_SUCCESS => Some(ReplyCode::Success),
            SERVER_ERROR => Some(ReplyCode::ServerFailure),
            NOT_ALLOWED => Some(ReplyCode::NotAllowed),
            NETWORK_UNREACHABLE => Some(ReplyCode::NetworkUnreachable),
            HOST_UNREACHABLE => Some(ReplyCode::HostUnreachable),
            CONNECTION_REFUSED => Some(ReplyCode::ConnectionRefused),
            TTL_EXPIRED => Some(ReplyCode::TTLExpired),
            CMD_NOT_SUPPORTED => Some(ReplyCode::CmdNotSupported),
            ADDR_NOT_SUPPORTED => Some(ReplyCode::AddrNotSupported),
            _ => None
        }
    }

    /// Get the error corresponding to a failure reply.
    ///
    /// Returns `None` for [ReplyCode::Success].
    #[inline]
    pub fn error(&self) -> Option<SOCKS5Error> {
        match self {
            ReplyCode::Success => None,
            ReplyCode::ServerFailure => Some(SOCKS5Error::ServerFailure),
            ReplyCode::NotAllowed => Some(SOCKS5Error::PermissionDenied),
            ReplyCode::NetworkUnreachable => {
                Some(SOCKS5Error::NetworkUnreachable)
            }
            ReplyCode::HostUnreachable => Some(SOCKS5Error::HostUnreachable),
            ReplyCode::ConnectionRefused => {
                Some(SOCKS5Error::ConnectionRefused)
            }
            ReplyCode::TTLExpired => Some(SOCKS5Error::TTLExpired),
            ReplyCode::CmdNotSupported => Some(SOCKS5Error::CmdNotSupported),
            ReplyCode::AddrNotSupported => {
                Some(SOCKS5Error::AddrTypeNotSupported)
            }
        }
    }
}

impl<T> Decode<T> {
    /// Check whether more bytes are needed.
    #[inline]
    pub fn is_incomplete(&self) -> bool {
        matches!(self, Decode::Incomplete)
    }
}

impl NegotiationRequest {
    /// Get the protocol version.
    #[inline]
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Get the raw method codes.
    #[inline]
    pub fn methods(&self) -> &[u8] {
        &self.methods
    }

    /// Check whether `mech` was offered.
    #[inline]
    pub fn offers(
        &self,
        mech: AuthNMech
    ) -> bool {
        self.methods.contains(&mech.code())
    }
}

impl SOCKS5Request {
    /// Get the raw command code.
    #[inline]
    pub fn cmd_code(&self) -> u8 {
        self.cmd
    }

    /// Get the command, if it is known.
    #[inline]
    pub fn cmd(&self) -> Option<SOCKS5Command> {
        SOCKS5Command::from_code(self.cmd)
    }

    /// Get the requested destination.
    #[inline]
    pub fn target(&self) -> &IPEndpoint {
        &self.target
    }
}

impl SOCKS5Reply {
    /// Get the reply code.
    #[inline]
    pub fn code(&self) -> ReplyCode {
        self.code
    }

    /// Get the endpoint reported in the reply.
    #[inline]
    pub fn endpoint(&self) -> &IPEndpoint {
        &self.endpoint
    }
}

/// Encode the client greeting offering `methods`.
///
/// At most 255 methods can be offered.
pub fn encode_negotiation_request(
    methods: &[AuthNMech]
) -> Result<Vec<u8>, SOCKS5Error> {
    #[cfg(feature = "log")]
    trace!(target: "socks5-protocol",
           "sending authn methods {:?}",
           methods);

    if methods.len() > u8::MAX as usize {
        #[cfg(feature = "log")]
        error!(target: "socks5-protocol",
               "cannot offer {} authentication methods",
               methods.len());

        return Err(SOCKS5Error::TooLong);
    }

    let mut buf = Vec::with_capacity(methods.len() + 2);

    buf.push(VERSION);
    buf.push(methods.len() as u8);
    buf.extend(methods.iter().map(AuthNMech::code));

    Ok(buf)
}

/// Decode a client greeting.
pub fn decode_negotiation_request(buf: &[u8]) -> Decode<NegotiationRequest> {
    let mut reader = Reader::new(buf);
    let version = need!(reader.take_u8());

    if version != VERSION {
        return Decode::Invalid {
            error: SOCKS5Error::BadVersion { version: version }
        };
    }

    let nmethods = need!(reader.take_u8());
    let methods = need!(reader.take(nmethods as usize)).to_vec();

    Decode::Parsed {
        value: NegotiationRequest {
            version: version,
            methods: methods
        },
        consumed: reader.consumed()
    }
}

/// Encode the server's method selection.
///
/// `None` indicates that no offered method was acceptable.
#[inline]
pub fn encode_method_selection(method: Option<AuthNMech>) -> [u8; 2] {
    match method {
        Some(method) => [VERSION, method.code()],
        None => [VERSION, NO_METHODS]
    }
}

/// Decode the server's method selection.
pub fn decode_method_selection(buf: &[u8]) -> Decode<AuthNMech> {
    let mut reader = Reader::new(buf);
    let version = need!(reader.take_u8());

    if version != VERSION {
        return Decode::Invalid {
            error: SOCKS5Error::BadVersion { version: version }
        };
    }

    let method = need!(reader.take_u8());

    match AuthNMech::from_code(method) {
        Some(mech) => Decode::Parsed {
            value: mech,
            consumed: reader.consumed()
        },
        None if method == NO_METHODS => {
            #[cfg(feature = "log")]
            error!(target: "socks5-protocol",
                   "peer reported no acceptable authentication methods");

            Decode::Invalid {
                error: SOCKS5Error::NoAuthNMethods
            }
        }
        None => Decode::Invalid {
            error: SOCKS5Error::UnknownAuthNMethod { method: method }
        }
    }
}

fn write_addr(
    buf: &mut Vec<u8>,
    endpoint: &IPEndpoint
) -> Result<(), SOCKS5Error> {
    match endpoint.ip_endpoint() {
        IPEndpointAddr::Addr(IpAddr::V4(addr)) => {
            buf.push(IPV4);
            buf.extend(addr.octets());
        }
        IPEndpointAddr::Addr(IpAddr::V6(addr)) => {
            buf.push(IPV6);
            buf.extend(addr.octets());
        }
        IPEndpointAddr::Name(name) => {
            let name: &str = name;

            if name.len() < 256 {
                buf.push(NAME);
                buf.push(name.len() as u8);
                buf.extend(name.as_bytes());
            } else {
                #[cfg(feature = "log")]
                error!(target: "socks5-protocol",
                       "domain name length exceeds 255 characters");

                return Err(SOCKS5Error::TooLong);
            }
        }
    }

    let port = endpoint.port();

    buf.push((port >> 8) as u8);
    buf.push((port & 0xff) as u8);

    Ok(())
}

/// Read an address of type `ty` followed by a port.
fn read_addr(
    reader: &mut Reader<'_>,
    ty: u8
) -> Result<Option<IPEndpoint>, SOCKS5Error> {
    let addr = match ty {
        IPV4 => match reader.take(4) {
            Some(octets) => {
                let ip = [octets[0], octets[1], octets[2], octets[3]];

                IPEndpointAddr::ip(IpAddr::from(ip))
            }
            None => return Ok(None)
        },
        IPV6 => match reader.take(16) {
            Some(octets) => {
                let mut ip = [0; 16];

                ip.copy_from_slice(octets);

                IPEndpointAddr::ip(IpAddr::from(ip))
            }
            None => return Ok(None)
        },
        NAME => {
            let len = match reader.take_u8() {
                Some(len) => len as usize,
                None => return Ok(None)
            };
            let name = match reader.take(len) {
                Some(name) => name,
                None => return Ok(None)
            };
            let name = String::from_utf8(name.to_vec())
                .map_err(|_| SOCKS5Error::BadDNSName)?;

            IPEndpointAddr::name(name)
        }
        ty => return Err(SOCKS5Error::BadAddrType { ty: ty })
    };

    Ok(reader.take_u16().map(|port| IPEndpoint::new(addr, port)))
}

/// Read the common header of requests and replies.
///
/// Returns the second byte (command or reply code) and the address
/// type.
fn read_header(reader: &mut Reader<'_>) -> Decode<(u8, u8)> {
    let version = need!(reader.take_u8());

    if version != VERSION {
        return Decode::Invalid {
            error: SOCKS5Error::BadVersion { version: version }
        };
    }

    let kind = need!(reader.take_u8());
    let reserved = need!(reader.take_u8());

    if reserved != 0 {
        return Decode::Invalid {
            error: SOCKS5Error::BadReserved { reserved: reserved }
        };
    }

    let ty = need!(reader.take_u8());

    Decode::Parsed {
        value: (kind, ty),
        consumed: reader.consumed()
    }
}

/// Encode a request carrying `cmd` for `target`.
pub fn encode_request(
    cmd: SOCKS5Command,
    target: &IPEndpoint
) -> Result<Vec<u8>, SOCKS5Error> {
    #[cfg(feature = "log")]
    trace!(target: "socks5-protocol",
           "encoding command {}, address {}",
           cmd, target);

    let mut buf = Vec::with_capacity(22);

    buf.push(VERSION);
    buf.push(cmd as u8);
    buf.push(0x00);
    write_addr(&mut buf, target)?;

    Ok(buf)
}

/// Encode a CONNECT request for `target`.
#[inline]
pub fn encode_connect_request(
    target: &IPEndpoint
) -> Result<Vec<u8>, SOCKS5Error> {
    encode_request(SOCKS5Command::Connect, target)
}

/// Decode a request.
///
/// Unknown command codes are not an error at this level; the raw
/// code is preserved so that the server can refuse it properly.
pub fn decode_connect_request(buf: &[u8]) -> Decode<SOCKS5Request> {
    let mut reader = Reader::new(buf);
    let (cmd, ty) = match read_header(&mut reader) {
        Decode::Parsed { value, .. } => value,
        Decode::Incomplete => return Decode::Incomplete,
        Decode::Invalid { error } => return Decode::Invalid { error: error }
    };

    match read_addr(&mut reader, ty) {
        Ok(Some(target)) => Decode::Parsed {
            value: SOCKS5Request {
                cmd: cmd,
                target: target
            },
            consumed: reader.consumed()
        },
        Ok(None) => Decode::Incomplete,
        Err(err) => Decode::Invalid { error: err }
    }
}

/// Encode a reply with `code` reporting `endpoint`.
pub fn encode_reply(
    code: ReplyCode,
    endpoint: &IPEndpoint
) -> Result<Vec<u8>, SOCKS5Error> {
    let mut buf = Vec::with_capacity(22);

    buf.push(VERSION);
    buf.push(code.code());
    buf.push(0x00);
    write_addr(&mut buf, endpoint)?;

    Ok(buf)
}

/// Encode an error reply.
///
/// Error replies carry the unspecified IPv4 address and port zero.
#[inline]
pub fn encode_error_reply(code: ReplyCode) -> [u8; 10] {
    [VERSION, code.code(), 0x00, IPV4, 0, 0, 0, 0, 0, 0]
}

/// Decode a reply.
pub fn decode_reply(buf: &[u8]) -> Decode<SOCKS5Reply> {
    let mut reader = Reader::new(buf);
    let (kind, ty) = match read_header(&mut reader) {
        Decode::Parsed { value, .. } => value,
        Decode::Incomplete => return Decode::Incomplete,
        Decode::Invalid { error } => return Decode::Invalid { error: error }
    };
    let code = match ReplyCode::from_code(kind) {
        Some(code) => code,
        None => {
            return Decode::Invalid {
                error: SOCKS5Error::BadCmdReplyKind { kind: kind }
            }
        }
    };

    match read_addr(&mut reader, ty) {
        Ok(Some(endpoint)) => Decode::Parsed {
            value: SOCKS5Reply {
                code: code,
                endpoint: endpoint
            },
            consumed: reader.consumed()
        },
        Ok(None) => Decode::Incomplete,
        Err(err) => Decode::Invalid { error: err }
    }
}

#[cfg(test)]
fn expect_parsed<T>(res: Decode<T>) -> (T, usize) {
    match res {
        Decode::Parsed { value, consumed } => (value, consumed),
        Decode::Incomplete => panic!("Expected parsed, got incomplete"),
        Decode::Invalid { error } => {
            panic!("Expected parsed, got error {}", error)
        }
    }
}

#[test]
fn test_encode_negotiation_request_no_auth() {
    let expected = [0x05, 0x01, 0x00];

    assert_eq!(
        encode_negotiation_request(&[AuthNMech::None]).expect("Expected success"),
        expected
    );
}

#[test]
fn test_encode_negotiation_request_too_many() {
    let methods = vec![AuthNMech::None; 255];
    let msg = encode_negotiation_request(&methods).expect("Expected success");

    assert_eq!(msg.len(), 257);
    assert_eq!(msg[1], 0xff);

    let methods = vec![AuthNMech::None; 256];

    match encode_negotiation_request(&methods) {
        Err(SOCKS5Error::TooLong) => {}
        res => panic!("Expected too long, got {:?}", res)
    }
}

#[test]
fn test_decode_negotiation_request() {
    let msg = [0x05, 0x02, 0x02, 0x00];
    let (req, consumed) = expect_parsed(decode_negotiation_request(&msg));

    assert_eq!(consumed, 4);
    assert_eq!(req.version(), 5);
    assert_eq!(req.methods(), &[0x02, 0x00]);
    assert!(req.offers(AuthNMech::None));

    let msg = [0x05, 0x01, 0x02];
    let (req, _) = expect_parsed(decode_negotiation_request(&msg));

    assert!(!req.offers(AuthNMech::None));
}

#[test]
fn test_decode_negotiation_request_leaves_remainder() {
    let msg = [0x05, 0x01, 0x00, 0x05, 0x01];
    let (_, consumed) = expect_parsed(decode_negotiation_request(&msg));

    assert_eq!(consumed, 3);
}

#[test]
fn test_decode_negotiation_request_short() {
    assert!(decode_negotiation_request(&[]).is_incomplete());
    assert!(decode_negotiation_request(&[0x05]).is_incomplete());
    assert!(decode_negotiation_request(&[0x05, 0x03, 0x00]).is_incomplete());
}

#[test]
fn test_decode_negotiation_request_bad_version() {
    match decode_negotiation_request(&[0x04, 0x01, 0x00]) {
        Decode::Invalid {
            error: SOCKS5Error::BadVersion { version: 4 }
        } => {}
        res => panic!("Expected bad version, got {:?}", res)
    }
}

#[test]
fn test_encode_method_selection() {
    assert_eq!(encode_method_selection(Some(AuthNMech::None)), [0x05, 0x00]);
    assert_eq!(encode_method_selection(None), [0x05, 0xff]);
}

#[test]
fn test_decode_method_selection() {
    let (mech, consumed) = expect_parsed(decode_method_selection(&[0x05, 0x00]));

    assert_eq!(mech, AuthNMech::None);
    assert_eq!(consumed, 2);

    match decode_method_selection(&[0x05, 0xff]) {
        Decode::Invalid {
            error: SOCKS5Error::NoAuthNMethods
        } => {}
        res => panic!("Expected no methods, got {:?}", res)
    }

    match decode_method_selection(&[0x05, 0x02]) {
        Decode::Invalid {
            error: SOCKS5Error::UnknownAuthNMethod { method: 0x02 }
        } => {}
        res => panic!("Expected unknown method, got {:?}", res)
    }
}

#[test]
fn test_encode_connect_ipv4() {
    let ip = IPEndpointAddr::ip(IpAddr::from([0x01, 0x02, 0x03, 0x04]));
    let endpoint = IPEndpoint::new(ip, 0x1337);
    let expected = [0x05, 0x01, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x13, 0x37];
    let msg = encode_connect_request(&endpoint).expect("Expected success");

    assert_eq!(msg, expected);
}

#[test]
fn test_encode_connect_name() {
    let ip = IPEndpointAddr::name(String::from("ABCD"));
    let endpoint = IPEndpoint::new(ip, 0x1337);
    let expected = [
        0x05, 0x01, 0x00, 0x03, 0x04, 0x41, 0x42, 0x43, 0x44, 0x13, 0x37
    ];
    let msg = encode_connect_request(&endpoint).expect("Expected success");

    assert_eq!(msg, expected);
}

#[test]
fn test_encode_connect_ipv6() {
    let ip = IPEndpointAddr::ip(IpAddr::from([
        0x01, 0x02, 0x03, 0x04, 0x11, 0x12, 0x13, 0x14, 0x21, 0x22, 0x23, 0x24,
        0x31, 0x32, 0x33, 0x34
    ]));
    let endpoint = IPEndpoint::new(ip, 0x1337);
    let expected = [
        0x05, 0x01, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04, 0x11, 0x12, 0x13, 0x14,
        0x21, 0x22, 0x23, 0x24, 0x31, 0x32, 0x33, 0x34, 0x13, 0x37
    ];
    let msg = encode_connect_request(&endpoint).expect("Expected success");

    assert_eq!(msg, expected);
}

#[test]
fn test_encode_connect_name_too_long() {
    let ip = IPEndpointAddr::name("a".repeat(256));
    let endpoint = IPEndpoint::new(ip, 0);

    match encode_connect_request(&endpoint) {
        Err(SOCKS5Error::TooLong) => {}
        res => panic!("Expected too long, got {:?}", res)
    }
}

#[test]
fn test_connect_request_round_trip() {
    let endpoints = [
        IPEndpoint::new(IPEndpointAddr::ip(IpAddr::from([127, 0, 0, 1])), 80),
        IPEndpoint::new(
            IPEndpointAddr::name(String::from(
                "137c70eeb47270b68fe23c2ef7a04b0c13fb7f86"
            )),
            0
        ),
        IPEndpoint::new(
            IPEndpointAddr::ip(IpAddr::from([0xfe80, 0, 0, 0, 0, 0, 0, 1])),
            65535
        )
    ];

    for endpoint in endpoints.iter() {
        let msg = encode_connect_request(endpoint).expect("Expected success");
        let (req, consumed) = expect_parsed(decode_connect_request(&msg));

        assert_eq!(consumed, msg.len());
        assert_eq!(req.cmd(), Some(SOCKS5Command::Connect));
        assert_eq!(req.target(), endpoint);
    }
}

#[test]
fn test_decode_connect_byte_at_a_time() {
    let msg = [
        0x05, 0x01, 0x00, 0x03, 0x04, 0x41, 0x42, 0x43, 0x44, 0x13, 0x37
    ];

    for len in 0..msg.len() {
        assert!(
            decode_connect_request(&msg[..len]).is_incomplete(),
            "prefix of length {} should be incomplete",
            len
        );
    }

    let (req, consumed) = expect_parsed(decode_connect_request(&msg));
    let ip = IPEndpointAddr::name(String::from("ABCD"));

    assert_eq!(consumed, msg.len());
    assert_eq!(req.target(), &IPEndpoint::new(ip, 0x1337));
}

#[test]
fn test_decode_connect_bad_addr_type() {
    let msg = [0x05, 0x01, 0x00, 0x07, 0x00];

    match decode_connect_request(&msg) {
        Decode::Invalid {
            error: SOCKS5Error::BadAddrType { ty: 7 }
        } => {}
        res => panic!("Expected bad address type, got {:?}", res)
    }
}

#[test]
fn test_decode_connect_bad_reserved() {
    let msg = [0x05, 0x01, 0x01, 0x03];

    match decode_connect_request(&msg) {
        Decode::Invalid {
            error: SOCKS5Error::BadReserved { reserved: 1 }
        } => {}
        res => panic!("Expected bad reserved, got {:?}", res)
    }
}

#[test]
fn test_decode_connect_bad_name() {
    let msg = [0x05, 0x01, 0x00, 0x03, 0x02, 0xff, 0xfe, 0x00, 0x00];

    match decode_connect_request(&msg) {
        Decode::Invalid {
            error: SOCKS5Error::BadDNSName
        } => {}
        res => panic!("Expected bad DNS name, got {:?}", res)
    }
}

#[test]
fn test_decode_connect_bind() {
    let msg = [0x05, 0x02, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x13, 0x37];
    let (req, _) = expect_parsed(decode_connect_request(&msg));

    assert_eq!(req.cmd(), Some(SOCKS5Command::Bind));
    assert_eq!(req.cmd_code(), 0x02);
}

#[test]
fn test_encode_reply_name() {
    let ip = IPEndpointAddr::name(String::from("ABCD"));
    let endpoint = IPEndpoint::new(ip, 0);
    let expected = [
        0x05, 0x00, 0x00, 0x03, 0x04, 0x41, 0x42, 0x43, 0x44, 0x00, 0x00
    ];
    let msg =
        encode_reply(ReplyCode::Success, &endpoint).expect("Expected success");

    assert_eq!(msg, expected);
}

#[test]
fn test_encode_error_reply() {
    let expected = [0x05, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

    assert_eq!(encode_error_reply(ReplyCode::ConnectionRefused), expected);
}

#[test]
fn test_decode_reply_ipv4() {
    let msg = [0x05, 0x00, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0x13, 0x37];
    let (reply, consumed) = expect_parsed(decode_reply(&msg));
    let ip = IPEndpointAddr::ip(IpAddr::from([0x01, 0x02, 0x03, 0x04]));

    assert_eq!(consumed, 10);
    assert_eq!(reply.code(), ReplyCode::Success);
    assert_eq!(reply.endpoint(), &IPEndpoint::new(ip, 0x1337));
}

#[test]
fn test_decode_reply_ipv6() {
    let msg = [
        0x05, 0x00, 0x00, 0x04, 0x01, 0x02, 0x03, 0x04, 0x11, 0x12, 0x13, 0x14,
        0x21, 0x22, 0x23, 0x24, 0x31, 0x32, 0x33, 0x34, 0x13, 0x37
    ];
    let (reply, consumed) = expect_parsed(decode_reply(&msg));
    let ip = IPEndpointAddr::ip(IpAddr::from([
        0x01, 0x02, 0x03, 0x04, 0x11, 0x12, 0x13, 0x14, 0x21, 0x22, 0x23, 0x24,
        0x31, 0x32, 0x33, 0x34
    ]));

    assert_eq!(consumed, 22);
    assert_eq!(reply.endpoint(), &IPEndpoint::new(ip, 0x1337));
}

#[test]
fn test_decode_reply_failure_codes() {
    let codes = [
        (0x01, ReplyCode::ServerFailure),
        (0x02, ReplyCode::NotAllowed),
        (0x03, ReplyCode::NetworkUnreachable),
        (0x04, ReplyCode::HostUnreachable),
        (0x05, ReplyCode::ConnectionRefused),
        (0x06, ReplyCode::TTLExpired),
        (0x07, ReplyCode::CmdNotSupported),
        (0x08, ReplyCode::AddrNotSupported)
    ];

    for (raw, code) in codes.iter() {
        let msg = [0x05, *raw, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let (reply, _) = expect_parsed(decode_reply(&msg));

        assert_eq!(reply.code(), *code);
        assert!(reply.code().error().is_some());
    }
}

#[test]
fn test_decode_reply_unknown_code() {
    let msg = [0x05, 0x09, 0x00, 0x01];

    match decode_reply(&msg) {
        Decode::Invalid {
            error: SOCKS5Error::BadCmdReplyKind { kind: 9 }
        } => {}
        res => panic!("Expected bad reply kind, got {:?}", res)
    }
}

#[test]
fn test_decode_reply_byte_at_a_time() {
    let msg = [
        0x05, 0x00, 0x00, 0x03, 0x04, 0x41, 0x42, 0x43, 0x44, 0x00, 0x00
    ];

    for len in 0..msg.len() {
        assert!(decode_reply(&msg[..len]).is_incomplete());
    }

    let (reply, _) = expect_parsed(decode_reply(&msg));

    assert_eq!(reply.code(), ReplyCode::Success);
}
