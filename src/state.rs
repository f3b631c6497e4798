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


//! SOCKS5 bytestream connection state machine.
//!
//! A [Connection] tracks the negotiation state of one raw TCP
//! socket.  It performs no IO itself: the driver feeds it [Event]s
//! and carries out the [Effect]s it returns.  There are two tracks.
//! The server track is run by the requester for inbound connections
//! from targets, and accepts only `CONNECT` requests whose domain
//! name is a known session hash.  The client track is run by the
//! target (and by the requester when it connects out to a proxy),
//! and requests the session hash with port zero.
use std::mem::take;

use constellation_common::net::IPEndpoint;
use constellation_common::net::IPEndpointAddr;
#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::warn;

use crate::error::FailureReason;
use crate::error::SOCKS5Error;
use crate::params::SOCKS5Command;
use crate::proto;
use crate::proto::AuthNMech;
use crate::proto::Decode;
use crate::proto::ReplyCode;

/// Role of the local side of a connection.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Role {
    /// SOCKS5 server for an inbound target connection.
    Requester,
    /// SOCKS5 client connecting to a streamhost.
    Target {
        /// Session hash to request.
        hash: String
    },
    /// SOCKS5 client connecting out to a mediating proxy.
    ProxyRelay {
        /// Session hash to request.
        hash: String
    }
}

/// Connection states.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SOCKS5State {
    /// Waiting for the client's method negotiation.
    Initial,
    /// Anonymous authentication selected; waiting for the request.
    AuthNegotiated,
    /// `CONNECT` parsed; waiting for the hash to be resolved.
    RequestReceived {
        /// The requested session hash.
        hash: String
    },
    /// Handshake complete; bytes are payload.
    Ready {
        /// Session this connection belongs to.
        sid: String
    },
    /// Waiting for the socket to connect.
    TargetInitial,
    /// Method negotiation sent; waiting for the selection.
    TargetAuthSent,
    /// `CONNECT` sent; waiting for the reply.
    TargetRequestSent,
    /// Handshake complete; bytes are payload.
    TargetReady,
    /// Terminal state.
    Closed
}

/// Inputs to the state machine.
#[derive(Debug)]
pub enum Event<'a> {
    /// The underlying socket connected.
    ConnectionMade,
    /// Bytes arrived from the peer.
    DataReceived(&'a [u8]),
    /// Result of a [Effect::Resolve], carrying the session id if the
    /// hash is known.
    Resolved(Option<String>),
    /// The socket closed.
    ConnectionLost {
        /// Whether the peer closed cleanly.
        clean: bool
    },
    /// The negotiation deadline expired.
    TimerFired
}

/// Actions the driver must carry out.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Effect {
    /// Write bytes to the socket.
    Send(Vec<u8>),
    /// Look up a session hash and report back with
    /// [Event::Resolved].
    Resolve {
        /// The session hash.
        hash: String
    },
    /// The handshake completed.
    Activated,
    /// Payload bytes, in order of receipt.
    Payload(Vec<u8>),
    /// The payload stream ended cleanly.
    Finished,
    /// The bound session failed.
    Fail(FailureReason),
    /// Drop the socket.
    Close
}

/// Negotiation state of one connection.
#[derive(Debug)]
pub struct Connection {
    role: Role,
    state: SOCKS5State,
    /// Received bytes not yet making up a complete unit.
    buf: Vec<u8>
}

impl Connection {
    /// Create a server-track connection for an inbound socket.
    #[inline]
    pub fn requester() -> Self {
        Connection {
            role: Role::Requester,
            state: SOCKS5State::Initial,
            buf: Vec::new()
        }
    }

    /// Create a client-track connection requesting `hash`.
    #[inline]
    pub fn target(hash: String) -> Self {
        Connection {
            role: Role::Target { hash: hash },
            state: SOCKS5State::TargetInitial,
            buf: Vec::new()
        }
    }

    /// Create a client-track connection to a mediating proxy.
    #[inline]
    pub fn proxy_relay(hash: String) -> Self {
        Connection {
            role: Role::ProxyRelay { hash: hash },
            state: SOCKS5State::TargetInitial,
            buf: Vec::new()
        }
    }

    #[inline]
    pub fn role(&self) -> &Role {
        &self.role
    }

    #[inline]
    pub fn state(&self) -> &SOCKS5State {
        &self.state
    }

    /// Check whether the handshake has completed.
    #[inline]
    pub fn is_ready(&self) -> bool {
        matches!(self.state, SOCKS5State::Ready { .. } | SOCKS5State::TargetReady)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.state == SOCKS5State::Closed
    }

    /// Get the session id resolved by the server track.
    #[inline]
    pub fn sid(&self) -> Option<&str> {
        match &self.state {
            SOCKS5State::Ready { sid } => Some(sid),
            _ => None
        }
    }

    /// Check whether the local side writes the file on this
    /// connection once it is ready.
    #[inline]
    pub fn sends_payload(&self) -> bool {
        !matches!(self.role, Role::Target { .. })
    }

    /// Whether a failure on this connection should be reported to a
    /// session.
    ///
    /// Client tracks always belong to a session; the server track
    /// only once the hash has been resolved.
    #[inline]
    fn bound(&self) -> bool {
        match self.role {
            Role::Requester => matches!(self.state, SOCKS5State::Ready { .. }),
            _ => true
        }
    }

    #[inline]
    fn hash(&self) -> Option<&str> {
        match &self.role {
            Role::Target { hash } | Role::ProxyRelay { hash } => Some(hash),
            Role::Requester => None
        }
    }

    /// Feed one event through the machine.
    pub fn step(
        mut self,
        event: Event<'_>
    ) -> (Self, Vec<Effect>) {
        let mut effects = Vec::new();

        match event {
            Event::ConnectionMade => self.connection_made(&mut effects),
            Event::DataReceived(data) => {
                if !self.is_closed() {
                    self.buf.extend_from_slice(data);
                    self.process(&mut effects);
                }
            }
            Event::Resolved(sid) => self.resolved(sid, &mut effects),
            Event::ConnectionLost { clean } => {
                self.connection_lost(clean, &mut effects)
            }
            Event::TimerFired => {
                if !self.is_ready() && !self.is_closed() {
                    #[cfg(feature = "log")]
                    warn!(target: "socks5-protocol",
                          "negotiation timed out in state {:?}",
                          self.state);

                    self.fail(FailureReason::Timeout, &mut effects)
                }
            }
        }

        (self, effects)
    }

    fn close(
        &mut self,
        effects: &mut Vec<Effect>
    ) {
        self.state = SOCKS5State::Closed;
        self.buf.clear();
        effects.push(Effect::Close);
    }

    fn fail(
        &mut self,
        reason: FailureReason,
        effects: &mut Vec<Effect>
    ) {
        if self.bound() {
            effects.push(Effect::Fail(reason))
        }

        self.close(effects)
    }

    fn refuse(
        &mut self,
        code: ReplyCode,
        effects: &mut Vec<Effect>
    ) {
        #[cfg(feature = "log")]
        debug!(target: "socks5-protocol",
               "refusing request with {:?}",
               code);

        effects.push(Effect::Send(proto::encode_error_reply(code).to_vec()));
        self.close(effects)
    }

    fn connection_made(
        &mut self,
        effects: &mut Vec<Effect>
    ) {
        if self.state == SOCKS5State::TargetInitial {
            match proto::encode_negotiation_request(&[AuthNMech::None]) {
                Ok(msg) => {
                    effects.push(Effect::Send(msg));
                    self.state = SOCKS5State::TargetAuthSent;
                    self.process(effects)
                }
                Err(_) => self.fail(FailureReason::ProtocolError, effects)
            }
        }
    }

    fn resolved(
        &mut self,
        sid: Option<String>,
        effects: &mut Vec<Effect>
    ) {
        let hash = match &self.state {
            SOCKS5State::RequestReceived { hash } => hash.clone(),
            _ => return
        };

        match sid {
            Some(sid) => {
                let endpoint = IPEndpoint::new(IPEndpointAddr::name(hash), 0);

                match proto::encode_reply(ReplyCode::Success, &endpoint) {
                    Ok(msg) => {
                        #[cfg(feature = "log")]
                        debug!(target: "socks5-protocol",
                               "connection ready for session {}",
                               sid);

                        effects.push(Effect::Send(msg));
                        effects.push(Effect::Activated);
                        self.state = SOCKS5State::Ready { sid: sid };
                        self.process(effects)
                    }
                    Err(_) => self.refuse(ReplyCode::ServerFailure, effects)
                }
            }
            None => {
                #[cfg(feature = "log")]
                debug!(target: "socks5-protocol",
                       "unknown session hash {}",
                       hash);

                self.refuse(ReplyCode::ConnectionRefused, effects)
            }
        }
    }

    fn connection_lost(
        &mut self,
        clean: bool,
        effects: &mut Vec<Effect>
    ) {
        if self.is_closed() {
            return;
        }

        if self.is_ready() {
            if clean {
                effects.push(Effect::Finished);
                self.close(effects)
            } else {
                self.fail(FailureReason::ConnectionLost, effects)
            }
        } else {
            #[cfg(feature = "log")]
            debug!(target: "socks5-protocol",
                   "connection lost in state {:?}",
                   self.state);

            self.fail(FailureReason::ConnectionLost, effects)
        }
    }

    /// Consume as many complete units from the buffer as possible.
    fn process(
        &mut self,
        effects: &mut Vec<Effect>
    ) {
        loop {
            let progressed = match self.state {
                SOCKS5State::Initial => self.read_negotiation(effects),
                SOCKS5State::AuthNegotiated => self.read_request(effects),
                SOCKS5State::TargetAuthSent => self.read_selection(effects),
                SOCKS5State::TargetRequestSent => self.read_reply(effects),
                SOCKS5State::Ready { .. } | SOCKS5State::TargetReady => {
                    if !self.buf.is_empty() {
                        effects.push(Effect::Payload(take(&mut self.buf)))
                    }

                    false
                }
                SOCKS5State::RequestReceived { .. } |
                SOCKS5State::TargetInitial |
                SOCKS5State::Closed => false
            };

            if !progressed {
                return;
            }
        }
    }

    fn read_negotiation(
        &mut self,
        effects: &mut Vec<Effect>
    ) -> bool {
        match proto::decode_negotiation_request(&self.buf) {
            Decode::Incomplete => false,
            Decode::Parsed { value, consumed } => {
                self.buf.drain(..consumed);

                if value.offers(AuthNMech::None) {
                    let msg = proto::encode_method_selection(Some(AuthNMech::None));

                    effects.push(Effect::Send(msg.to_vec()));
                    self.state = SOCKS5State::AuthNegotiated;

                    true
                } else {
                    #[cfg(feature = "log")]
                    debug!(target: "socks5-protocol",
                           "no acceptable method in {:?}",
                           value.methods());

                    let msg = proto::encode_method_selection(None);

                    effects.push(Effect::Send(msg.to_vec()));
                    self.close(effects);

                    false
                }
            }
            Decode::Invalid { error } => {
                #[cfg(feature = "log")]
                debug!(target: "socks5-protocol",
                       "bad negotiation request ({})",
                       error);

                let msg = proto::encode_method_selection(None);

                effects.push(Effect::Send(msg.to_vec()));
                self.close(effects);

                false
            }
        }
    }

    fn read_request(
        &mut self,
        effects: &mut Vec<Effect>
    ) -> bool {
        match proto::decode_connect_request(&self.buf) {
            Decode::Incomplete => false,
            Decode::Parsed { value, consumed } => {
                self.buf.drain(..consumed);

                match (value.cmd(), value.target().ip_endpoint()) {
                    (Some(SOCKS5Command::Connect), IPEndpointAddr::Name(name)) => {
                        let hash: &str = name;
                        let hash = hash.to_string();

                        effects.push(Effect::Resolve { hash: hash.clone() });
                        self.state = SOCKS5State::RequestReceived { hash: hash };

                        true
                    }
                    (Some(SOCKS5Command::Connect), IPEndpointAddr::Addr(_)) => {
                        self.refuse(ReplyCode::AddrNotSupported, effects);

                        false
                    }
                    _ => {
                        self.refuse(ReplyCode::CmdNotSupported, effects);

                        false
                    }
                }
            }
            Decode::Invalid {
                error: SOCKS5Error::BadAddrType { .. }
            } => {
                self.refuse(ReplyCode::AddrNotSupported, effects);

                false
            }
            Decode::Invalid { error } => {
                #[cfg(feature = "log")]
                debug!(target: "socks5-protocol",
                       "bad request ({})",
                       error);

                self.refuse(ReplyCode::ServerFailure, effects);

                false
            }
        }
    }

    fn read_selection(
        &mut self,
        effects: &mut Vec<Effect>
    ) -> bool {
        match proto::decode_method_selection(&self.buf) {
            Decode::Incomplete => false,
            Decode::Parsed {
                value: AuthNMech::None,
                consumed
            } => {
                self.buf.drain(..consumed);

                let hash = self.hash().unwrap_or_default().to_string();
                let endpoint = IPEndpoint::new(IPEndpointAddr::name(hash), 0);

                match proto::encode_connect_request(&endpoint) {
                    Ok(msg) => {
                        effects.push(Effect::Send(msg));
                        self.state = SOCKS5State::TargetRequestSent;

                        true
                    }
                    Err(_) => {
                        self.fail(FailureReason::ProtocolError, effects);

                        false
                    }
                }
            }
            Decode::Invalid { error } => {
                #[cfg(feature = "log")]
                debug!(target: "socks5-protocol",
                       "bad method selection ({})",
                       error);

                self.fail(FailureReason::from(&error), effects);

                false
            }
        }
    }

    fn read_reply(
        &mut self,
        effects: &mut Vec<Effect>
    ) -> bool {
        match proto::decode_reply(&self.buf) {
            Decode::Incomplete => false,
            Decode::Parsed { value, consumed } => {
                self.buf.drain(..consumed);

                match value.code().error() {
                    None => {
                        #[cfg(feature = "log")]
                        debug!(target: "socks5-protocol",
                               "streamhost accepted request, bound to {}",
                               value.endpoint());

                        effects.push(Effect::Activated);
                        self.state = SOCKS5State::TargetReady;

                        true
                    }
                    Some(error) => {
                        #[cfg(feature = "log")]
                        debug!(target: "socks5-protocol",
                               "streamhost refused request ({})",
                               error);

                        self.fail(FailureReason::from(&error), effects);

                        false
                    }
                }
            }
            Decode::Invalid { error } => {
                #[cfg(feature = "log")]
                debug!(target: "socks5-protocol",
                       "bad reply ({})",
                       error);

                self.fail(FailureReason::from(&error), effects);

                false
            }
        }
    }
}

#[cfg(test)]
use crate::init;

#[cfg(test)]
const HASH: &str = "137c70eeb47270b68fe23c2ef7a04b0c13fb7f86";

#[cfg(test)]
fn connect_msg(hash: &str) -> Vec<u8> {
    let endpoint =
        IPEndpoint::new(IPEndpointAddr::name(String::from(hash)), 0);

    proto::encode_connect_request(&endpoint).expect("Expected success")
}

#[cfg(test)]
fn success_msg(hash: &str) -> Vec<u8> {
    let endpoint =
        IPEndpoint::new(IPEndpointAddr::name(String::from(hash)), 0);

    proto::encode_reply(ReplyCode::Success, &endpoint)
        .expect("Expected success")
}

#[cfg(test)]
fn server_at_request() -> Connection {
    let conn = Connection::requester();
    let (conn, effects) = conn.step(Event::DataReceived(&[0x05, 0x01, 0x00]));

    assert_eq!(effects, vec![Effect::Send(vec![0x05, 0x00])]);
    assert_eq!(conn.state(), &SOCKS5State::AuthNegotiated);

    conn
}

#[cfg(test)]
fn client_ready() -> Connection {
    let conn = Connection::target(String::from(HASH));
    let (conn, _) = conn.step(Event::ConnectionMade);
    let (conn, _) = conn.step(Event::DataReceived(&[0x05, 0x00]));
    let (conn, effects) = conn.step(Event::DataReceived(&success_msg(HASH)));

    assert_eq!(effects, vec![Effect::Activated]);
    assert!(conn.is_ready());

    conn
}

#[test]
fn test_server_handshake() {
    init();

    let conn = server_at_request();
    let (conn, effects) = conn.step(Event::DataReceived(&connect_msg(HASH)));

    assert_eq!(
        effects,
        vec![Effect::Resolve {
            hash: String::from(HASH)
        }]
    );
    assert_eq!(
        conn.state(),
        &SOCKS5State::RequestReceived {
            hash: String::from(HASH)
        }
    );

    let (conn, effects) =
        conn.step(Event::Resolved(Some(String::from("abc123"))));

    assert_eq!(
        effects,
        vec![Effect::Send(success_msg(HASH)), Effect::Activated]
    );
    assert!(conn.is_ready());
    assert_eq!(conn.sid(), Some("abc123"));
    assert!(conn.sends_payload());
}

#[test]
fn test_server_unknown_hash() {
    init();

    let conn = server_at_request();
    let (conn, _) = conn.step(Event::DataReceived(&connect_msg(HASH)));
    let (conn, effects) = conn.step(Event::Resolved(None));
    let expected = vec![0x05, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

    assert_eq!(effects, vec![Effect::Send(expected), Effect::Close]);
    assert!(conn.is_closed());
}

#[test]
fn test_server_byte_at_a_time() {
    init();

    let mut conn = Connection::requester();
    let mut all = Vec::new();
    let mut msg = vec![0x05, 0x01, 0x00];

    msg.extend(connect_msg(HASH));

    for byte in msg.iter() {
        let (next, effects) = conn.step(Event::DataReceived(&[*byte]));

        conn = next;
        all.extend(effects);
    }

    assert_eq!(
        all,
        vec![
            Effect::Send(vec![0x05, 0x00]),
            Effect::Resolve {
                hash: String::from(HASH)
            }
        ]
    );
}

#[test]
fn test_server_pipelined_request_and_payload() {
    init();

    let conn = Connection::requester();
    let mut msg = vec![0x05, 0x01, 0x00];

    msg.extend(connect_msg(HASH));
    msg.extend(b"early");

    let (conn, effects) = conn.step(Event::DataReceived(&msg));

    assert_eq!(effects.len(), 2);

    let (conn, effects) =
        conn.step(Event::Resolved(Some(String::from("abc123"))));

    assert_eq!(effects[2], Effect::Payload(b"early".to_vec()));
    assert!(conn.is_ready());
}

#[test]
fn test_server_no_acceptable_method() {
    init();

    let conn = Connection::requester();
    let (conn, effects) = conn.step(Event::DataReceived(&[0x05, 0x01, 0x02]));

    assert_eq!(
        effects,
        vec![Effect::Send(vec![0x05, 0xff]), Effect::Close]
    );
    assert!(conn.is_closed());
}

#[test]
fn test_server_bad_version() {
    init();

    let conn = Connection::requester();
    let (conn, effects) = conn.step(Event::DataReceived(&[0x04, 0x01, 0x00]));

    assert_eq!(
        effects,
        vec![Effect::Send(vec![0x05, 0xff]), Effect::Close]
    );
    assert!(conn.is_closed());
}

#[test]
fn test_server_ipv4_not_supported() {
    init();

    let conn = server_at_request();
    let msg = [0x05, 0x01, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x50];
    let (conn, effects) = conn.step(Event::DataReceived(&msg));
    let expected = vec![0x05, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

    assert_eq!(effects, vec![Effect::Send(expected), Effect::Close]);
    assert!(conn.is_closed());
}

#[test]
fn test_server_bind_not_supported() {
    init();

    let conn = server_at_request();
    let mut msg = connect_msg(HASH);

    msg[1] = 0x02;

    let (conn, effects) = conn.step(Event::DataReceived(&msg));
    let expected = vec![0x05, 0x07, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

    assert_eq!(effects, vec![Effect::Send(expected), Effect::Close]);
    assert!(conn.is_closed());
}

#[test]
fn test_server_lost_before_ready_unbound() {
    init();

    let conn = server_at_request();
    let (conn, effects) = conn.step(Event::ConnectionLost { clean: true });

    assert_eq!(effects, vec![Effect::Close]);
    assert!(conn.is_closed());

    let conn = server_at_request();
    let (_, effects) = conn.step(Event::TimerFired);

    assert_eq!(effects, vec![Effect::Close]);
}

#[test]
fn test_server_ready_payload_and_finish() {
    init();

    let conn = server_at_request();
    let (conn, _) = conn.step(Event::DataReceived(&connect_msg(HASH)));
    let (conn, _) = conn.step(Event::Resolved(Some(String::from("abc123"))));
    let (conn, effects) = conn.step(Event::TimerFired);

    assert!(effects.is_empty());

    let (conn, effects) = conn.step(Event::ConnectionLost { clean: false });

    assert_eq!(
        effects,
        vec![Effect::Fail(FailureReason::ConnectionLost), Effect::Close]
    );
    assert!(conn.is_closed());
}

#[test]
fn test_client_handshake() {
    init();

    let conn = Connection::target(String::from(HASH));

    assert!(!conn.sends_payload());

    let (conn, effects) = conn.step(Event::ConnectionMade);

    assert_eq!(effects, vec![Effect::Send(vec![0x05, 0x01, 0x00])]);
    assert_eq!(conn.state(), &SOCKS5State::TargetAuthSent);

    let (conn, effects) = conn.step(Event::DataReceived(&[0x05, 0x00]));

    assert_eq!(effects, vec![Effect::Send(connect_msg(HASH))]);
    assert_eq!(conn.state(), &SOCKS5State::TargetRequestSent);

    let mut reply = success_msg(HASH);

    reply.extend(b"hello");

    let (conn, effects) = conn.step(Event::DataReceived(&reply));

    assert_eq!(
        effects,
        vec![Effect::Activated, Effect::Payload(b"hello".to_vec())]
    );
    assert_eq!(conn.state(), &SOCKS5State::TargetReady);
}

#[test]
fn test_client_payload_in_order() {
    init();

    let conn = client_ready();
    let (conn, effects) = conn.step(Event::DataReceived(b"abc"));

    assert_eq!(effects, vec![Effect::Payload(b"abc".to_vec())]);

    let (conn, effects) = conn.step(Event::DataReceived(b"def"));

    assert_eq!(effects, vec![Effect::Payload(b"def".to_vec())]);

    let (conn, effects) = conn.step(Event::ConnectionLost { clean: true });

    assert_eq!(effects, vec![Effect::Finished, Effect::Close]);
    assert!(conn.is_closed());
}

#[test]
fn test_client_refused() {
    init();

    let conn = Connection::target(String::from(HASH));
    let (conn, _) = conn.step(Event::ConnectionMade);
    let (conn, _) = conn.step(Event::DataReceived(&[0x05, 0x00]));
    let reply = proto::encode_error_reply(ReplyCode::ConnectionRefused);
    let (conn, effects) = conn.step(Event::DataReceived(&reply));

    assert_eq!(
        effects,
        vec![Effect::Fail(FailureReason::ProtocolError), Effect::Close]
    );
    assert!(conn.is_closed());
}

#[test]
fn test_client_bad_method() {
    init();

    let conn = Connection::proxy_relay(String::from(HASH));
    let (conn, _) = conn.step(Event::ConnectionMade);
    let (conn, effects) = conn.step(Event::DataReceived(&[0x05, 0x02]));

    assert_eq!(
        effects,
        vec![Effect::Fail(FailureReason::ProtocolError), Effect::Close]
    );
    assert!(conn.is_closed());
}

#[test]
fn test_client_timeout() {
    init();

    let conn = Connection::target(String::from(HASH));
    let (conn, _) = conn.step(Event::ConnectionMade);
    let (conn, effects) = conn.step(Event::TimerFired);

    assert_eq!(
        effects,
        vec![Effect::Fail(FailureReason::Timeout), Effect::Close]
    );

    let (_, effects) = conn.step(Event::ConnectionLost { clean: false });

    assert!(effects.is_empty());
}

#[test]
fn test_closed_ignores_data() {
    init();

    let conn = Connection::requester();
    let (conn, _) = conn.step(Event::DataReceived(&[0x04]));
    let (conn, effects) = conn.step(Event::DataReceived(&[0x05, 0x01, 0x00]));

    assert!(effects.is_empty());
    assert!(conn.is_closed());
}
