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


//! Interface to the out-of-band signaling layer.
//!
//! Bytestream negotiation messages (offers, streamhost selection,
//! proxy activation, and errors) travel over a separate channel,
//! typically XMPP IQ stanzas.  This crate does not route them
//! itself; it hands them to an implementation of [Signaling].
use std::fmt::Display;
use std::fmt::Formatter;

#[cfg(feature = "log")]
use log::warn;
use tokio::sync::mpsc::UnboundedSender;

use crate::params::Streamhost;

/// Error conditions reported to a peer.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
    /// The session id is unknown.
    NotAcceptable,
    /// The offer carried no streamhosts.
    BadRequest,
    /// None of the offered streamhosts could be used.
    ItemNotFound
}

/// Outbound signaling messages.
#[derive(Clone, Debug, PartialEq)]
pub enum SignalMessage {
    /// Offer streamhost candidates to the target.
    Offer {
        /// Peer receiving the offer.
        to: String,
        /// Session id.
        sid: String,
        /// Candidates in order of preference.
        streamhosts: Vec<Streamhost>
    },
    /// Tell the requester which streamhost the target connected to.
    StreamhostUsed {
        /// The requester.
        to: String,
        /// Session id.
        sid: String,
        /// Identity of the streamhost used.
        jid: String
    },
    /// Ask a proxy to start relaying.
    Activate {
        /// Identity of the proxy.
        proxy: String,
        /// Session id.
        sid: String,
        /// Identity of the target.
        target: String
    },
    /// Report an error for a session.
    Error {
        /// Peer receiving the error.
        to: String,
        /// Session id.
        sid: String,
        /// Error condition.
        kind: ErrorKind
    }
}

/// Sink for outbound signaling messages.
pub trait Signaling: Send + Sync {
    /// Deliver `msg` to its destination.
    fn send(
        &self,
        msg: SignalMessage
    );
}

impl ErrorKind {
    /// Get the stanza error condition name.
    #[inline]
    pub fn condition(&self) -> &'static str {
        match self {
            ErrorKind::NotAcceptable => "not-acceptable",
            ErrorKind::BadRequest => "bad-request",
            ErrorKind::ItemNotFound => "item-not-found"
        }
    }
}

impl SignalMessage {
    /// Get the session id the message refers to.
    #[inline]
    pub fn sid(&self) -> &str {
        match self {
            SignalMessage::Offer { sid, .. } |
            SignalMessage::StreamhostUsed { sid, .. } |
            SignalMessage::Activate { sid, .. } |
            SignalMessage::Error { sid, .. } => sid
        }
    }
}

impl Signaling for UnboundedSender<SignalMessage> {
    fn send(
        &self,
        msg: SignalMessage
    ) {
        if let Err(_err) = UnboundedSender::send(self, msg) {
            #[cfg(feature = "log")]
            warn!(target: "socks5-bytestreams",
                  "signaling channel closed, dropping {:?}",
                  _err.0);
        }
    }
}

impl Display for ErrorKind {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "{}", self.condition())
    }
}

#[test]
fn test_error_conditions() {
    assert_eq!(ErrorKind::NotAcceptable.to_string(), "not-acceptable");
    assert_eq!(ErrorKind::BadRequest.to_string(), "bad-request");
    assert_eq!(ErrorKind::ItemNotFound.to_string(), "item-not-found");
}

#[test]
fn test_channel_signaling() {
    let (send, mut recv) = tokio::sync::mpsc::unbounded_channel();
    let msg = SignalMessage::Activate {
        proxy: String::from("proxy.example.com"),
        sid: String::from("s1"),
        target: String::from("bob@example.com/res")
    };

    Signaling::send(&send, msg.clone());

    let got = recv.try_recv().expect("Expected message");

    assert_eq!(got, msg);
    assert_eq!(got.sid(), "s1");
}
