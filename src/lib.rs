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

//! SOCKS5 bytestreams implementation.
//!
//! This package implements SOCKS5 bytestreams, as defined in
//! [XEP-0065](https://xmpp.org/extensions/xep-0065.html): a way to
//! set up a direct or proxied TCP stream between two peers who have
//! agreed on a session out-of-band, and to send a file over it.  The
//! SOCKS5 handshake follows
//! [RFC 1928](https://www.rfc-editor.org/rfc/rfc1928), restricted to
//! anonymous authentication and `CONNECT` requests for a domain name
//! derived from the session.  The following functionality is
//! provided:
//!
//! * Both roles: the requester, which runs a SOCKS5 streamhost and
//!   sends the file, and the target, which connects to one of the
//!   offered streamhosts and receives it.
//!
//! * Mediated transfers through a SOCKS5 proxy, including proxy
//!   activation.
//!
//! * Session lifecycle management with activation timeouts and
//!   guaranteed single completion.
//!
//! The following functionality is *not* implemented:
//!
//! * Routing of signaling messages.  The caller is responsible for
//!   delivering [SignalMessage](crate::signal::SignalMessage)s and
//!   for passing incoming messages to the
//!   [BytestreamManager](crate::manager::BytestreamManager).
//!
//! * Authentication other than anonymous, and encryption.
//!
//! # Usage
//!
//! The [BytestreamManager](crate::manager::BytestreamManager) is the
//! main entry point.  It is created from a
//! [BytestreamConfig](crate::params::BytestreamConfig), our own
//! identity, and an implementation of
//! [Signaling](crate::signal::Signaling).
//!
//! ## Sending
//!
//! 1. Call [start_stream](crate::manager::BytestreamManager::start_stream)
//!    with the file and the session.  This sends an offer listing the
//!    streamhost candidates.
//!
//! 1. When the target reports the streamhost it used, call
//!    [on_streamhost_used](crate::manager::BytestreamManager::on_streamhost_used).
//!    For a direct connection, this starts the transfer.
//!
//! 1. If the target used a proxy, an activation request is sent to it.
//!    Pass the answer to
//!    [on_activation_result](crate::manager::BytestreamManager::on_activation_result).
//!
//! ## Receiving
//!
//! 1. Call
//!    [prepare_to_receive](crate::manager::BytestreamManager::prepare_to_receive)
//!    once the transfer has been agreed.
//!
//! 1. Pass the requester's offer to
//!    [on_offer](crate::manager::BytestreamManager::on_offer).  The
//!    candidates are tried in order, the one used is reported back, and
//!    the file is received.
//!
//! In both cases, exactly one of the session's callbacks is invoked
//! when it finishes.
//!
//! ## Lower-Level Components
//!
//! The SOCKS5 handshake is implemented as a pure state machine in
//! [Connection](crate::state::Connection), with encoding and
//! decoding in [proto](crate::proto).  These perform no IO; the
//! [comm](crate::comm) module drives them over sockets.  Sessions
//! are tracked by a [SessionRegistry](crate::registry::SessionRegistry).
#![allow(clippy::redundant_field_names)]
#![allow(clippy::upper_case_acronyms)]
pub mod comm;
pub mod error;
pub mod hash;
pub mod manager;
pub mod params;
pub mod proto;
pub mod registry;
pub mod signal;
pub mod state;

#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
use log::LevelFilter;

#[cfg(test)]
static INIT: Once = Once::new();

#[cfg(test)]
fn init() {
    INIT.call_once(|| {
        env_logger::builder()
            .is_test(true)
            .filter_level(LevelFilter::Trace)
            .init()
    })
}
