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


//! Session hash calculation.
//!
//! Both parties of a bytestream compute the same hash independently
//! from the session id and the two full identities.  The hash is
//! sent as the SOCKS5 domain name, which lets the streamhost find
//! the session without knowing any real addresses.
use sha1::Digest;
use sha1::Sha1;

/// Length of a session hash, in characters.
pub const HASH_LEN: usize = 40;

/// Calculate the session hash for `sid` between `from` and `to`.
///
/// This is the hex-encoded SHA-1 of `sid`, `from` and `to`
/// concatenated in that order.  `from` is always the requester and
/// `to` the target, regardless of which side is computing it.
pub fn session_hash(
    from: &str,
    to: &str,
    sid: &str
) -> String {
    let mut hasher = Sha1::new();

    hasher.update(sid.as_bytes());
    hasher.update(from.as_bytes());
    hasher.update(to.as_bytes());

    hex::encode(hasher.finalize())
}

#[test]
fn test_session_hash_known_value() {
    let hash = session_hash("alice@example.com", "bob@example.com", "abc123");

    assert_eq!(hash, "137c70eeb47270b68fe23c2ef7a04b0c13fb7f86");
    assert_eq!(hash.len(), HASH_LEN);
}

#[test]
fn test_session_hash_full_jids() {
    let hash = session_hash(
        "requester@example.org/resource",
        "target@example.org/res",
        "s1"
    );

    assert_eq!(hash, "5668d0c1d805f7fd472ce0245ebd62f7cf0e2e01");
}

#[test]
fn test_session_hash_is_directional() {
    let forward = session_hash("alice@example.com", "bob@example.com", "abc123");
    let backward =
        session_hash("bob@example.com", "alice@example.com", "abc123");

    assert_eq!(backward, "b34a66b05aa59f91cdd9de638208715de486d479");
    assert_ne!(forward, backward);
}

#[test]
fn test_session_hash_deterministic() {
    let from = String::from("alice@example.com");
    let to = String::from("bob@example.com");
    let first = session_hash(&from, &to, "abc123");
    let second = session_hash(from.as_str(), to.as_str(), "abc123");

    assert_eq!(first, second);
}
