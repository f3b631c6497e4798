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


//! Bytestream session management.
//!
//! [BytestreamManager] ties together the listener, the session
//! registry, and the signaling layer.  The signaling layer calls
//! into it as negotiation messages arrive from peers, and it sends
//! its own messages back out through [Signaling].
//!
//! A requester calls [start_stream](BytestreamManager::start_stream),
//! which offers our own streamhost and the configured proxy, if any.
//! A target calls
//! [prepare_to_receive](BytestreamManager::prepare_to_receive) ahead
//! of the offer, then hands the offer to
//! [on_offer](BytestreamManager::on_offer).
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;
use std::sync::Arc;

#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::info;
#[cfg(feature = "log")]
use log::warn;
use tokio::task::AbortHandle;

use crate::comm::connect_candidates;
use crate::comm::connect_streamhost;
use crate::comm::receive;
use crate::comm::transmit;
use crate::comm::StreamListener;
use crate::error::BytestreamError;
use crate::error::FailureReason;
use crate::error::RegistryError;
use crate::params::BytestreamConfig;
use crate::params::Streamhost;
use crate::registry::FailureCallback;
use crate::registry::FileHandle;
use crate::registry::Progress;
use crate::registry::SessionInfo;
use crate::registry::SessionParams;
use crate::registry::SessionRegistry;
use crate::registry::SuccessCallback;
use crate::signal::ErrorKind;
use crate::signal::SignalMessage;
use crate::signal::Signaling;
use crate::state::Connection;

/// Bytestream session manager.
///
/// This is a cheaply-cloneable handle.  Dropping the last handle
/// stops the listener.
#[derive(Clone)]
pub struct BytestreamManager {
    inner: Arc<ManagerInner>
}

struct ManagerInner {
    /// Our own identity.
    jid: String,
    config: BytestreamConfig,
    registry: SessionRegistry,
    signaling: Arc<dyn Signaling>,
    /// Address the listener is bound to.
    local_addr: SocketAddr,
    listener: AbortHandle
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.listener.abort()
    }
}

impl BytestreamManager {
    /// Bind the listener and start accepting target connections.
    pub async fn start(
        config: BytestreamConfig,
        jid: &str,
        signaling: Arc<dyn Signaling>
    ) -> Result<Self, BytestreamError> {
        let listener = StreamListener::bind(config.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        let registry = SessionRegistry::new(config.session_timeout());
        let task = tokio::spawn(
            listener.run(registry.clone(), config.negotiation_timeout())
        );

        #[cfg(feature = "log")]
        info!(target: "socks5-bytestreams",
              "bytestream manager for {} started on {}",
              jid, local_addr);

        Ok(BytestreamManager {
            inner: Arc::new(ManagerInner {
                jid: jid.to_string(),
                config: config,
                registry: registry,
                signaling: signaling,
                local_addr: local_addr,
                listener: task.abort_handle()
            })
        })
    }

    #[inline]
    pub fn jid(&self) -> &str {
        &self.inner.jid
    }

    /// Get the address the listener is bound to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Get our own streamhost.
    pub fn local_streamhost(&self) -> Streamhost {
        let port = self.inner.local_addr.port();

        match self.inner.config.host() {
            Some(host) => Streamhost::new(self.inner.jid.clone(), host, port),
            None => {
                let ip = match self.inner.local_addr.ip() {
                    IpAddr::V4(ip) if ip.is_unspecified() => {
                        IpAddr::V4(Ipv4Addr::LOCALHOST)
                    }
                    IpAddr::V6(ip) if ip.is_unspecified() => {
                        IpAddr::V6(Ipv6Addr::LOCALHOST)
                    }
                    ip => ip
                };

                Streamhost::new(self.inner.jid.clone(), &ip.to_string(), port)
            }
        }
    }

    /// Get the streamhost candidates to offer, in order of
    /// preference.
    pub fn streamhosts(&self) -> Vec<Streamhost> {
        let mut out = vec![self.local_streamhost()];

        if let Some(proxy) = self.inner.config.proxy() {
            out.push(proxy.streamhost())
        }

        out
    }

    /// Offer to send `file` to `to` in session `sid`.
    ///
    /// Exactly one of `on_success` and `on_failure` is eventually
    /// called.
    pub fn start_stream(
        &self,
        file: FileHandle,
        to: &str,
        sid: &str,
        size: Option<u64>,
        on_success: SuccessCallback,
        on_failure: FailureCallback
    ) -> Result<(), BytestreamError> {
        let params = SessionParams::new(
            sid,
            &self.inner.jid,
            to,
            file,
            size,
            on_success,
            on_failure
        );

        self.inner.registry.create(params)?;

        #[cfg(feature = "log")]
        debug!(target: "socks5-bytestreams",
               "offering session {} to {}",
               sid, to);

        self.inner.signaling.send(SignalMessage::Offer {
            to: to.to_string(),
            sid: sid.to_string(),
            streamhosts: self.streamhosts()
        });

        Ok(())
    }

    /// Handle the target's report of the streamhost it connected to.
    ///
    /// The session's timer keeps running until the connection to the
    /// chosen streamhost is bound and started, so a connection that
    /// never shows up still ends in [FailureReason::Timeout].
    pub fn on_streamhost_used(
        &self,
        sid: &str,
        jid: &str
    ) -> Result<(), BytestreamError> {
        let registry = &self.inner.registry;
        let info = registry.get(sid).ok_or_else(|| RegistryError::NotFound {
            sid: sid.to_string()
        })?;

        if jid == self.inner.jid {
            #[cfg(feature = "log")]
            debug!(target: "socks5-bytestreams",
                   "target connected directly for session {}",
                   sid);

            registry.set_streamhost(sid, self.local_streamhost())?;
            registry.start_transfer(sid)?;
        } else {
            match self.inner.config.proxy() {
                Some(proxy) if proxy.jid() == jid => {
                    tokio::spawn(self.clone().relay(info, proxy.streamhost()));
                }
                _ => {
                    #[cfg(feature = "log")]
                    warn!(target: "socks5-bytestreams",
                          "unknown streamhost {} used for session {}",
                          jid, sid);

                    registry.complete(sid, Err(FailureReason::ProtocolError));
                }
            }
        }

        Ok(())
    }

    /// Connect to the proxy, ask it to activate, and send the file
    /// once activation is acknowledged.
    async fn relay(
        self,
        info: SessionInfo,
        streamhost: Streamhost
    ) {
        let registry = &self.inner.registry;
        let sid = info.sid();
        let conn = Connection::proxy_relay(info.hash().to_string());
        let timeout = self.inner.config.negotiation_timeout();
        let (streamhost, stream, _, _) =
            match connect_streamhost(&streamhost, conn, timeout).await {
                Ok(established) => established.take(),
                Err(reason) => {
                    registry.complete(sid, Err(reason));

                    return;
                }
            };
        let link = match registry.bind_connection(sid) {
            Ok(link) => link,
            Err(_err) => {
                #[cfg(feature = "log")]
                warn!(target: "socks5-bytestreams",
                      "can't relay session {} ({})",
                      sid, _err);

                registry.complete(sid, Err(FailureReason::ProtocolError));

                return;
            }
        };

        if registry.set_streamhost(sid, streamhost.clone()).is_err() {
            return;
        }

        #[cfg(feature = "log")]
        debug!(target: "socks5-bytestreams",
               "requesting activation of session {} from {}",
               sid, streamhost.jid());

        self.inner.signaling.send(SignalMessage::Activate {
            proxy: streamhost.jid().to_string(),
            sid: sid.to_string(),
            target: info.to().to_string()
        });

        transmit(stream, registry, sid, link).await
    }

    /// Handle the proxy's answer to an activation request.
    pub fn on_activation_result(
        &self,
        sid: &str,
        accepted: bool
    ) -> Result<(), BytestreamError> {
        if accepted {
            self.inner.registry.start_transfer(sid)?;
        } else {
            #[cfg(feature = "log")]
            warn!(target: "socks5-bytestreams",
                  "proxy refused to activate session {}",
                  sid);

            self.inner
                .registry
                .complete(sid, Err(FailureReason::ProtocolError));
        }

        Ok(())
    }

    /// Expect `from` to send a file in session `sid`.
    ///
    /// Exactly one of `on_success` and `on_failure` is eventually
    /// called.
    pub fn prepare_to_receive(
        &self,
        from: &str,
        sid: &str,
        file: FileHandle,
        size: Option<u64>,
        on_success: SuccessCallback,
        on_failure: FailureCallback
    ) -> Result<(), BytestreamError> {
        let params = SessionParams::new(
            sid,
            from,
            &self.inner.jid,
            file,
            size,
            on_success,
            on_failure
        );

        self.inner.registry.create(params)?;

        Ok(())
    }

    fn send_error(
        &self,
        to: &str,
        sid: &str,
        kind: ErrorKind
    ) {
        self.inner.signaling.send(SignalMessage::Error {
            to: to.to_string(),
            sid: sid.to_string(),
            kind: kind
        })
    }

    /// Handle a streamhost offer from `from`.
    pub fn on_offer(
        &self,
        from: &str,
        sid: &str,
        streamhosts: Vec<Streamhost>
    ) {
        let info = match self.inner.registry.get(sid) {
            Some(info) if info.from() == from && info.to() == self.inner.jid => {
                info
            }
            _ => {
                #[cfg(feature = "log")]
                debug!(target: "socks5-bytestreams",
                       "unexpected offer for session {} from {}",
                       sid, from);

                self.send_error(from, sid, ErrorKind::NotAcceptable);

                return;
            }
        };

        if streamhosts.is_empty() {
            self.send_error(from, sid, ErrorKind::BadRequest);

            return;
        }

        tokio::spawn(self.clone().accept_offer(info, streamhosts));
    }

    /// Connect to the first usable candidate and receive the file.
    async fn accept_offer(
        self,
        info: SessionInfo,
        streamhosts: Vec<Streamhost>
    ) {
        let registry = &self.inner.registry;
        let sid = info.sid();
        let timeout = self.inner.config.negotiation_timeout();

        match connect_candidates(&streamhosts, info.hash(), timeout).await {
            Ok(established) => {
                let (streamhost, stream, conn, early) = established.take();

                let link = match registry.bind_connection(sid) {
                    Ok(link) => link,
                    Err(_err) => {
                        #[cfg(feature = "log")]
                        warn!(target: "socks5-bytestreams",
                              "can't receive session {} ({})",
                              sid, _err);

                        registry.complete(sid, Err(FailureReason::ProtocolError));

                        return;
                    }
                };

                if registry.activate(sid).is_err() ||
                    registry.set_streamhost(sid, streamhost.clone()).is_err()
                {
                    return;
                }

                #[cfg(feature = "log")]
                info!(target: "socks5-bytestreams",
                      "receiving session {} through {}",
                      sid, streamhost);

                self.inner.signaling.send(SignalMessage::StreamhostUsed {
                    to: info.from().to_string(),
                    sid: sid.to_string(),
                    jid: streamhost.jid().to_string()
                });

                receive(stream, conn, early, registry, sid, link).await
            }
            Err(reason) => {
                self.send_error(info.from(), sid, ErrorKind::ItemNotFound);
                registry.complete(sid, Err(reason));
            }
        }
    }

    /// Handle an error reply from the peer to one of our messages.
    pub fn on_error(
        &self,
        sid: &str,
        kind: ErrorKind
    ) -> bool {
        let reason = match kind {
            ErrorKind::ItemNotFound => FailureReason::NoRoute,
            ErrorKind::NotAcceptable | ErrorKind::BadRequest => {
                FailureReason::ProtocolError
            }
        };

        self.inner.registry.complete(sid, Err(reason))
    }

    /// Tear down a session.
    ///
    /// Returns `false` if the session no longer exists.
    #[inline]
    pub fn abort(
        &self,
        sid: &str
    ) -> bool {
        self.inner
            .registry
            .complete(sid, Err(FailureReason::Cancelled))
    }

    #[inline]
    pub fn progress(
        &self,
        sid: &str
    ) -> Option<Progress> {
        self.inner.registry.progress(sid)
    }

    /// Get the streamhost a session settled on.
    #[inline]
    pub fn streamhost(
        &self,
        sid: &str
    ) -> Option<Streamhost> {
        self.inner.registry.streamhost(sid)
    }

    /// Stop accepting target connections.
    ///
    /// Sessions in progress are not affected.
    #[inline]
    pub fn shutdown(&self) {
        #[cfg(feature = "log")]
        info!(target: "socks5-bytestreams",
              "stopping listener on {}",
              self.inner.local_addr);

        self.inner.listener.abort()
    }
}

#[cfg(test)]
use std::io::Cursor;
#[cfg(test)]
use std::io::SeekFrom;
#[cfg(test)]
use std::sync::Mutex;
#[cfg(test)]
use std::time::Duration;

#[cfg(test)]
use tokio::io::AsyncReadExt;
#[cfg(test)]
use tokio::io::AsyncSeekExt;
#[cfg(test)]
use tokio::io::AsyncWriteExt;
#[cfg(test)]
use tokio::net::TcpListener;
#[cfg(test)]
use tokio::sync::mpsc;
#[cfg(test)]
use tokio::sync::oneshot;

#[cfg(test)]
use crate::hash::session_hash;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::params::ProxyConfig;
#[cfg(test)]
use crate::registry::file_handle;

#[cfg(test)]
const ALICE: &str = "alice@example.com/res";
#[cfg(test)]
const BOB: &str = "bob@example.com/res";
#[cfg(test)]
const PROXY: &str = "proxy.example.com";

#[cfg(test)]
type Done = oneshot::Receiver<Result<FileHandle, FailureReason>>;

#[cfg(test)]
fn loopback_config() -> BytestreamConfig {
    BytestreamConfig::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
}

#[cfg(test)]
fn callbacks() -> (SuccessCallback, FailureCallback, Done) {
    let (send, recv) = oneshot::channel();
    let succ = Arc::new(Mutex::new(Some(send)));
    let fail = succ.clone();
    let on_success: SuccessCallback = Box::new(move |_, file| {
        if let Some(send) = succ.lock().expect("Expected success").take() {
            let _ = send.send(Ok(file));
        }
    });
    let on_failure: FailureCallback = Box::new(move |_, _, reason| {
        if let Some(send) = fail.lock().expect("Expected success").take() {
            let _ = send.send(Err(reason));
        }
    });

    (on_success, on_failure, recv)
}

#[cfg(test)]
async fn outcome(done: Done) -> Result<FileHandle, FailureReason> {
    tokio::time::timeout(Duration::from_secs(10), done)
        .await
        .expect("Expected session to finish")
        .expect("Expected callback")
}

#[cfg(test)]
async fn contents(file: FileHandle) -> Vec<u8> {
    let mut file = file.lock().await;
    let mut out = Vec::new();

    file.seek(SeekFrom::Start(0))
        .await
        .expect("Expected success");
    file.read_to_end(&mut out).await.expect("Expected success");

    out
}

#[cfg(test)]
async fn start_manager(
    config: BytestreamConfig,
    jid: &str
) -> (BytestreamManager, mpsc::UnboundedReceiver<SignalMessage>) {
    let (send, recv) = mpsc::unbounded_channel();
    let manager = BytestreamManager::start(config, jid, Arc::new(send))
        .await
        .expect("Expected success");

    (manager, recv)
}

/// Accept one connection as a proxy, report the requested hash, and
/// collect everything relayed to it.
#[cfg(test)]
async fn fake_proxy(
    listener: TcpListener,
    handshake: oneshot::Sender<String>
) -> Vec<u8> {
    let (mut stream, _) = listener.accept().await.expect("Expected success");
    let mut greeting = [0; 3];

    stream
        .read_exact(&mut greeting)
        .await
        .expect("Expected success");

    assert_eq!(greeting, [0x05, 0x01, 0x00]);

    stream.write_all(&[0x05, 0x00]).await.expect("Expected success");

    let mut header = [0; 5];

    stream
        .read_exact(&mut header)
        .await
        .expect("Expected success");

    assert_eq!(&header[..4], &[0x05, 0x01, 0x00, 0x03]);

    let len = header[4] as usize;
    let mut name = vec![0; len + 2];

    stream.read_exact(&mut name).await.expect("Expected success");
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0x7f, 0x00, 0x00, 0x01, 0x00, 0x00])
        .await
        .expect("Expected success");

    let hash = String::from_utf8(name[..len].to_vec()).expect("Expected UTF-8");

    handshake.send(hash).expect("Expected success");

    let mut payload = Vec::new();

    stream
        .read_to_end(&mut payload)
        .await
        .expect("Expected success");

    payload
}

#[tokio::test]
async fn test_direct_transfer() {
    init();

    let (alice, mut alice_out) = start_manager(loopback_config(), ALICE).await;
    let (bob, mut bob_out) = start_manager(loopback_config(), BOB).await;
    let data = b"The quick brown fox jumps over the lazy dog\n".repeat(1000);
    let size = Some(data.len() as u64);
    let (succ, fail, bob_done) = callbacks();

    bob.prepare_to_receive(
        ALICE,
        "s1",
        file_handle(Cursor::new(Vec::new())),
        size,
        succ,
        fail
    )
    .expect("Expected success");

    let (succ, fail, alice_done) = callbacks();

    alice
        .start_stream(
            file_handle(Cursor::new(data.clone())),
            BOB,
            "s1",
            size,
            succ,
            fail
        )
        .expect("Expected success");

    let streamhosts = match alice_out.recv().await {
        Some(SignalMessage::Offer {
            to,
            sid,
            streamhosts
        }) => {
            assert_eq!(to, BOB);
            assert_eq!(sid, "s1");

            streamhosts
        }
        msg => panic!("Expected offer, got {:?}", msg)
    };

    assert_eq!(streamhosts.len(), 1);
    assert_eq!(streamhosts[0].jid(), ALICE);

    bob.on_offer(ALICE, "s1", streamhosts);

    let jid = match bob_out.recv().await {
        Some(SignalMessage::StreamhostUsed { to, sid, jid }) => {
            assert_eq!(to, ALICE);
            assert_eq!(sid, "s1");

            jid
        }
        msg => panic!("Expected streamhost used, got {:?}", msg)
    };

    assert_eq!(jid, ALICE);

    alice
        .on_streamhost_used("s1", &jid)
        .expect("Expected success");
    outcome(alice_done).await.expect("Expected success");

    let file = outcome(bob_done).await.expect("Expected success");

    assert_eq!(contents(file).await, data);
    assert!(bob.progress("s1").is_none());
    assert!(alice.progress("s1").is_none());
}

#[tokio::test]
async fn test_proxy_activation() {
    init();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Expected success");
    let port = listener.local_addr().expect("Expected success").port();
    let (handshake, handshake_done) = oneshot::channel();
    let proxy = tokio::spawn(fake_proxy(listener, handshake));
    let config = loopback_config().with_proxy(ProxyConfig::new(
        String::from(PROXY),
        String::from("127.0.0.1"),
        port
    ));
    let (alice, mut alice_out) = start_manager(config, ALICE).await;
    let data = b"relayed payload".to_vec();
    let (succ, fail, alice_done) = callbacks();

    alice
        .start_stream(
            file_handle(Cursor::new(data.clone())),
            BOB,
            "s2",
            Some(data.len() as u64),
            succ,
            fail
        )
        .expect("Expected success");

    match alice_out.recv().await {
        Some(SignalMessage::Offer { streamhosts, .. }) => {
            assert_eq!(streamhosts.len(), 2);
            assert_eq!(streamhosts[1].jid(), PROXY);
        }
        msg => panic!("Expected offer, got {:?}", msg)
    }

    alice
        .on_streamhost_used("s2", PROXY)
        .expect("Expected success");

    let hash = handshake_done.await.expect("Expected success");

    assert_eq!(hash, session_hash(ALICE, BOB, "s2"));

    match alice_out.recv().await {
        Some(SignalMessage::Activate { proxy, sid, target }) => {
            assert_eq!(proxy, PROXY);
            assert_eq!(sid, "s2");
            assert_eq!(target, BOB);
        }
        msg => panic!("Expected activate, got {:?}", msg)
    }

    alice
        .on_activation_result("s2", true)
        .expect("Expected success");

    assert_eq!(proxy.await.expect("Expected success"), data);
    outcome(alice_done).await.expect("Expected success");
}

#[tokio::test]
async fn test_proxy_activation_rejected() {
    init();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Expected success");
    let port = listener.local_addr().expect("Expected success").port();
    let (handshake, handshake_done) = oneshot::channel();
    let proxy = tokio::spawn(fake_proxy(listener, handshake));
    let config = loopback_config().with_proxy(ProxyConfig::new(
        String::from(PROXY),
        String::from("127.0.0.1"),
        port
    ));
    let (alice, mut alice_out) = start_manager(config, ALICE).await;
    let (succ, fail, alice_done) = callbacks();

    alice
        .start_stream(
            file_handle(Cursor::new(b"never sent".to_vec())),
            BOB,
            "s3",
            None,
            succ,
            fail
        )
        .expect("Expected success");
    alice_out.recv().await.expect("Expected offer");
    alice
        .on_streamhost_used("s3", PROXY)
        .expect("Expected success");
    handshake_done.await.expect("Expected success");

    match alice_out.recv().await {
        Some(SignalMessage::Activate { .. }) => {}
        msg => panic!("Expected activate, got {:?}", msg)
    }

    alice
        .on_activation_result("s3", false)
        .expect("Expected success");

    match outcome(alice_done).await {
        Err(FailureReason::ProtocolError) => {}
        res => panic!("Expected protocol error, got {:?}", res.is_ok())
    }

    assert!(proxy.await.expect("Expected success").is_empty());
}

#[tokio::test]
async fn test_offer_errors() {
    init();

    let (bob, mut bob_out) = start_manager(loopback_config(), BOB).await;

    bob.on_offer(ALICE, "unknown", vec![]);

    assert_eq!(
        bob_out.recv().await,
        Some(SignalMessage::Error {
            to: String::from(ALICE),
            sid: String::from("unknown"),
            kind: ErrorKind::NotAcceptable
        })
    );

    let (succ, fail, bob_done) = callbacks();

    bob.prepare_to_receive(
        ALICE,
        "s4",
        file_handle(Cursor::new(Vec::new())),
        None,
        succ,
        fail
    )
    .expect("Expected success");
    bob.on_offer(ALICE, "s4", vec![]);

    assert_eq!(
        bob_out.recv().await,
        Some(SignalMessage::Error {
            to: String::from(ALICE),
            sid: String::from("s4"),
            kind: ErrorKind::BadRequest
        })
    );

    let closed = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Expected success");
    let addr = closed.local_addr().expect("Expected success");

    drop(closed);

    let candidates = vec![Streamhost::new(
        String::from(ALICE),
        &addr.ip().to_string(),
        addr.port()
    )];

    bob.on_offer(ALICE, "s4", candidates);

    assert_eq!(
        bob_out.recv().await,
        Some(SignalMessage::Error {
            to: String::from(ALICE),
            sid: String::from("s4"),
            kind: ErrorKind::ItemNotFound
        })
    );

    match outcome(bob_done).await {
        Err(FailureReason::NoRoute) => {}
        res => panic!("Expected no route, got {:?}", res.is_ok())
    }
}

#[tokio::test]
async fn test_session_timeout() {
    init();

    let config = loopback_config().with_session_timeout(Duration::from_secs(1));
    let (alice, _alice_out) = start_manager(config, ALICE).await;
    let (succ, fail, alice_done) = callbacks();

    alice
        .start_stream(
            file_handle(Cursor::new(Vec::new())),
            BOB,
            "s5",
            None,
            succ,
            fail
        )
        .expect("Expected success");

    match outcome(alice_done).await {
        Err(FailureReason::Timeout) => {}
        res => panic!("Expected timeout, got {:?}", res.is_ok())
    }
}

#[tokio::test]
async fn test_abort() {
    init();

    let (alice, _alice_out) = start_manager(loopback_config(), ALICE).await;
    let (succ, fail, alice_done) = callbacks();

    alice
        .start_stream(
            file_handle(Cursor::new(Vec::new())),
            BOB,
            "s6",
            None,
            succ,
            fail
        )
        .expect("Expected success");

    match alice.start_stream(
        file_handle(Cursor::new(Vec::new())),
        BOB,
        "s6",
        None,
        Box::new(|_, _| {}),
        Box::new(|_, _, _| {})
    ) {
        Err(BytestreamError::Registry {
            error: RegistryError::DuplicateSession { .. }
        }) => {}
        res => panic!("Expected duplicate session, got {:?}", res)
    }

    assert!(alice.abort("s6"));
    assert!(!alice.abort("s6"));

    match outcome(alice_done).await {
        Err(FailureReason::Cancelled) => {}
        res => panic!("Expected cancelled, got {:?}", res.is_ok())
    }
}

#[tokio::test]
async fn test_unknown_streamhost_used() {
    init();

    let (alice, _alice_out) = start_manager(loopback_config(), ALICE).await;
    let (succ, fail, alice_done) = callbacks();

    alice
        .start_stream(
            file_handle(Cursor::new(Vec::new())),
            BOB,
            "s7",
            None,
            succ,
            fail
        )
        .expect("Expected success");
    alice
        .on_streamhost_used("s7", "stranger.example.com")
        .expect("Expected success");

    match outcome(alice_done).await {
        Err(FailureReason::ProtocolError) => {}
        res => panic!("Expected protocol error, got {:?}", res.is_ok())
    }

    match alice.on_streamhost_used("s7", ALICE) {
        Err(BytestreamError::Registry {
            error: RegistryError::NotFound { .. }
        }) => {}
        res => panic!("Expected not found, got {:?}", res)
    }
}

#[tokio::test]
async fn test_streamhost_used_without_connection() {
    init();

    let config =
        loopback_config().with_session_timeout(Duration::from_millis(500));
    let (alice, _alice_out) = start_manager(config, ALICE).await;
    let (succ, fail, alice_done) = callbacks();

    alice
        .start_stream(
            file_handle(Cursor::new(b"never sent".to_vec())),
            BOB,
            "s8",
            None,
            succ,
            fail
        )
        .expect("Expected success");
    alice
        .on_streamhost_used("s8", ALICE)
        .expect("Expected success");

    match outcome(alice_done).await {
        Err(FailureReason::Timeout) => {}
        res => panic!("Expected timeout, got {:?}", res.is_ok())
    }

    assert!(alice.progress("s8").is_none());
}

#[tokio::test]
async fn test_relay_already_bound() {
    init();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Expected success");
    let port = listener.local_addr().expect("Expected success").port();
    let (handshake, handshake_done) = oneshot::channel();
    let proxy = tokio::spawn(fake_proxy(listener, handshake));
    let config = loopback_config().with_proxy(ProxyConfig::new(
        String::from(PROXY),
        String::from("127.0.0.1"),
        port
    ));
    let (alice, mut alice_out) = start_manager(config, ALICE).await;
    let (succ, fail, alice_done) = callbacks();

    alice
        .start_stream(
            file_handle(Cursor::new(b"never sent".to_vec())),
            BOB,
            "s9",
            None,
            succ,
            fail
        )
        .expect("Expected success");
    alice_out.recv().await.expect("Expected offer");

    // Bob connects directly, then claims to have used the proxy.
    let direct = connect_candidates(
        &[alice.local_streamhost()],
        &session_hash(ALICE, BOB, "s9"),
        Duration::from_secs(5)
    )
    .await
    .expect("Expected success");

    while !alice
        .inner
        .registry
        .get("s9")
        .expect("Expected session")
        .bound()
    {
        tokio::task::yield_now().await;
    }

    alice
        .on_streamhost_used("s9", PROXY)
        .expect("Expected success");
    handshake_done.await.expect("Expected success");

    match outcome(alice_done).await {
        Err(FailureReason::ProtocolError) => {}
        res => panic!("Expected protocol error, got {:?}", res.is_ok())
    }

    assert!(proxy.await.expect("Expected success").is_empty());
    assert!(alice.progress("s9").is_none());

    drop(direct);
}
