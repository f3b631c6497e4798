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


//! Network side of SOCKS5 bytestreams.
//!
//! This module drives [Connection] state machines over real sockets.
//! [StreamListener] accepts inbound connections from targets and
//! runs the server track; [connect_candidates] and
//! [connect_streamhost] open outbound connections and run the client
//! track.  Once a connection is ready, [transmit] and [receive] pump
//! the session's file over it.
use std::io::Error;
use std::net::SocketAddr;
use std::time::Duration;

use constellation_common::net::IPEndpoint;
use constellation_common::net::IPEndpointAddr;
#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::error;
#[cfg(feature = "log")]
use log::info;
#[cfg(feature = "log")]
use log::trace;
#[cfg(feature = "log")]
use log::warn;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::FailureReason;
use crate::params::Streamhost;
use crate::registry::LinkSignal;
use crate::registry::SessionRegistry;
use crate::state::Connection;
use crate::state::Effect;
use crate::state::Event;

const BUF_SIZE: usize = 8192;

/// Listener for inbound target connections.
#[derive(Debug)]
pub struct StreamListener {
    listener: TcpListener
}

/// An outbound connection that completed its handshake.
#[derive(Debug)]
pub struct Established {
    /// Streamhost the connection went to.
    streamhost: Streamhost,
    stream: TcpStream,
    /// Ready connection state.
    conn: Connection,
    /// Payload bytes received along with the handshake.
    early: Vec<u8>
}

impl Established {
    #[inline]
    pub fn streamhost(&self) -> &Streamhost {
        &self.streamhost
    }

    /// Decompose into the streamhost, socket, connection, and any
    /// early payload.
    #[inline]
    pub fn take(self) -> (Streamhost, TcpStream, Connection, Vec<u8>) {
        (self.streamhost, self.stream, self.conn, self.early)
    }
}

impl StreamListener {
    /// Bind a listener to `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;

        #[cfg(feature = "log")]
        info!(target: "socks5-bytestreams",
              "streamhost listening on {}",
              listener.local_addr()?);

        Ok(StreamListener { listener: listener })
    }

    #[inline]
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr()
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn run(
        self,
        registry: SessionRegistry,
        timeout: Duration
    ) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _addr)) => {
                    #[cfg(feature = "log")]
                    debug!(target: "socks5-bytestreams",
                           "accepted connection from {}",
                           _addr);

                    tokio::spawn(serve(stream, registry.clone(), timeout));
                }
                Err(_err) => {
                    #[cfg(feature = "log")]
                    error!(target: "socks5-bytestreams",
                           "error accepting connection: {}",
                           _err);
                }
            }
        }
    }
}

/// Run the handshake on `stream` until `conn` is ready.
///
/// Hash lookups are resolved against `registry`.  On success,
/// returns the ready connection and any payload bytes that arrived
/// with the handshake.  The handshake must complete before
/// `timeout` elapses.
pub async fn negotiate<S>(
    mut conn: Connection,
    stream: &mut S,
    registry: Option<&SessionRegistry>,
    timeout: Duration
) -> Result<(Connection, Vec<u8>), FailureReason>
where
    S: AsyncRead + AsyncWrite + Unpin {
    let deadline = Instant::now() + timeout;
    let mut buf = vec![0; BUF_SIZE];
    let mut early = Vec::new();
    let (next, mut effects) = conn.step(Event::ConnectionMade);

    conn = next;

    loop {
        let mut followup = None;

        for effect in effects.drain(..) {
            match effect {
                Effect::Send(msg) => {
                    if let Err(_err) = stream.write_all(&msg).await {
                        #[cfg(feature = "log")]
                        debug!(target: "socks5-bytestreams",
                               "error writing handshake: {}",
                               _err);

                        followup = Some(Event::ConnectionLost { clean: false });

                        break;
                    }
                }
                Effect::Resolve { hash } => {
                    let sid = registry
                        .and_then(|registry| registry.lookup_by_hash(&hash))
                        .map(|info| info.sid().to_string());

                    followup = Some(Event::Resolved(sid));
                }
                Effect::Payload(data) => early.extend(data),
                Effect::Fail(reason) => return Err(reason),
                Effect::Close => return Err(FailureReason::ProtocolError),
                Effect::Activated | Effect::Finished => {}
            }
        }

        if let Some(event) = followup {
            let (next, next_effects) = conn.step(event);

            conn = next;
            effects = next_effects;

            continue;
        }

        if conn.is_ready() {
            return Ok((conn, early));
        }

        let read = tokio::select! {
            res = stream.read(&mut buf) => Some(res),
            _ = tokio::time::sleep_until(deadline) => None
        };
        let (next, next_effects) = match read {
            Some(Ok(0)) => conn.step(Event::ConnectionLost { clean: true }),
            Some(Ok(len)) => {
                #[cfg(feature = "log")]
                trace!(target: "socks5-bytestreams",
                       "read {} handshake bytes",
                       len);

                conn.step(Event::DataReceived(&buf[..len]))
            }
            Some(Err(_)) => conn.step(Event::ConnectionLost { clean: false }),
            None => conn.step(Event::TimerFired)
        };

        conn = next;
        effects = next_effects;
    }
}

/// Serve one inbound connection from a target.
///
/// Runs the server track, binds the ready connection to its session,
/// and sends the session's file once the transfer is started.
pub async fn serve<S>(
    mut stream: S,
    registry: SessionRegistry,
    timeout: Duration
) where
    S: AsyncRead + AsyncWrite + Unpin {
    let conn = Connection::requester();
    let conn = match negotiate(conn, &mut stream, Some(&registry), timeout).await
    {
        Ok((conn, _)) => conn,
        Err(_reason) => {
            #[cfg(feature = "log")]
            debug!(target: "socks5-bytestreams",
                   "inbound negotiation failed ({})",
                   _reason);

            return;
        }
    };
    let sid = match conn.sid() {
        Some(sid) => sid.to_string(),
        None => return
    };

    match registry.bind_connection(&sid) {
        Ok(link) => transmit(stream, &registry, &sid, link).await,
        Err(_err) => {
            #[cfg(feature = "log")]
            warn!(target: "socks5-bytestreams",
                  "dropping connection for session {} ({})",
                  sid, _err);
        }
    }
}

/// Open a TCP connection to `endpoint`.
pub async fn connect_endpoint(endpoint: &IPEndpoint) -> Result<TcpStream, Error> {
    match endpoint.ip_endpoint() {
        IPEndpointAddr::Addr(addr) => {
            TcpStream::connect(SocketAddr::new(*addr, endpoint.port())).await
        }
        IPEndpointAddr::Name(name) => {
            let host: &str = name;

            TcpStream::connect((host, endpoint.port())).await
        }
    }
}

/// Connect to `streamhost` and run the client track of `conn`.
pub async fn connect_streamhost(
    streamhost: &Streamhost,
    conn: Connection,
    timeout: Duration
) -> Result<Established, FailureReason> {
    #[cfg(feature = "log")]
    debug!(target: "socks5-bytestreams",
           "trying streamhost {}",
           streamhost);

    let connect = connect_endpoint(streamhost.endpoint());
    let mut stream = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(_err)) => {
            #[cfg(feature = "log")]
            debug!(target: "socks5-bytestreams",
                   "couldn't connect to {} ({})",
                   streamhost, _err);

            return Err(FailureReason::ConnectionLost);
        }
        Err(_) => return Err(FailureReason::Timeout)
    };
    let (conn, early) = negotiate(conn, &mut stream, None, timeout).await?;

    Ok(Established {
        streamhost: streamhost.clone(),
        stream: stream,
        conn: conn,
        early: early
    })
}

/// Try `candidates` in order as a target requesting `hash`.
///
/// The first candidate to complete the handshake wins.  Fails with
/// [FailureReason::NoRoute] if none do.
pub async fn connect_candidates(
    candidates: &[Streamhost],
    hash: &str,
    timeout: Duration
) -> Result<Established, FailureReason> {
    for candidate in candidates {
        let conn = Connection::target(hash.to_string());

        match connect_streamhost(candidate, conn, timeout).await {
            Ok(established) => return Ok(established),
            Err(_reason) => {
                #[cfg(feature = "log")]
                debug!(target: "socks5-bytestreams",
                       "streamhost {} unusable ({})",
                       candidate, _reason);
            }
        }
    }

    #[cfg(feature = "log")]
    warn!(target: "socks5-bytestreams",
          "no usable streamhost among {} candidates",
          candidates.len());

    Err(FailureReason::NoRoute)
}

/// Wait for the start signal, then send the session's file.
///
/// Completes the session with the outcome, unless it was shut down
/// from elsewhere.
pub async fn transmit<S>(
    mut stream: S,
    registry: &SessionRegistry,
    sid: &str,
    mut link: watch::Receiver<LinkSignal>
) where
    S: AsyncRead + AsyncWrite + Unpin {
    let mut scratch = [0; 64];

    loop {
        match *link.borrow_and_update() {
            LinkSignal::Start => break,
            LinkSignal::Shutdown => return,
            LinkSignal::Idle => {}
        }

        let lost = tokio::select! {
            res = link.changed() => {
                if res.is_err() {
                    return;
                }

                false
            }
            res = stream.read(&mut scratch) => !matches!(res, Ok(len) if len > 0)
        };

        if lost {
            #[cfg(feature = "log")]
            debug!(target: "socks5-bytestreams",
                   "connection for session {} lost before transfer",
                   sid);

            registry.complete(sid, Err(FailureReason::ConnectionLost));

            return;
        }
    }

    if let Some(outcome) =
        send_file(&mut stream, registry, sid, &mut link).await
    {
        registry.complete(sid, outcome);
    }
}

/// Resolve once `link` signals shutdown or its session is gone.
async fn shutdown_signaled(link: &mut watch::Receiver<LinkSignal>) {
    loop {
        if *link.borrow_and_update() == LinkSignal::Shutdown ||
            link.changed().await.is_err()
        {
            return;
        }
    }
}

async fn send_file<S>(
    stream: &mut S,
    registry: &SessionRegistry,
    sid: &str,
    link: &mut watch::Receiver<LinkSignal>
) -> Option<Result<(), FailureReason>>
where
    S: AsyncWrite + Unpin {
    let file = registry.file(sid)?;
    let mut file = file.lock().await;
    let mut buf = vec![0; BUF_SIZE];

    #[cfg(feature = "log")]
    info!(target: "socks5-bytestreams",
          "sending file for session {}",
          sid);

    loop {
        let len = match file.read(&mut buf).await {
            Ok(0) => break,
            Ok(len) => len,
            Err(_err) => {
                #[cfg(feature = "log")]
                error!(target: "socks5-bytestreams",
                       "error reading file for session {}: {}",
                       sid, _err);

                return Some(Err(FailureReason::ConnectionLost));
            }
        };

        // A peer that stops reading must not pin the socket or the
        // file lock past teardown.
        let written = tokio::select! {
            res = stream.write_all(&buf[..len]) => res.is_ok(),
            _ = shutdown_signaled(link) => return None
        };

        if !written {
            return Some(Err(FailureReason::ConnectionLost));
        }

        if registry.add_progress(sid, len as u64).is_err() {
            return None;
        }
    }

    tokio::select! {
        res = stream.shutdown() => match res {
            Ok(()) => Some(Ok(())),
            Err(_) => Some(Err(FailureReason::ConnectionLost))
        },
        _ = shutdown_signaled(link) => None
    }
}

/// Receive the session's file on a ready connection.
///
/// `early` holds payload bytes that arrived with the handshake.
/// Completes the session when the peer closes the stream, unless it
/// was shut down from elsewhere.
pub async fn receive<S>(
    stream: S,
    conn: Connection,
    early: Vec<u8>,
    registry: &SessionRegistry,
    sid: &str,
    link: watch::Receiver<LinkSignal>
) where
    S: AsyncRead + Unpin {
    if let Some(outcome) =
        receive_file(stream, conn, early, registry, sid, link).await
    {
        registry.complete(sid, outcome);
    }
}

async fn receive_file<S>(
    mut stream: S,
    mut conn: Connection,
    early: Vec<u8>,
    registry: &SessionRegistry,
    sid: &str,
    mut link: watch::Receiver<LinkSignal>
) -> Option<Result<(), FailureReason>>
where
    S: AsyncRead + Unpin {
    let file = registry.file(sid)?;
    let mut file = file.lock().await;
    let mut buf = vec![0; BUF_SIZE];
    let mut effects = vec![Effect::Payload(early)];

    loop {
        for effect in effects.drain(..) {
            match effect {
                Effect::Payload(data) => {
                    if data.is_empty() {
                        continue;
                    }

                    if file.write_all(&data).await.is_err() {
                        return Some(Err(FailureReason::ConnectionLost));
                    }

                    registry.add_progress(sid, data.len() as u64).ok()?;
                }
                Effect::Finished => {
                    if file.flush().await.is_err() {
                        return Some(Err(FailureReason::ConnectionLost));
                    }

                    let progress = registry.progress(sid)?;

                    return match progress.size() {
                        Some(size) if size != progress.position() => {
                            #[cfg(feature = "log")]
                            warn!(target: "socks5-bytestreams",
                                  "session {} ended after {} of {} bytes",
                                  sid, progress.position(), size);

                            Some(Err(FailureReason::ConnectionLost))
                        }
                        _ => Some(Ok(()))
                    };
                }
                Effect::Fail(reason) => return Some(Err(reason)),
                Effect::Close => return None,
                Effect::Send(_) | Effect::Resolve { .. } | Effect::Activated => {}
            }
        }

        let read = tokio::select! {
            res = stream.read(&mut buf) => Some(res),
            res = link.changed() => {
                if res.is_err() || *link.borrow() == LinkSignal::Shutdown {
                    return None;
                }

                None
            }
        };
        let (next, next_effects) = match read {
            Some(Ok(0)) => conn.step(Event::ConnectionLost { clean: true }),
            Some(Ok(len)) => conn.step(Event::DataReceived(&buf[..len])),
            Some(Err(_)) => conn.step(Event::ConnectionLost { clean: false }),
            None => (conn, Vec::new())
        };

        conn = next;
        effects = next_effects;
    }
}

#[cfg(test)]
use std::io::Cursor;
#[cfg(test)]
use std::sync::Arc;
#[cfg(test)]
use std::sync::Mutex;

#[cfg(test)]
use crate::error::RegistryError;
#[cfg(test)]
use crate::init;
#[cfg(test)]
use crate::proto;
#[cfg(test)]
use crate::proto::ReplyCode;
#[cfg(test)]
use crate::registry::file_handle;
#[cfg(test)]
use crate::registry::SessionParams;

#[cfg(test)]
type Outcomes = Arc<Mutex<Vec<Result<String, FailureReason>>>>;

#[cfg(test)]
fn create_session(
    registry: &SessionRegistry,
    data: &[u8],
    outcomes: &Outcomes
) -> Result<String, RegistryError> {
    let succ = outcomes.clone();
    let fail = outcomes.clone();
    let params = SessionParams::new(
        "s1",
        "alice@example.com",
        "bob@example.com",
        file_handle(Cursor::new(data.to_vec())),
        Some(data.len() as u64),
        Box::new(move |sid, _| {
            succ.lock().expect("Expected success").push(Ok(sid.to_string()))
        }),
        Box::new(move |_, _, reason| {
            fail.lock().expect("Expected success").push(Err(reason))
        })
    );

    registry.create(params).map(|info| info.hash().to_string())
}

#[tokio::test]
async fn test_serve_unknown_hash() {
    init();

    let registry = SessionRegistry::new(Duration::from_secs(60));
    let (mut client, server) = tokio::io::duplex(1024);
    let task = tokio::spawn(serve(server, registry, Duration::from_secs(5)));
    let endpoint = IPEndpoint::new(
        IPEndpointAddr::name(String::from(
            "137c70eeb47270b68fe23c2ef7a04b0c13fb7f86"
        )),
        0
    );
    let mut msg = vec![0x05, 0x01, 0x00];

    msg.extend(proto::encode_connect_request(&endpoint).expect("Expected success"));
    client.write_all(&msg).await.expect("Expected success");

    let mut reply = Vec::new();

    client
        .read_to_end(&mut reply)
        .await
        .expect("Expected success");
    task.await.expect("Expected success");

    assert_eq!(
        reply,
        [0x05, 0x00, 0x05, 0x05, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
    );
}

#[tokio::test]
async fn test_serve_and_transmit() {
    init();

    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));
    let hash = create_session(&registry, b"hello world", &outcomes)
        .expect("Expected success");
    let (mut client, server) = tokio::io::duplex(1024);
    let task =
        tokio::spawn(serve(server, registry.clone(), Duration::from_secs(5)));
    let endpoint = IPEndpoint::new(IPEndpointAddr::name(hash.clone()), 0);
    let mut msg = vec![0x05, 0x01, 0x00];

    msg.extend(proto::encode_connect_request(&endpoint).expect("Expected success"));
    client.write_all(&msg).await.expect("Expected success");

    let expected = proto::encode_reply(ReplyCode::Success, &endpoint)
        .expect("Expected success");
    let mut reply = vec![0; 2 + expected.len()];

    client
        .read_exact(&mut reply)
        .await
        .expect("Expected success");

    assert_eq!(&reply[..2], &[0x05, 0x00]);
    assert_eq!(&reply[2..], &expected[..]);

    while !registry.get("s1").expect("Expected session").bound() {
        tokio::task::yield_now().await;
    }

    registry.activate("s1").expect("Expected success");
    registry.start_transfer("s1").expect("Expected success");

    let mut payload = Vec::new();

    client
        .read_to_end(&mut payload)
        .await
        .expect("Expected success");
    task.await.expect("Expected success");

    assert_eq!(payload, b"hello world");
    assert_eq!(
        *outcomes.lock().expect("Expected success"),
        vec![Ok(String::from("s1"))]
    );
}

#[tokio::test]
async fn test_receive_checks_size() {
    init();

    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    create_session(&registry, b"0123456789", &outcomes)
        .expect("Expected success");

    let link = registry.bind_connection("s1").expect("Expected success");
    let conn = Connection::target(String::from("hash"));
    let (conn, _) = conn.step(Event::ConnectionMade);
    let (conn, _) = conn.step(Event::DataReceived(&[0x05, 0x00]));
    let reply = proto::encode_reply(
        ReplyCode::Success,
        &IPEndpoint::new(IPEndpointAddr::name(String::from("hash")), 0)
    )
    .expect("Expected success");
    let (conn, _) = conn.step(Event::DataReceived(&reply));

    assert!(conn.is_ready());

    receive(&b"4567"[..], conn, b"0123".to_vec(), &registry, "s1", link).await;

    assert_eq!(
        *outcomes.lock().expect("Expected success"),
        vec![Err(FailureReason::ConnectionLost)]
    );
}

#[tokio::test]
async fn test_connect_candidates_no_route() {
    init();

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Expected success");
    let addr = listener.local_addr().expect("Expected success");

    drop(listener);

    let candidates = vec![Streamhost::new(
        String::from("streamhost@example.com"),
        &addr.ip().to_string(),
        addr.port()
    )];

    match connect_candidates(&candidates, "hash", Duration::from_secs(5)).await {
        Err(FailureReason::NoRoute) => {}
        res => panic!("Expected no route, got {:?}", res)
    }
}

#[cfg(test)]
async fn request_session(
    client: &mut tokio::io::DuplexStream,
    hash: &str
) {
    let endpoint = IPEndpoint::new(IPEndpointAddr::name(hash.to_string()), 0);
    let mut msg = vec![0x05, 0x01, 0x00];

    msg.extend(proto::encode_connect_request(&endpoint).expect("Expected success"));
    client.write_all(&msg).await.expect("Expected success");

    let expected = proto::encode_reply(ReplyCode::Success, &endpoint)
        .expect("Expected success");
    let mut reply = vec![0; 2 + expected.len()];

    client
        .read_exact(&mut reply)
        .await
        .expect("Expected success");

    assert_eq!(&reply[2..], &expected[..]);
}

#[cfg(test)]
async fn wait_bound(registry: &SessionRegistry) {
    while !registry.get("s1").expect("Expected session").bound() {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_serve_peer_gone_before_start() {
    init();

    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));
    let hash = create_session(&registry, b"hello world", &outcomes)
        .expect("Expected success");
    let (mut client, server) = tokio::io::duplex(1024);
    let task =
        tokio::spawn(serve(server, registry.clone(), Duration::from_secs(5)));

    request_session(&mut client, &hash).await;
    wait_bound(&registry).await;
    drop(client);

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("Expected success")
        .expect("Expected success");

    assert_eq!(
        *outcomes.lock().expect("Expected success"),
        vec![Err(FailureReason::ConnectionLost)]
    );
    assert!(!registry.contains("s1"));
}

#[tokio::test]
async fn test_cancel_while_peer_stalled() {
    init();

    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));
    let data = vec![0x5a; 1 << 20];
    let hash =
        create_session(&registry, &data, &outcomes).expect("Expected success");
    let (mut client, server) = tokio::io::duplex(64);
    let task =
        tokio::spawn(serve(server, registry.clone(), Duration::from_secs(5)));

    request_session(&mut client, &hash).await;
    wait_bound(&registry).await;

    let file = registry.file("s1").expect("Expected session");

    registry.activate("s1").expect("Expected success");
    registry.start_transfer("s1").expect("Expected success");

    // The client never reads, so the sender fills the pipe and stalls.
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(registry.complete("s1", Err(FailureReason::Cancelled)));

    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("Expected success")
        .expect("Expected success");

    assert!(file.try_lock().is_ok());
    assert_eq!(
        *outcomes.lock().expect("Expected success"),
        vec![Err(FailureReason::Cancelled)]
    );

    let mut rest = Vec::new();

    client
        .read_to_end(&mut rest)
        .await
        .expect("Expected success");

    assert!(rest.len() < data.len());
}
