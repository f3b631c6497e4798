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


//! Registry of in-flight bytestream sessions.
//!
//! The [SessionRegistry] maps session ids and session hashes to
//! sessions, owns each session's expiration timer, and guarantees
//! that exactly one of a session's callbacks fires exactly once.
//! It is a cheaply-cloneable handle; all clones refer to the same
//! set of sessions.
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::time::Duration;

#[cfg(feature = "log")]
use log::debug;
#[cfg(feature = "log")]
use log::error;
#[cfg(feature = "log")]
use log::info;
#[cfg(feature = "log")]
use log::warn;
use tokio::io::AsyncRead;
use tokio::io::AsyncSeek;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::error::FailureReason;
use crate::error::RegistryError;
use crate::hash::session_hash;
use crate::params::Streamhost;

/// Byte source or sink for a transfer.
pub trait TransferFile: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send {}

impl<T> TransferFile for T where
    T: AsyncRead + AsyncWrite + AsyncSeek + Unpin + Send
{
}

/// Shared handle to the file being transferred.
///
/// The file is owned by the caller; sessions only hold a reference.
pub type FileHandle = Arc<tokio::sync::Mutex<Box<dyn TransferFile>>>;

/// Called with the session id and file when a transfer succeeds.
pub type SuccessCallback = Box<dyn FnOnce(&str, FileHandle) + Send>;

/// Called with the session id, file, and reason when a session fails.
pub type FailureCallback =
    Box<dyn FnOnce(&str, FileHandle, FailureReason) + Send>;

/// Control signal sent to the connection bound to a session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LinkSignal {
    /// Nothing to do yet.
    Idle,
    /// Begin sending the payload.
    Start,
    /// Drop the socket.
    Shutdown
}

/// Transfer progress of a session.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Progress {
    /// Bytes transferred so far.
    position: u64,
    /// Expected total, if known.
    size: Option<u64>
}

/// Parameters for creating a session.
pub struct SessionParams {
    sid: String,
    from: String,
    to: String,
    file: FileHandle,
    size: Option<u64>,
    on_success: SuccessCallback,
    on_failure: FailureCallback
}

/// Snapshot of a session's state.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    sid: String,
    from: String,
    to: String,
    hash: String,
    size: Option<u64>,
    activated: bool,
    bound: bool
}

struct Session {
    from: String,
    to: String,
    hash: String,
    file: FileHandle,
    size: Option<u64>,
    position: u64,
    activated: bool,
    /// Transfer was started, possibly before a connection was bound.
    started: bool,
    streamhost: Option<Streamhost>,
    timer: Option<AbortHandle>,
    link: Option<watch::Sender<LinkSignal>>,
    on_success: SuccessCallback,
    on_failure: FailureCallback
}

#[derive(Default)]
struct Sessions {
    /// Session hash to session id.
    hashes: HashMap<String, String>,
    sessions: HashMap<String, Session>
}

/// Registry of in-flight sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    timeout: Duration,
    inner: Arc<Mutex<Sessions>>
}

/// Wrap a file in a [FileHandle].
#[inline]
pub fn file_handle<F>(file: F) -> FileHandle
where
    F: TransferFile + 'static {
    let file: Box<dyn TransferFile> = Box::new(file);

    Arc::new(tokio::sync::Mutex::new(file))
}

impl Progress {
    #[inline]
    pub fn position(&self) -> u64 {
        self.position
    }

    #[inline]
    pub fn size(&self) -> Option<u64> {
        self.size
    }
}

impl SessionParams {
    /// Create parameters for a session with id `sid` between the
    /// requester `from` and the target `to`.
    pub fn new(
        sid: &str,
        from: &str,
        to: &str,
        file: FileHandle,
        size: Option<u64>,
        on_success: SuccessCallback,
        on_failure: FailureCallback
    ) -> Self {
        SessionParams {
            sid: sid.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            file: file,
            size: size,
            on_success: on_success,
            on_failure: on_failure
        }
    }
}

impl SessionInfo {
    #[inline]
    pub fn sid(&self) -> &str {
        &self.sid
    }

    #[inline]
    pub fn from(&self) -> &str {
        &self.from
    }

    #[inline]
    pub fn to(&self) -> &str {
        &self.to
    }

    #[inline]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    #[inline]
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// Whether the session's timer has been cancelled by activation.
    #[inline]
    pub fn activated(&self) -> bool {
        self.activated
    }

    /// Whether a connection is bound to the session.
    #[inline]
    pub fn bound(&self) -> bool {
        self.bound
    }
}

impl Session {
    fn info(
        &self,
        sid: &str
    ) -> SessionInfo {
        SessionInfo {
            sid: sid.to_string(),
            from: self.from.clone(),
            to: self.to.clone(),
            hash: self.hash.clone(),
            size: self.size,
            activated: self.activated,
            bound: self.link.is_some()
        }
    }

    fn activate(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort()
        }

        self.activated = true;
    }

    /// Activate once a bound connection has been started.
    fn activate_if_ready(&mut self) {
        if self.started && self.link.is_some() {
            self.activate()
        }
    }
}

impl Debug for SessionRegistry {
    fn fmt(
        &self,
        f: &mut Formatter
    ) -> Result<(), std::fmt::Error> {
        write!(f, "SessionRegistry {{ timeout: {:?} }}", self.timeout)
    }
}

impl SessionRegistry {
    /// Create an empty registry whose sessions expire after
    /// `timeout` unless activated.
    #[inline]
    pub fn new(timeout: Duration) -> Self {
        SessionRegistry {
            timeout: timeout,
            inner: Arc::new(Mutex::new(Sessions::default()))
        }
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn lock(&self) -> Result<MutexGuard<'_, Sessions>, RegistryError> {
        self.inner.lock().map_err(|_| {
            #[cfg(feature = "log")]
            error!(target: "socks5-bytestreams",
                   "session registry mutex poisoned");

            RegistryError::MutexPoison
        })
    }

    /// Create a session and start its expiration timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn create(
        &self,
        params: SessionParams
    ) -> Result<SessionInfo, RegistryError> {
        let SessionParams {
            sid,
            from,
            to,
            file,
            size,
            on_success,
            on_failure
        } = params;
        let hash = session_hash(&from, &to, &sid);
        let mut guard = self.lock()?;

        if guard.sessions.contains_key(&sid) {
            return Err(RegistryError::DuplicateSession { sid: sid });
        }

        if guard.hashes.contains_key(&hash) {
            return Err(RegistryError::HashCollision { hash: hash });
        }

        #[cfg(feature = "log")]
        info!(target: "socks5-bytestreams",
              "creating session {} ({} -> {}) with hash {}",
              sid, from, to, hash);

        let registry = self.clone();
        let timer_sid = sid.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            registry.on_timeout(&timer_sid);
        });
        let session = Session {
            from: from,
            to: to,
            hash: hash.clone(),
            file: file,
            size: size,
            position: 0,
            activated: false,
            started: false,
            streamhost: None,
            timer: Some(timer.abort_handle()),
            link: None,
            on_success: on_success,
            on_failure: on_failure
        };
        let info = session.info(&sid);

        guard.hashes.insert(hash, sid.clone());
        guard.sessions.insert(sid, session);

        Ok(info)
    }

    /// Find the session with the given hash.
    pub fn lookup_by_hash(
        &self,
        hash: &str
    ) -> Option<SessionInfo> {
        let guard = self.lock().ok()?;
        let sid = guard.hashes.get(hash)?;

        guard.sessions.get(sid).map(|session| session.info(sid))
    }

    /// Get a snapshot of the session with id `sid`.
    pub fn get(
        &self,
        sid: &str
    ) -> Option<SessionInfo> {
        let guard = self.lock().ok()?;

        guard.sessions.get(sid).map(|session| session.info(sid))
    }

    #[inline]
    pub fn contains(
        &self,
        sid: &str
    ) -> bool {
        self.get(sid).is_some()
    }

    fn with_session<T, F>(
        &self,
        sid: &str,
        func: F
    ) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Session) -> Result<T, RegistryError> {
        let mut guard = self.lock()?;

        match guard.sessions.get_mut(sid) {
            Some(session) => func(session),
            None => Err(RegistryError::NotFound {
                sid: sid.to_string()
            })
        }
    }

    /// Cancel the session's timer and mark it in progress.
    pub fn activate(
        &self,
        sid: &str
    ) -> Result<(), RegistryError> {
        self.with_session(sid, |session| {
            #[cfg(feature = "log")]
            debug!(target: "socks5-bytestreams",
                   "activating session {}",
                   sid);

            session.activate();

            Ok(())
        })
    }

    /// Bind a connection to the session.
    ///
    /// The returned receiver carries [LinkSignal]s for the
    /// connection.  At most one connection can be bound.  If the
    /// transfer was already started, this activates the session.
    pub fn bind_connection(
        &self,
        sid: &str
    ) -> Result<watch::Receiver<LinkSignal>, RegistryError> {
        self.with_session(sid, |session| {
            if session.link.is_some() {
                return Err(RegistryError::AlreadyBound {
                    sid: sid.to_string()
                });
            }

            let signal = if session.started {
                LinkSignal::Start
            } else {
                LinkSignal::Idle
            };
            let (send, recv) = watch::channel(signal);

            session.link = Some(send);
            session.activate_if_ready();

            Ok(recv)
        })
    }

    /// Tell the bound connection to start sending the payload.
    ///
    /// If no connection is bound yet, the connection bound later
    /// starts immediately.  The session stays subject to its timer
    /// until a connection is bound.
    pub fn start_transfer(
        &self,
        sid: &str
    ) -> Result<(), RegistryError> {
        self.with_session(sid, |session| {
            #[cfg(feature = "log")]
            debug!(target: "socks5-bytestreams",
                   "starting transfer for session {}",
                   sid);

            session.started = true;

            if let Some(link) = &session.link {
                link.send_replace(LinkSignal::Start);
            }

            session.activate_if_ready();

            Ok(())
        })
    }

    /// Record the streamhost used by the session.
    pub fn set_streamhost(
        &self,
        sid: &str,
        streamhost: Streamhost
    ) -> Result<(), RegistryError> {
        self.with_session(sid, |session| {
            session.streamhost = Some(streamhost);

            Ok(())
        })
    }

    pub fn streamhost(
        &self,
        sid: &str
    ) -> Option<Streamhost> {
        self.with_session(sid, |session| Ok(session.streamhost.clone()))
            .ok()
            .flatten()
    }

    /// Get the session's file.
    pub fn file(
        &self,
        sid: &str
    ) -> Option<FileHandle> {
        self.with_session(sid, |session| Ok(session.file.clone())).ok()
    }

    /// Get the session's transfer progress.
    pub fn progress(
        &self,
        sid: &str
    ) -> Option<Progress> {
        self.with_session(sid, |session| {
            Ok(Progress {
                position: session.position,
                size: session.size
            })
        })
        .ok()
    }

    /// Record `len` more bytes transferred.
    pub fn add_progress(
        &self,
        sid: &str,
        len: u64
    ) -> Result<(), RegistryError> {
        self.with_session(sid, |session| {
            session.position += len;

            Ok(())
        })
    }

    /// Complete the session.
    ///
    /// Removes the session, cancels its timer, shuts down its bound
    /// connection, and invokes the success or failure callback.
    /// Returns `false` if the session was already gone.
    pub fn complete(
        &self,
        sid: &str,
        outcome: Result<(), FailureReason>
    ) -> bool {
        match self.take(sid, |_| true) {
            Some(session) => {
                Self::finish(sid, session, outcome);

                true
            }
            None => false
        }
    }

    /// Handle expiry of a session's timer.
    ///
    /// Fails the session with [FailureReason::Timeout] if it still
    /// exists and was never activated.
    pub fn on_timeout(
        &self,
        sid: &str
    ) -> bool {
        match self.take(sid, |session| !session.activated) {
            Some(session) => {
                #[cfg(feature = "log")]
                warn!(target: "socks5-bytestreams",
                      "session {} timed out",
                      sid);

                Self::finish(sid, session, Err(FailureReason::Timeout));

                true
            }
            None => false
        }
    }

    fn take<F>(
        &self,
        sid: &str,
        pred: F
    ) -> Option<Session>
    where
        F: FnOnce(&Session) -> bool {
        let mut guard = self.lock().ok()?;

        if !pred(guard.sessions.get(sid)?) {
            return None;
        }

        let session = guard.sessions.remove(sid)?;

        guard.hashes.remove(&session.hash);

        Some(session)
    }

    fn finish(
        sid: &str,
        session: Session,
        outcome: Result<(), FailureReason>
    ) {
        if let Some(timer) = session.timer {
            timer.abort()
        }

        if let Some(link) = session.link {
            link.send_replace(LinkSignal::Shutdown);
        }

        match outcome {
            Ok(()) => {
                #[cfg(feature = "log")]
                info!(target: "socks5-bytestreams",
                      "session {} completed ({} bytes)",
                      sid, session.position);

                (session.on_success)(sid, session.file)
            }
            Err(reason) => {
                #[cfg(feature = "log")]
                info!(target: "socks5-bytestreams",
                      "session {} failed ({})",
                      sid, reason);

                (session.on_failure)(sid, session.file, reason)
            }
        }
    }
}

#[cfg(test)]
use std::io::Cursor;
#[cfg(test)]
use std::sync::atomic::AtomicUsize;
#[cfg(test)]
use std::sync::atomic::Ordering;

#[cfg(test)]
type Outcomes = Arc<Mutex<Vec<Result<String, (String, FailureReason)>>>>;

#[cfg(test)]
fn test_params(
    sid: &str,
    from: &str,
    to: &str,
    outcomes: &Outcomes
) -> SessionParams {
    let succ = outcomes.clone();
    let fail = outcomes.clone();

    SessionParams::new(
        sid,
        from,
        to,
        file_handle(Cursor::new(Vec::new())),
        Some(10),
        Box::new(move |sid, _| {
            succ.lock().expect("Expected success").push(Ok(sid.to_string()))
        }),
        Box::new(move |sid, _, reason| {
            fail.lock()
                .expect("Expected success")
                .push(Err((sid.to_string(), reason)))
        })
    )
}

#[tokio::test]
async fn test_create_lookup() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));
    let params =
        test_params("abc123", "alice@example.com", "bob@example.com", &outcomes);
    let info = registry.create(params).expect("Expected success");

    assert_eq!(info.hash(), "137c70eeb47270b68fe23c2ef7a04b0c13fb7f86");
    assert_eq!(info.size(), Some(10));
    assert!(!info.activated());
    assert!(!info.bound());

    let found = registry
        .lookup_by_hash("137c70eeb47270b68fe23c2ef7a04b0c13fb7f86")
        .expect("Expected session");

    assert_eq!(found.sid(), "abc123");
    assert_eq!(found.from(), "alice@example.com");
    assert_eq!(found.to(), "bob@example.com");
    assert!(registry.lookup_by_hash("0000").is_none());
}

#[tokio::test]
async fn test_create_duplicate_sid() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");

    match registry.create(test_params("s1", "c@x", "d@x", &outcomes)) {
        Err(RegistryError::DuplicateSession { sid }) => assert_eq!(sid, "s1"),
        res => panic!("Expected duplicate session, got {:?}", res)
    }
}

#[tokio::test]
async fn test_create_hash_collision() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("a", "bc", "d", &outcomes))
        .expect("Expected success");

    match registry.create(test_params("ab", "c", "d", &outcomes)) {
        Err(RegistryError::HashCollision { .. }) => {}
        res => panic!("Expected hash collision, got {:?}", res)
    }

    assert!(!registry.contains("ab"));
}

#[tokio::test]
async fn test_complete_once() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));
    let info = registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");

    assert!(registry.complete("s1", Ok(())));
    assert!(!registry.complete("s1", Err(FailureReason::Cancelled)));
    assert!(!registry.contains("s1"));
    assert!(registry.lookup_by_hash(info.hash()).is_none());
    assert_eq!(
        *outcomes.lock().expect("Expected success"),
        vec![Ok(String::from("s1"))]
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");
    tokio::time::sleep(Duration::from_secs(59)).await;

    assert!(registry.contains("s1"));

    tokio::time::sleep(Duration::from_secs(2)).await;

    assert!(!registry.contains("s1"));
    assert_eq!(
        *outcomes.lock().expect("Expected success"),
        vec![Err((String::from("s1"), FailureReason::Timeout))]
    );
    assert!(!registry.complete("s1", Ok(())));
}

#[tokio::test(start_paused = true)]
async fn test_activate_cancels_timer() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");
    registry.activate("s1").expect("Expected success");
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(registry.contains("s1"));
    assert!(!registry.on_timeout("s1"));
    assert!(outcomes.lock().expect("Expected success").is_empty());
}

#[tokio::test]
async fn test_activate_unknown() {
    let registry = SessionRegistry::new(Duration::from_secs(60));

    assert_eq!(
        registry.activate("nope"),
        Err(RegistryError::NotFound {
            sid: String::from("nope")
        })
    );
}

#[tokio::test]
async fn test_link_signals() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");

    let mut link = registry.bind_connection("s1").expect("Expected success");

    assert!(registry.get("s1").expect("Expected session").bound());

    match registry.bind_connection("s1") {
        Err(RegistryError::AlreadyBound { .. }) => {}
        res => panic!("Expected already bound, got {:?}", res.is_ok())
    }

    assert_eq!(*link.borrow(), LinkSignal::Idle);

    registry.start_transfer("s1").expect("Expected success");
    link.changed().await.expect("Expected success");

    assert_eq!(*link.borrow_and_update(), LinkSignal::Start);

    registry.complete("s1", Err(FailureReason::Cancelled));
    link.changed().await.expect("Expected success");

    assert_eq!(*link.borrow_and_update(), LinkSignal::Shutdown);
}

#[tokio::test]
async fn test_start_before_bind() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");
    registry.start_transfer("s1").expect("Expected success");

    assert!(!registry.get("s1").expect("Expected session").activated());

    let link = registry.bind_connection("s1").expect("Expected success");

    assert_eq!(*link.borrow(), LinkSignal::Start);
    assert!(registry.get("s1").expect("Expected session").activated());
}

#[tokio::test]
async fn test_bind_then_start_activates() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");

    let _link = registry.bind_connection("s1").expect("Expected success");

    assert!(!registry.get("s1").expect("Expected session").activated());

    registry.start_transfer("s1").expect("Expected success");

    assert!(registry.get("s1").expect("Expected session").activated());
}

#[tokio::test(start_paused = true)]
async fn test_start_without_connection_times_out() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");
    registry.start_transfer("s1").expect("Expected success");
    tokio::time::sleep(Duration::from_secs(61)).await;

    assert!(!registry.contains("s1"));
    assert_eq!(
        *outcomes.lock().expect("Expected success"),
        vec![Err((String::from("s1"), FailureReason::Timeout))]
    );
}

#[tokio::test]
async fn test_progress() {
    let outcomes = Outcomes::default();
    let registry = SessionRegistry::new(Duration::from_secs(60));

    registry
        .create(test_params("s1", "a@x", "b@x", &outcomes))
        .expect("Expected success");
    registry.add_progress("s1", 4).expect("Expected success");
    registry.add_progress("s1", 3).expect("Expected success");

    let progress = registry.progress("s1").expect("Expected progress");

    assert_eq!(progress.position(), 7);
    assert_eq!(progress.size(), Some(10));
    assert!(registry.progress("s2").is_none());
}

#[tokio::test]
async fn test_callback_runs_outside_lock() {
    let count = Arc::new(AtomicUsize::new(0));
    let registry = SessionRegistry::new(Duration::from_secs(60));
    let inner = registry.clone();
    let succ = count.clone();
    let params = SessionParams::new(
        "s1",
        "a@x",
        "b@x",
        file_handle(Cursor::new(Vec::new())),
        None,
        Box::new(move |sid, _| {
            assert!(!inner.contains(sid));
            succ.fetch_add(1, Ordering::SeqCst);
        }),
        Box::new(|_, _, _| panic!("Expected success"))
    );

    registry.create(params).expect("Expected success");
    registry.complete("s1", Ok(()));

    assert_eq!(count.load(Ordering::SeqCst), 1);
}
