//! The demultiplexer: one UDP socket shared by all sessions, with incoming datagrams routed
//! by source address and an application-facing API addressed by connection identifier.

use crate::buffer_pool::BufferPool;
use crate::segment::{self, ReceivedSegment};
use crate::send_pipeline::SendPipeline;
use crate::session::{CloseHook, OnClosed, SendCallback, Session};
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, span, trace, warn, Instrument, Level, Span};
use uuid::Uuid;

/// All datagram buffers are this size; segments are bounded by the negotiated maximum
/// segment size, which must fit.
const DATAGRAM_BUFFER_SIZE: usize = 2048;
const BUFFER_POOL_SIZE: usize = 1024;

/// Application-side sink for in-order segments. Invoked whenever at least one segment became
/// deliverable on a connection; the segments are only borrowed for the call, their buffers
/// are recycled afterwards.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SegmentDispatcher: Send + Sync + 'static {
    async fn on_segments(&self, connection_id: u32, segments: &[ReceivedSegment]);
}

/// RudpServer is the place where all other parts of the protocol come together: it listens
/// on a UdpSocket, dispatching incoming datagrams to their sessions (creating sessions for
/// connecting peers), and has an API for application code to open connections and send data.
pub struct RudpServer {
    receive_socket: Arc<UdpSocket>,
    send_pipeline: Arc<SendPipeline>,
    buffer_pool: Arc<BufferPool>,
    dispatcher: Arc<dyn SegmentDispatcher>,
    sessions: Arc<Mutex<FxHashMap<SocketAddr, Arc<Session>>>>,
    session_bindings: Arc<Mutex<FxHashMap<u32, SocketAddr>>>,
}

impl RudpServer {
    pub async fn bind(
        self_addr: SocketAddr,
        dispatcher: Arc<dyn SegmentDispatcher>,
    ) -> anyhow::Result<RudpServer> {
        let receive_socket = Arc::new(UdpSocket::bind(self_addr).await?);
        info!("bound receive socket to {:?}", receive_socket.local_addr()?);
        Ok(RudpServer {
            send_pipeline: Arc::new(SendPipeline::new(Arc::new(receive_socket.clone()))),
            receive_socket,
            buffer_pool: Arc::new(BufferPool::new(DATAGRAM_BUFFER_SIZE, BUFFER_POOL_SIZE)),
            dispatcher,
            sessions: Arc::new(Mutex::new(FxHashMap::default())),
            session_bindings: Arc::new(Mutex::new(FxHashMap::default())),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.receive_socket
            .local_addr()
            .expect("UdpSocket should have an initialized local addr")
    }

    /// Drive the socket forever: receive datagrams, route them to sessions, hand delivered
    /// segments to the dispatcher. A datagram a session rejects is logged and skipped - one
    /// misbehaving peer must not stall the loop.
    pub async fn recv_loop(&self) {
        info!("starting receive loop");

        loop {
            let mut buf = self.buffer_pool.get_from_pool();
            buf.resize(DATAGRAM_BUFFER_SIZE, 0);
            let (num_read, from) = match self.receive_socket.recv_from(buf.as_mut()).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };
            buf.truncate(num_read);

            let correlation_id = Uuid::new_v4();
            let span = span!(Level::TRACE, "segment_received", ?correlation_id);
            let _entered = span.enter();

            trace!("received datagram from {:?}: {:?}", from, buf.as_ref());

            let is_rst = segment::is_rst(&buf);
            let Some(session) = self.lookup_or_create_session(from, segment::is_syn(&buf))
            else {
                debug!("ignoring datagram from unknown peer {:?}", from);
                self.buffer_pool.return_to_pool(buf);
                continue;
            };

            let mut received = Vec::new();
            match session
                .receive(buf, &mut received)
                .instrument(Span::current())
                .await
            {
                Ok(()) => {
                    if !received.is_empty() {
                        self.dispatcher
                            .on_segments(session.connection_id(), &received)
                            .instrument(Span::current())
                            .await;
                    }
                    for segment in received {
                        self.buffer_pool.return_to_pool(segment.into_inner());
                    }
                    if is_rst {
                        debug!("peer {:?} reset the connection", from);
                        self.drop_session(&from, session.connection_id());
                    }
                }
                Err(e) => {
                    warn!("dropping invalid datagram from {:?}: {}", from, e);
                }
            }
        }
    }

    /// Open a connection to `endpoint`. `cb` reports the outcome together with the
    /// connection identifier to use in subsequent calls; `on_close` runs when the session
    /// eventually tears down.
    pub async fn connect(
        &self,
        endpoint: SocketAddr,
        cb: impl FnOnce(bool, u32) + Send + 'static,
        on_close: impl Fn() + Send + Sync + 'static,
    ) {
        let on_close: CloseHook = Box::new(on_close);
        let (session, reuse_hook) = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.get(&endpoint) {
                // the session may predate this call (e.g. auto-created by the peer's SYN);
                // the caller still gets its close notification
                Some(session) => (session.clone(), Some(on_close)),
                None => {
                    let session = self.new_session(endpoint, Some(on_close));
                    sessions.insert(endpoint, session.clone());
                    (session, None)
                }
            }
        };
        if let Some(on_close) = reuse_hook {
            session.register_close_hook(on_close).await;
        }

        let session_bindings = Arc::clone(&self.session_bindings);
        session
            .connect(move |success, connection_id| {
                session_bindings.lock().unwrap().insert(connection_id, endpoint);
                cb(success, connection_id);
            })
            .await;
    }

    /// Send `payload` on an established connection. `cb(false)` fires immediately when the
    /// identifier does not resolve to a live session.
    pub async fn send(&self, connection_id: u32, payload: &[u8], cb: SendCallback) {
        let Some(session) = self.session_by_id(connection_id) else {
            cb(false);
            return;
        };
        session.send(payload, cb).await;
    }

    pub async fn disconnect(&self, connection_id: u32) {
        if let Some(session) = self.session_by_id(connection_id) {
            session.disconnect().await;
        }
    }

    fn lookup_or_create_session(
        &self,
        from: SocketAddr,
        create_on_syn: bool,
    ) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get(&from) {
            return Some(session.clone());
        }
        if !create_on_syn {
            return None;
        }
        debug!("connection attempt from new peer {:?}: creating session", from);
        let session = self.new_session(from, None);
        self.session_bindings
            .lock()
            .unwrap()
            .insert(session.connection_id(), from);
        sessions.insert(from, session.clone());
        Some(session)
    }

    fn new_session(&self, peer_addr: SocketAddr, on_close: Option<CloseHook>) -> Arc<Session> {
        let sessions = Arc::clone(&self.sessions);
        let session_bindings = Arc::clone(&self.session_bindings);
        let on_closed: OnClosed = Box::new(move |endpoint, connection_id| {
            let removed = sessions.lock().unwrap().remove(&endpoint);
            session_bindings.lock().unwrap().remove(&connection_id);
            if removed.is_some() {
                if let Some(cb) = &on_close {
                    cb();
                }
            }
        });
        Arc::new(Session::new(
            self.send_pipeline.clone(),
            self.buffer_pool.clone(),
            peer_addr,
            on_closed,
        ))
    }

    fn drop_session(&self, endpoint: &SocketAddr, connection_id: u32) {
        self.sessions.lock().unwrap().remove(endpoint);
        self.session_bindings.lock().unwrap().remove(&connection_id);
    }

    fn session_by_id(&self, connection_id: u32) -> Option<Arc<Session>> {
        let endpoint = *self.session_bindings.lock().unwrap().get(&connection_id)?;
        self.sessions.lock().unwrap().get(&endpoint).cloned()
    }
}
