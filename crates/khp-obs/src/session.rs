//! The client session: request dispatch, the receive loop, and the link
//! lifecycle.
//!
//! A session has at most one live *link* (an open transport plus the
//! `obs-receive` thread reading it). Callers on any thread send requests and
//! block on the correlation table; the reader routes responses into the
//! table and events into the router.
//!
//! Subscriber callbacks run on the reader thread. A callback that sends a
//! request cannot park waiting for the reader, since it *is* the reader; so
//! the reader marks itself as the I/O owner of its link in a thread-local,
//! and `send` from that thread pumps frames itself until its response
//! arrives.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, info_span, warn};

use crate::auth;
use crate::batch::{self, BatchItem, BatchMode};
use crate::config::SessionConfig;
use crate::error::{ObsError, Result};
use crate::events::{EventCallback, EventRouter, SubscriptionId};
use crate::protocol::{self, Event, Frame, Identified, RequestResponse};
use crate::table::{CorrelationTable, Reply};
use crate::transport::{Connector, Transport, WsConnector};

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Link id whose transport this thread reads, if any.
    static IO_OWNER: Cell<Option<u64>> = const { Cell::new(None) };
}

fn owns_io(link: u64) -> bool {
    IO_OWNER.with(|owner| owner.get() == Some(link))
}

/// Where the session is in its connection lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live link. The next request connects.
    Disconnected,
    /// Opening the transport and waiting for `Hello`.
    Connecting,
    /// `Identify` sent, waiting for `Identified`.
    Authenticating,
    /// Identified; requests and events flow.
    Ready,
}

struct Link {
    id: u64,
    transport: Arc<dyn Transport>,
    alive: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn join_reader(&self) {
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(link = self.id, "receive thread panicked");
            }
        }
    }
}

struct Shared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    next_id: Mutex<u64>,
    table: CorrelationTable,
    router: EventRouter,
    /// Written only while `link` is locked.
    state: RwLock<ConnectionState>,
    link: Mutex<Option<Arc<Link>>>,
}

impl Shared {
    fn allocate_id(&self) -> u64 {
        let mut next = self.next_id.lock();
        *next += 1;
        *next
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Route one incoming message. Shared by the receive loop and the
    /// re-entrant pump.
    fn route(&self, message: Value) {
        let reply_to = protocol::reply_request_id(&message).and_then(|id| id.parse::<u64>().ok());
        match Frame::decode(message) {
            Ok(Frame::Event(event)) => self.router.dispatch(event),
            Ok(Frame::Response(response)) => {
                let request_id = response.request_id.clone();
                self.resolve(&request_id, Reply::Single(response));
            }
            Ok(Frame::BatchResponse(batch)) => {
                self.resolve(&batch.request_id, Reply::Batch(batch.results));
            }
            Ok(other) => {
                warn!(
                    frame = other.name(),
                    "unexpected frame after handshake, discarding"
                );
            }
            Err(e) => match reply_to {
                Some(id) if self.table.fail(id, e.clone()) => {
                    warn!(request_id = id, error = %e, "malformed response, failing request");
                }
                _ => warn!(error = %e, "undecodable message, discarding"),
            },
        }
    }

    fn resolve(&self, request_id: &str, reply: Reply) {
        let Ok(id) = request_id.parse::<u64>() else {
            debug!(request_id, "response with unparsable id, discarding");
            return;
        };
        if !self.table.fulfill(id, reply) {
            debug!(request_id = id, "response for unknown request, discarding");
        }
    }

    /// Take `link` out of service: close its transport, fail its pending
    /// requests, and clear it from the session if it is still current.
    fn retire(&self, link: &Link, reason: &str) {
        let was_alive = link.alive.swap(false, Ordering::AcqRel);
        link.transport.close();
        let failed = self.table.fail_link(
            link.id,
            &ObsError::ConnectionLost {
                reason: reason.to_owned(),
            },
        );
        if was_alive {
            warn!(link = link.id, reason, failed, "connection lost");
        }

        let mut current = self.link.lock();
        if current.as_ref().is_some_and(|l| l.id == link.id) {
            *current = None;
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.alive.store(false, Ordering::Release);
            link.transport.close();
            let _ = self.table.fail_link(
                link.id,
                &ObsError::ConnectionLost {
                    reason: "session dropped".into(),
                },
            );
            link.join_reader();
        }
    }
}

/// Handle to an obs-websocket session. Cheap to clone; all clones share one
/// connection.
///
/// Connects lazily on the first request, and again on the next request after
/// the connection drops. Nothing is re-sent automatically.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

/// Non-owning handle, for callbacks that need to call back into the session
/// without keeping it alive.
#[derive(Clone)]
pub struct WeakSession {
    shared: Weak<Shared>,
}

impl WeakSession {
    /// The session, if any strong handle still exists.
    pub fn upgrade(&self) -> Option<Session> {
        self.shared.upgrade().map(|shared| Session { shared })
    }
}

impl Session {
    /// New, unconnected session.
    pub fn new(config: SessionConfig, connector: impl Connector + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector: Arc::new(connector),
                next_id: Mutex::new(0),
                table: CorrelationTable::default(),
                router: EventRouter::default(),
                state: RwLock::new(ConnectionState::Disconnected),
                link: Mutex::new(None),
            }),
        }
    }

    /// New session over WebSocket.
    pub fn websocket(config: SessionConfig) -> Result<Self> {
        let connector = WsConnector::new().map_err(|e| ObsError::ConnectFailed {
            endpoint: config.endpoint.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(config, connector))
    }

    /// A handle that does not keep the session alive.
    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// The configuration this session was built with.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Connect and identify now, if not already connected.
    pub fn connect(&self) -> Result<()> {
        self.ensure_connected().map(|_| ())
    }

    /// Close the connection. Pending requests fail with
    /// [`ObsError::ConnectionLost`]. Idempotent; a later request reconnects.
    pub fn close(&self) {
        let taken = {
            let mut current = self.shared.link.lock();
            let taken = current.take();
            self.shared.set_state(ConnectionState::Disconnected);
            taken
        };
        if let Some(link) = taken {
            info!(link = link.id, "closing connection");
            link.alive.store(false, Ordering::Release);
            self.shared.retire(&link, "session closed");
            link.join_reader();
        }
    }

    /// Send one request and wait for its response.
    ///
    /// `Null` data is omitted from the request. A response with
    /// `result: false` becomes [`ObsError::Remote`].
    pub fn send(&self, request_type: &str, request_data: Value) -> Result<RequestResponse> {
        let link = self.ensure_connected()?;
        let id = self.shared.allocate_id();
        let message = protocol::request(&id.to_string(), request_type, request_data);

        let response = match self.exchange(&link, id, request_type, message)? {
            Reply::Single(response) => response,
            Reply::Batch(_) => {
                return Err(ObsError::Protocol(format!(
                    "{request_type}: got a batch response to a single request"
                )));
            }
        };
        if response.request_type != request_type {
            return Err(ObsError::Protocol(format!(
                "sent {request_type} but the response is for {}",
                response.request_type
            )));
        }
        debug!(
            request_id = id,
            request_type,
            code = response.request_status.code,
            "response received"
        );
        response.into_result()
    }

    /// Send a batch and return one result per item, in input order.
    ///
    /// Individual failures do not raise; inspect each result. An empty batch
    /// returns immediately without connecting.
    pub fn send_batch(
        &self,
        items: &[BatchItem],
        mode: BatchMode,
    ) -> Result<Vec<RequestResponse>> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        let link = self.ensure_connected()?;
        let id = self.shared.allocate_id();
        let message = batch::encode(&id.to_string(), items, mode);

        let results = match self.exchange(&link, id, "RequestBatch", message)? {
            Reply::Batch(results) => results,
            Reply::Single(response) => {
                return Err(ObsError::Protocol(format!(
                    "RequestBatch: got a single {} response",
                    response.request_type
                )));
            }
        };
        debug!(request_id = id, items = items.len(), %mode, "batch response received");
        batch::order_results(items, results)
    }

    /// Register `callback` for a category name (`"Scenes"`) or an exact
    /// event type (`"CurrentProgramSceneChanged"`).
    ///
    /// Callbacks run on the receive thread, in arrival order, never nested.
    /// They may call [`Session::send`].
    pub fn subscribe<F>(&self, category: impl Into<String>, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) -> std::result::Result<(), ObsError> + Send + Sync + 'static,
    {
        let callback: EventCallback = Arc::new(callback);
        self.shared.router.subscribe(category, callback)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.router.unsubscribe(id)
    }

    // ─── Link management ─────────────────────────────────────────────────

    fn ensure_connected(&self) -> Result<Arc<Link>> {
        let mut current = self.shared.link.lock();
        if let Some(link) = current.as_ref() {
            if link.is_alive() {
                return Ok(Arc::clone(link));
            }
        }
        *current = None;

        self.shared.set_state(ConnectionState::Connecting);
        match self.open_link() {
            Ok(link) => {
                *current = Some(Arc::clone(&link));
                self.shared.set_state(ConnectionState::Ready);
                Ok(link)
            }
            Err(e) => {
                self.shared.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Open, handshake and start the reader. Called with the link slot locked.
    fn open_link(&self) -> Result<Arc<Link>> {
        let config = &self.shared.config;
        let endpoint = &config.endpoint;
        info!(%endpoint, "connecting to obs-websocket");

        let transport =
            self.shared
                .connector
                .open(endpoint)
                .map_err(|e| ObsError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                })?;

        let handshake = || -> Result<Identified> {
            let hello = auth::read_greeting(transport.as_ref(), endpoint)?;
            self.shared.set_state(ConnectionState::Authenticating);
            auth::identify(
                transport.as_ref(),
                &hello,
                config.password.as_deref(),
                config.event_subscriptions,
            )
        };
        let identified = match handshake() {
            Ok(identified) => identified,
            Err(e) => {
                warn!(%endpoint, error = %e, "handshake failed");
                transport.close();
                return Err(e);
            }
        };

        let link = Arc::new(Link {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            alive: AtomicBool::new(true),
            reader: Mutex::new(None),
        });

        let weak = Arc::downgrade(&self.shared);
        let reader_link = Arc::clone(&link);
        let handle = thread::Builder::new()
            .name("obs-receive".into())
            .spawn(move || receive_loop(&weak, &reader_link))
            .map_err(|e| {
                link.transport.close();
                ObsError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    reason: format!("cannot start receive thread: {e}"),
                }
            })?;
        *link.reader.lock() = Some(handle);

        info!(
            %endpoint,
            link = link.id,
            rpc_version = identified.negotiated_rpc_version,
            "identified with obs-websocket"
        );
        Ok(link)
    }

    // ─── Request/response ────────────────────────────────────────────────

    fn exchange(
        &self,
        link: &Arc<Link>,
        id: u64,
        request_type: &str,
        message: Value,
    ) -> Result<Reply> {
        let shared = &self.shared;
        shared.table.register(id, link.id);
        debug!(request_id = id, request_type, "sending request");

        if let Err(e) = link.transport.send(message) {
            shared.table.forget(id);
            let reason = e.to_string();
            shared.retire(link, &reason);
            return Err(ObsError::ConnectionLost { reason });
        }

        if owns_io(link.id) {
            return self.pump(link, id);
        }

        match shared.table.wait(id, shared.config.request_timeout) {
            Some(outcome) => outcome,
            None => {
                let timeout_ms = shared.config.request_timeout_ms();
                warn!(request_id = id, request_type, timeout_ms, "request timed out");
                Err(ObsError::Timeout {
                    request_type: request_type.to_owned(),
                    timeout_ms,
                })
            }
        }
    }

    /// Read and route frames on this thread until `id` resolves.
    fn pump(&self, link: &Link, id: u64) -> Result<Reply> {
        debug!(request_id = id, "pumping frames on receive thread");
        loop {
            if let Some(outcome) = self.shared.table.take_resolved(id) {
                return outcome;
            }
            match link.transport.receive() {
                Ok(message) => self.shared.route(message),
                Err(e) => self.shared.retire(link, &e.to_string()),
            }
        }
    }
}

fn receive_loop(session: &Weak<Shared>, link: &Arc<Link>) {
    let span = info_span!("obs_receive", link = link.id);
    let _entered = span.enter();
    IO_OWNER.with(|owner| owner.set(Some(link.id)));
    debug!("receive loop started");

    loop {
        let message = link.transport.receive();
        let Some(shared) = session.upgrade() else {
            debug!("session dropped, receive loop exiting");
            break;
        };
        if !link.is_alive() {
            break;
        }
        match message {
            Ok(message) => shared.route(message),
            Err(e) => {
                shared.retire(link, &e.to_string());
                break;
            }
        }
    }

    IO_OWNER.with(|owner| owner.set(None));
    debug!("receive loop stopped");
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
