//! In-process fake obs-websocket server for tests.
//!
//! [`FakeConnector`] hands the session one end of an in-memory channel per
//! connection and exposes the other end as a [`FakeServer`]. By default the
//! connector performs the handshake itself (optionally checking a password
//! the way obs-websocket does) before the test gets the server; in manual
//! mode the test scripts the handshake too.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde_json::{Value, json};

use crate::auth::compute_auth;
use crate::config::Endpoint;
use crate::protocol::RPC_VERSION;
use crate::transport::{Connector, Transport, TransportError};

/// How long [`FakeServer::recv`] and [`FakeConnector::accept`] wait before
/// failing the test.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

const SALT: &str = "lM1GncleQOaCu9lT1yeUZhFYnqhsLLP1G5lAGo3ixaI=";
const CHALLENGE: &str = "+IxH4CnCiqpX1rM9scsNynZzbOe4KhDeYcTNS3PDaeY=";

// ─────────────────────────────────────────────────────────────────────────────
// Pipe
// ─────────────────────────────────────────────────────────────────────────────

enum Popped<T> {
    Item(T),
    Closed,
    TimedOut,
}

struct PipeState<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// One-direction blocking queue. Items queued before `close` are still
/// delivered.
struct Pipe<T> {
    state: Mutex<PipeState<T>>,
    ready: Condvar,
}

impl<T> Pipe<T> {
    fn new() -> Self {
        Self {
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn push(&self, item: T) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.queue.push_back(item);
        drop(state);
        let _ = self.ready.notify_all();
        true
    }

    fn pop(&self, deadline: Option<Instant>) -> Popped<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.queue.pop_front() {
                return Popped::Item(item);
            }
            if state.closed {
                return Popped::Closed;
            }
            match deadline {
                Some(deadline) => {
                    if self.ready.wait_until(&mut state, deadline).timed_out()
                        && state.queue.is_empty()
                        && !state.closed
                    {
                        return Popped::TimedOut;
                    }
                }
                None => self.ready.wait(&mut state),
            }
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        let _ = self.ready.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client end
// ─────────────────────────────────────────────────────────────────────────────

struct FakeTransport {
    to_server: Arc<Pipe<Value>>,
    to_client: Arc<Pipe<Value>>,
    closed: AtomicBool,
}

impl Transport for FakeTransport {
    fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed("transport closed".into()));
        }
        if self.to_server.push(message) {
            Ok(())
        } else {
            Err(TransportError::Closed("server hung up".into()))
        }
    }

    fn receive(&self) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed("transport closed".into()));
        }
        match self.to_client.pop(None) {
            Popped::Item(message) => Ok(message),
            Popped::Closed | Popped::TimedOut => {
                Err(TransportError::Closed("end of stream".into()))
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.to_client.close();
        self.to_server.close();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server end
// ─────────────────────────────────────────────────────────────────────────────

/// The server side of one fake connection.
#[derive(Clone)]
pub struct FakeServer {
    inbox: Arc<Pipe<Value>>,
    outbox: Arc<Pipe<Value>>,
    identify: Arc<Mutex<Option<Value>>>,
}

impl FakeServer {
    /// Next message from the client. Panics after [`DEFAULT_WAIT`] or if the
    /// client closed the connection.
    pub fn recv(&self) -> Value {
        match self.inbox.pop(Some(Instant::now() + DEFAULT_WAIT)) {
            Popped::Item(message) => message,
            Popped::Closed => panic!("client closed the connection"),
            Popped::TimedOut => panic!("no message from client within {DEFAULT_WAIT:?}"),
        }
    }

    /// Next message from the client, or `None` on timeout or close.
    pub fn try_recv(&self, wait: Duration) -> Option<Value> {
        match self.inbox.pop(Some(Instant::now() + wait)) {
            Popped::Item(message) => Some(message),
            Popped::Closed | Popped::TimedOut => None,
        }
    }

    /// Send a raw message to the client.
    pub fn send(&self, message: Value) {
        let _ = self.outbox.push(message);
    }

    /// Reply to a request (`op 6`) with success.
    pub fn respond_ok(&self, request: &Value, response_data: Value) {
        self.send(response_for(request, true, 100, None, response_data));
    }

    /// Reply to a request (`op 6`) with a failure status.
    pub fn respond_err(&self, request: &Value, code: u16, comment: &str) {
        self.send(response_for(request, false, code, Some(comment), Value::Null));
    }

    /// Reply to a batch (`op 8`) with the given result entries.
    pub fn respond_batch(&self, batch: &Value, results: Vec<Value>) {
        self.send(json!({
            "op": 9,
            "d": {
                "requestId": batch["d"]["requestId"],
                "results": results,
            }
        }));
    }

    /// Emit an event.
    pub fn event(&self, event_type: &str, intent: u32, data: Value) {
        self.send(json!({
            "op": 5,
            "d": {
                "eventType": event_type,
                "eventIntent": intent,
                "eventData": data,
            }
        }));
    }

    /// Close the connection from the server side.
    pub fn hang_up(&self) {
        self.outbox.close();
        self.inbox.close();
    }

    /// Whether either side has closed the connection.
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed() || self.outbox.is_closed()
    }

    /// Wait until the connection is closed. Returns `false` on timeout.
    pub fn wait_closed(&self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        while Instant::now() < deadline {
            if self.is_closed() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        self.is_closed()
    }

    /// The `Identify` message the client sent during the automatic
    /// handshake.
    pub fn identify(&self) -> Option<Value> {
        self.identify.lock().clone()
    }

    fn serve_handshake(&self, password: Option<&str>) -> bool {
        let mut hello = json!({
            "obsWebSocketVersion": "5.5.0",
            "rpcVersion": RPC_VERSION,
        });
        if password.is_some() {
            hello["authentication"] = json!({"challenge": CHALLENGE, "salt": SALT});
        }
        self.send(json!({"op": 0, "d": hello}));

        let Some(identify) = self.try_recv(DEFAULT_WAIT) else {
            return false;
        };
        if let Some(password) = password {
            let expected = compute_auth(password, SALT, CHALLENGE);
            if identify["d"]["authentication"].as_str() != Some(expected.as_str()) {
                self.hang_up();
                return false;
            }
        }
        *self.identify.lock() = Some(identify);
        self.send(json!({"op": 2, "d": {"negotiatedRpcVersion": RPC_VERSION}}));
        true
    }
}

/// A `RequestResponse` message answering `request`.
pub fn response_for(
    request: &Value,
    result: bool,
    code: u16,
    comment: Option<&str>,
    response_data: Value,
) -> Value {
    let mut d = json!({
        "requestType": request["d"]["requestType"],
        "requestId": request["d"]["requestId"],
        "requestStatus": {"result": result, "code": code},
    });
    if let Some(comment) = comment {
        d["requestStatus"]["comment"] = json!(comment);
    }
    if !response_data.is_null() {
        d["responseData"] = response_data;
    }
    json!({"op": 7, "d": d})
}

/// One entry of a batch response.
pub fn batch_result(request_type: &str, index: usize, result: bool, code: u16) -> Value {
    json!({
        "requestType": request_type,
        "requestId": index.to_string(),
        "requestStatus": {"result": result, "code": code},
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────────────────

enum Mode {
    Auto { password: Option<String> },
    Manual,
    Refuse,
}

struct ConnectorState {
    mode: Mode,
    accepted: Pipe<FakeServer>,
    connections: AtomicUsize,
}

/// Opens in-memory connections to fake servers.
#[derive(Clone)]
pub struct FakeConnector {
    state: Arc<ConnectorState>,
}

impl FakeConnector {
    fn with_mode(mode: Mode) -> Self {
        Self {
            state: Arc::new(ConnectorState {
                mode,
                accepted: Pipe::new(),
                connections: AtomicUsize::new(0),
            }),
        }
    }

    /// Servers that accept any client without a password.
    pub fn new() -> Self {
        Self::with_mode(Mode::Auto { password: None })
    }

    /// Servers that demand `password` and hang up on a wrong one.
    pub fn with_password(password: impl Into<String>) -> Self {
        Self::with_mode(Mode::Auto {
            password: Some(password.into()),
        })
    }

    /// Servers that do nothing until the test drives them, handshake
    /// included.
    pub fn manual() -> Self {
        Self::with_mode(Mode::Manual)
    }

    /// Every connection attempt is refused.
    pub fn refuse() -> Self {
        Self::with_mode(Mode::Refuse)
    }

    /// The next connection that completed the handshake (or any connection,
    /// in manual mode). Panics after [`DEFAULT_WAIT`].
    pub fn accept(&self) -> FakeServer {
        match self.state.accepted.pop(Some(Instant::now() + DEFAULT_WAIT)) {
            Popped::Item(server) => server,
            Popped::Closed | Popped::TimedOut => {
                panic!("no connection accepted within {DEFAULT_WAIT:?}")
            }
        }
    }

    /// Number of `open` calls so far, refused ones included.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Default for FakeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for FakeConnector {
    fn open(&self, _endpoint: &Endpoint) -> Result<Arc<dyn Transport>, TransportError> {
        let _ = self.state.connections.fetch_add(1, Ordering::SeqCst);

        let to_server = Arc::new(Pipe::new());
        let to_client = Arc::new(Pipe::new());
        let server = FakeServer {
            inbox: Arc::clone(&to_server),
            outbox: Arc::clone(&to_client),
            identify: Arc::default(),
        };
        let transport = Arc::new(FakeTransport {
            to_server,
            to_client,
            closed: AtomicBool::new(false),
        });

        match &self.state.mode {
            Mode::Refuse => return Err(TransportError::Refused("connection refused".into())),
            Mode::Manual => {
                let _ = self.state.accepted.push(server);
            }
            Mode::Auto { password } => {
                let password = password.clone();
                let state = Arc::clone(&self.state);
                let _ = thread::Builder::new()
                    .name("fake-obs".into())
                    .spawn(move || {
                        if server.serve_handshake(password.as_deref()) {
                            let _ = state.accepted.push(server);
                        }
                    })
                    .map_err(|e| TransportError::Io(e.to_string()))?;
            }
        }
        Ok(transport)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
