//! Connection handshake: `Hello` → `Identify` → `Identified`.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::Endpoint;
use crate::error::{ObsError, Result};
use crate::protocol::{self, Frame, Hello, Identified, OpCode, RPC_VERSION};
use crate::transport::Transport;

/// Password proof for a challenge:
/// `base64(sha256(base64(sha256(password + salt)) + challenge))`.
pub fn compute_auth(password: &str, salt: &str, challenge: &str) -> String {
    let secret = STANDARD.encode(Sha256::digest(format!("{password}{salt}").as_bytes()));
    STANDARD.encode(Sha256::digest(format!("{secret}{challenge}").as_bytes()))
}

/// Read the server greeting and check its RPC version.
pub(crate) fn read_greeting(transport: &dyn Transport, endpoint: &Endpoint) -> Result<Hello> {
    let message = transport.receive().map_err(|e| ObsError::ConnectFailed {
        endpoint: endpoint.to_string(),
        reason: format!("no greeting from server: {e}"),
    })?;

    let hello = match Frame::decode(message)? {
        Frame::Greeting(hello) => hello,
        other => {
            return Err(ObsError::Protocol(format!(
                "expected Hello, got {}",
                other.name()
            )));
        }
    };
    debug!(
        version = hello.obs_web_socket_version.as_deref().unwrap_or("unknown"),
        rpc_version = hello.rpc_version,
        auth_required = hello.authentication.is_some(),
        "received Hello"
    );

    if hello.rpc_version != RPC_VERSION {
        return Err(ObsError::Protocol(format!(
            "unsupported rpcVersion {} (expected {RPC_VERSION})",
            hello.rpc_version
        )));
    }
    Ok(hello)
}

/// Send `Identify` and wait for the acknowledgement.
///
/// obs-websocket closes the connection on a wrong password, so end of stream
/// here means the credential was rejected.
pub(crate) fn identify(
    transport: &dyn Transport,
    hello: &Hello,
    password: Option<&str>,
    event_subscriptions: u32,
) -> Result<Identified> {
    let authentication = match (&hello.authentication, password) {
        (Some(challenge), Some(password)) => Some(compute_auth(
            password,
            &challenge.salt,
            &challenge.challenge,
        )),
        (Some(_), None) => {
            return Err(ObsError::AuthFailed(
                "server requires a password but none is configured".into(),
            ));
        }
        (None, _) => None,
    };

    transport
        .send(protocol::identify(
            authentication.as_deref(),
            event_subscriptions,
        ))
        .map_err(|e| ObsError::AuthFailed(format!("cannot send Identify: {e}")))?;

    let ack = transport.receive().map_err(|e| {
        ObsError::AuthFailed(format!("server closed the connection during identification ({e})"))
    })?;

    let Some(op) = protocol::opcode_of(&ack) else {
        return Err(ObsError::AuthFailed(
            "empty or malformed identification reply".into(),
        ));
    };
    if op != OpCode::Identified as u64 {
        return Err(ObsError::Protocol(format!(
            "expected Identified (op 2), got op {op}"
        )));
    }
    match Frame::decode(ack) {
        Ok(Frame::IdentifyAck(identified)) => Ok(identified),
        _ => Err(ObsError::AuthFailed("malformed Identified message".into())),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
