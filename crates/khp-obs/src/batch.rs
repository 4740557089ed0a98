//! Request batches (`op 8` / `op 9`).

use std::fmt;
use std::str::FromStr;

use serde_json::{Value, json};

use crate::error::{ObsError, Result};
use crate::protocol::{self, RequestResponse, RequestStatus, status};

/// `executionType` values.
pub mod execution_type {
    /// One after another, as fast as possible.
    pub const SERIAL_REALTIME: i8 = 0;
    /// One per rendered frame.
    pub const SERIAL_FRAME: i8 = 1;
    /// All at once on a thread pool.
    pub const PARALLEL: i8 = 2;
}

/// How the server should run a batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BatchMode {
    /// Serial; stop at the first failed item.
    #[default]
    HaltOnFailure,
    /// Serial; run every item regardless of failures.
    ContinueOnFailure,
    /// Concurrent; run every item.
    Parallel,
}

impl BatchMode {
    /// `haltOnFailure` flag.
    pub fn halt_on_failure(self) -> bool {
        matches!(self, Self::HaltOnFailure)
    }

    /// `executionType` value.
    pub fn execution_type(self) -> i8 {
        match self {
            Self::HaltOnFailure | Self::ContinueOnFailure => execution_type::SERIAL_REALTIME,
            Self::Parallel => execution_type::PARALLEL,
        }
    }
}

impl fmt::Display for BatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::HaltOnFailure => "halt",
            Self::ContinueOnFailure => "continue",
            Self::Parallel => "parallel",
        })
    }
}

impl FromStr for BatchMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "halt" => Ok(Self::HaltOnFailure),
            "continue" => Ok(Self::ContinueOnFailure),
            "parallel" => Ok(Self::Parallel),
            other => Err(format!(
                "unknown batch mode '{other}' (expected halt, continue or parallel)"
            )),
        }
    }
}

/// One request inside a batch.
#[derive(Clone, Debug, PartialEq)]
pub struct BatchItem {
    /// e.g. `SetCurrentProgramScene`.
    pub request_type: String,
    /// Request payload; `Null` is omitted.
    pub request_data: Value,
}

impl BatchItem {
    /// Item with a payload.
    pub fn new(request_type: impl Into<String>, request_data: Value) -> Self {
        Self {
            request_type: request_type.into(),
            request_data,
        }
    }

    /// Item without a payload.
    pub fn bare(request_type: impl Into<String>) -> Self {
        Self::new(request_type, Value::Null)
    }
}

/// Build the `op 8` message. Each item's `requestId` is its index.
pub(crate) fn encode(request_id: &str, items: &[BatchItem], mode: BatchMode) -> Value {
    let requests = items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let mut request = json!({
                "requestType": item.request_type,
                "requestId": index.to_string(),
            });
            if !item.request_data.is_null() {
                request["requestData"] = item.request_data.clone();
            }
            request
        })
        .collect();
    protocol::request_batch(
        request_id,
        mode.halt_on_failure(),
        mode.execution_type(),
        requests,
    )
}

/// Put the server's results back into input order, one per item.
///
/// Results are placed by their item index, or by position when the server
/// did not echo one. Items the server never ran get a synthesized failure.
pub(crate) fn order_results(
    items: &[BatchItem],
    results: Vec<RequestResponse>,
) -> Result<Vec<RequestResponse>> {
    if results.len() > items.len() {
        return Err(ObsError::Protocol(format!(
            "batch of {} returned {} results",
            items.len(),
            results.len()
        )));
    }

    let mut ordered: Vec<Option<RequestResponse>> = vec![None; items.len()];
    for (position, result) in results.into_iter().enumerate() {
        let index = result
            .request_id
            .parse::<usize>()
            .ok()
            .filter(|i| *i < items.len())
            .unwrap_or(position);
        if result.request_type != items[index].request_type {
            return Err(ObsError::Protocol(format!(
                "batch item {index} is {} but the result is for {}",
                items[index].request_type, result.request_type
            )));
        }
        if ordered[index].replace(result).is_some() {
            return Err(ObsError::Protocol(format!(
                "duplicate result for batch item {index}"
            )));
        }
    }

    Ok(ordered
        .into_iter()
        .enumerate()
        .map(|(index, result)| result.unwrap_or_else(|| not_executed(index, &items[index])))
        .collect())
}

fn not_executed(index: usize, item: &BatchItem) -> RequestResponse {
    RequestResponse {
        request_type: item.request_type.clone(),
        request_id: index.to_string(),
        request_status: RequestStatus {
            result: false,
            code: status::UNKNOWN,
            comment: Some("not executed".into()),
        },
        response_data: None,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
