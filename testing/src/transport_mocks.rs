//! Scriptable in-memory stream transport.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use futures::future::BoxFuture;
use relayflow_core::transport::{StreamMessage, StreamTransport, TransportError, fields};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Vec<(String, StreamMessage)>>,
    next_id: u64,
    appends: u64,
    fail_next: u32,
    failing_event_types: HashSet<String>,
    failing_event_types_on: HashSet<(String, String)>,
    failing_streams: HashSet<String>,
    fail_reads: bool,
}

/// In-memory streams that fail on demand.
///
/// Failures can be scripted per event type (on every stream, or on one stream
/// only), per stream, or for the next `n` appends whatever they carry.
///
/// # Example
///
/// ```
/// use relayflow_testing::ScriptedTransport;
/// use relayflow_core::transport::{StreamMessage, StreamTransport};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = ScriptedTransport::new();
/// transport.fail_event_type_on("events:workitem", "WORKITEM_STARTED");
///
/// let message = StreamMessage::new().with("event_type", "WORKITEM_STARTED");
/// assert!(transport.append("events:workitem", &message, 100).await.is_err());
/// assert!(transport.append("events:dlq", &message, 100).await.is_ok());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<State>>,
}

impl ScriptedTransport {
    /// A transport that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every append whose message has this `event_type`.
    pub fn fail_event_type(&self, event_type: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .failing_event_types
            .insert(event_type.into());
    }

    /// Fail appends of this `event_type` to one stream; other streams accept it.
    pub fn fail_event_type_on(&self, stream: impl Into<String>, event_type: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .failing_event_types_on
            .insert((stream.into(), event_type.into()));
    }

    /// Fail every append to this stream.
    pub fn fail_stream(&self, stream: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .failing_streams
            .insert(stream.into());
    }

    /// Fail the next `count` appends.
    pub fn fail_next(&self, count: u32) {
        self.state.lock().unwrap().fail_next = count;
    }

    /// Fail reads.
    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().unwrap().fail_reads = fail;
    }

    /// Drop every scripted failure.
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_next = 0;
        state.failing_event_types.clear();
        state.failing_event_types_on.clear();
        state.failing_streams.clear();
        state.fail_reads = false;
    }

    /// Number of append attempts so far, failed ones included.
    #[must_use]
    pub fn appends(&self) -> u64 {
        self.state.lock().unwrap().appends
    }

    /// Messages of a stream, oldest first.
    #[must_use]
    pub fn messages(&self, stream: &str) -> Vec<StreamMessage> {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .map(|messages| messages.iter().map(|(_, m)| m.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of messages in a stream.
    #[must_use]
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .streams
            .get(stream)
            .map_or(0, Vec::len)
    }

    /// Append without consulting the failure script (for seeding fixtures).
    pub fn seed(&self, stream: &str, message: StreamMessage) -> String {
        let mut state = self.state.lock().unwrap();
        push(&mut state, stream, message, usize::MAX)
    }
}

fn push(state: &mut State, stream: &str, message: StreamMessage, max_len: usize) -> String {
    state.next_id += 1;
    let id = format!("0-{}", state.next_id);
    let messages = state.streams.entry(stream.to_string()).or_default();
    messages.push((id.clone(), message));
    if messages.len() > max_len {
        let excess = messages.len() - max_len;
        messages.drain(..excess);
    }
    id
}

impl StreamTransport for ScriptedTransport {
    fn append<'a>(
        &'a self,
        stream: &'a str,
        message: &'a StreamMessage,
        max_len: usize,
    ) -> BoxFuture<'a, Result<String, TransportError>> {
        Box::pin(async move {
            let mut state = self.state.lock().unwrap();
            state.appends += 1;

            let scripted = if state.fail_next > 0 {
                state.fail_next -= 1;
                Some("scripted failure".to_string())
            } else if state.failing_streams.contains(stream) {
                Some(format!("stream {stream} unavailable"))
            } else {
                message
                    .get(fields::EVENT_TYPE)
                    .filter(|event_type| {
                        state.failing_event_types.contains(*event_type)
                            || state
                                .failing_event_types_on
                                .contains(&(stream.to_string(), (*event_type).to_string()))
                    })
                    .map(|event_type| format!("event type {event_type} rejected"))
            };

            if let Some(reason) = scripted {
                return Err(TransportError::PublishFailed {
                    stream: stream.to_string(),
                    reason,
                });
            }

            Ok(push(&mut state, stream, message.clone(), max_len))
        })
    }

    fn read<'a>(
        &'a self,
        stream: &'a str,
        count: usize,
    ) -> BoxFuture<'a, Result<Vec<(String, StreamMessage)>, TransportError>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            if state.fail_reads {
                return Err(TransportError::ReadFailed(format!("stream {stream} unavailable")));
            }
            Ok(state
                .streams
                .get(stream)
                .map(|messages| messages.iter().take(count).cloned().collect())
                .unwrap_or_default())
        })
    }

    fn delete<'a>(
        &'a self,
        stream: &'a str,
        id: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if let Some(messages) = self.state.lock().unwrap().streams.get_mut(stream) {
                messages.retain(|(existing, _)| existing != id);
            }
            Ok(())
        })
    }

    fn len<'a>(&'a self, stream: &'a str) -> BoxFuture<'a, Result<u64, TransportError>> {
        Box::pin(async move {
            let state = self.state.lock().unwrap();
            if state.fail_reads {
                return Err(TransportError::ReadFailed(format!("stream {stream} unavailable")));
            }
            let len = state.streams.get(stream).map_or(0, Vec::len);
            Ok(u64::try_from(len).unwrap_or(u64::MAX))
        })
    }
}
