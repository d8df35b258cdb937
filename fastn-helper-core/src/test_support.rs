use crate::{PeerId, StreamId, Transport, TransportError, TransportEvents};
use bytes::Bytes;
use std::sync::{Arc, Mutex};

pub fn peer(n: u8) -> PeerId {
    PeerId::from_bytes([n; 32])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect(PeerId),
    OpenStream(StreamId, PeerId, String),
    Write(StreamId, Bytes),
    Close(StreamId),
    Reset(StreamId),
    Join(String),
    Leave(String),
    Publish(String, Bytes),
}

/// Records every call and succeeds unless told otherwise.
#[derive(Default)]
pub struct StubTransport {
    calls: Mutex<Vec<Call>>,
    events: Mutex<Option<TransportEvents>>,
    fail_opens: Mutex<bool>,
    fail_closes: Mutex<bool>,
    fail_joins: Mutex<bool>,
    open_gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
    close_gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
    leave_gate: Mutex<Option<Arc<tokio::sync::Notify>>>,
}

async fn pass(gate: &Mutex<Option<Arc<tokio::sync::Notify>>>) {
    let gate = gate.lock().unwrap().clone();
    if let Some(gate) = gate {
        gate.notified().await;
    }
}

fn hold(gate: &Mutex<Option<Arc<tokio::sync::Notify>>>) -> Arc<tokio::sync::Notify> {
    let notify = Arc::new(tokio::sync::Notify::new());
    *gate.lock().unwrap() = Some(notify.clone());
    notify
}

impl StubTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn events(&self) -> TransportEvents {
        self.events.lock().unwrap().clone().expect("not attached")
    }

    pub fn fail_opens(&self) {
        *self.fail_opens.lock().unwrap() = true;
    }

    pub fn fail_closes(&self) {
        *self.fail_closes.lock().unwrap() = true;
    }

    pub fn fail_joins(&self) {
        *self.fail_joins.lock().unwrap() = true;
    }

    /// Makes `open_stream` wait until the returned notify fires.
    pub fn hold_opens(&self) -> Arc<tokio::sync::Notify> {
        hold(&self.open_gate)
    }

    pub fn hold_closes(&self) -> Arc<tokio::sync::Notify> {
        hold(&self.close_gate)
    }

    pub fn hold_leaves(&self) -> Arc<tokio::sync::Notify> {
        hold(&self.leave_gate)
    }

    /// Waits until `call` was made.
    pub async fn called(&self, call: &Call) {
        while !self.calls().contains(call) {
            tokio::task::yield_now().await;
        }
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait::async_trait]
impl Transport for StubTransport {
    fn attach(&self, events: TransportEvents) {
        *self.events.lock().unwrap() = Some(events);
    }

    async fn connect(&self, peer: PeerId, _addrs: &[String]) -> Result<(), TransportError> {
        self.record(Call::Connect(peer));
        Ok(())
    }

    async fn open_stream(
        &self,
        stream_id: StreamId,
        peer: PeerId,
        protocol: &str,
    ) -> Result<(), TransportError> {
        self.record(Call::OpenStream(stream_id, peer, protocol.to_string()));
        pass(&self.open_gate).await;
        if *self.fail_opens.lock().unwrap() {
            return Err(TransportError::Rejected {
                peer,
                protocol: protocol.to_string(),
            });
        }
        Ok(())
    }

    async fn write(&self, stream_id: StreamId, data: Bytes) -> Result<(), TransportError> {
        self.record(Call::Write(stream_id, data));
        Ok(())
    }

    async fn close_stream(&self, stream_id: StreamId) -> Result<(), TransportError> {
        self.record(Call::Close(stream_id));
        pass(&self.close_gate).await;
        if *self.fail_closes.lock().unwrap() {
            return Err(TransportError::Io("close failed".to_string()));
        }
        Ok(())
    }

    async fn reset_stream(&self, stream_id: StreamId) -> Result<(), TransportError> {
        self.record(Call::Reset(stream_id));
        Ok(())
    }

    async fn join_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.record(Call::Join(topic.to_string()));
        if *self.fail_joins.lock().unwrap() {
            return Err(TransportError::Io("join failed".to_string()));
        }
        Ok(())
    }

    async fn leave_topic(&self, topic: &str) -> Result<(), TransportError> {
        self.record(Call::Leave(topic.to_string()));
        pass(&self.leave_gate).await;
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Bytes) -> Result<(), TransportError> {
        self.record(Call::Publish(topic.to_string(), data));
        Ok(())
    }
}
