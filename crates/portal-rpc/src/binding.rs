// ABOUTME: Binds a transport to the framed RPC protocol, producing a client handle.
// ABOUTME: Handles issue one call at a time and close themselves on any transport failure.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::endpoint::ServiceName;
use crate::error::{RemoteApplicationError, RpcError, TransportError};
use crate::protocol::{qualify, read_message, write_message, Message, MessageKind};
use crate::transport::Transport;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a client handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Open,
    Closed,
}

/// Wrap `transport` in the framing protocol, tagging every call with
/// `service` when one is given.
pub fn bind(
    transport: Transport,
    service: Option<ServiceName>,
    call_timeout: Duration,
) -> ClientHandle {
    let handle = ClientHandle {
        id: HandleId::next(),
        transport: Some(transport),
        service,
        next_seq: 1,
        call_timeout,
        calls: 0,
        in_flight: false,
    };
    tracing::trace!(handle = %handle.id, service = ?handle.service, "transport bound");
    handle
}

/// An open connection bound to one (possibly multiplexed) service.
///
/// All calls take `&mut self`: a handle never has more than one request in
/// flight. Callers needing concurrency check out several handles.
///
/// A call whose future is dropped before the reply is read leaves the stream
/// mid-frame. The handle then reports itself closed and shuts the transport
/// on its next use.
pub struct ClientHandle {
    id: HandleId,
    transport: Option<Transport>,
    service: Option<ServiceName>,
    next_seq: u32,
    call_timeout: Duration,
    calls: u64,
    in_flight: bool,
}

impl ClientHandle {
    /// Closed placeholder owning no transport.
    pub(crate) fn detached() -> Self {
        Self {
            id: HandleId(0),
            transport: None,
            service: None,
            next_seq: 1,
            call_timeout: Duration::ZERO,
            calls: 0,
            in_flight: false,
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn state(&self) -> HandleState {
        if self.transport.is_some() && !self.in_flight {
            HandleState::Open
        } else {
            HandleState::Closed
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == HandleState::Open
    }

    pub fn service(&self) -> Option<&ServiceName> {
        self.service.as_ref()
    }

    /// Number of completed round trips on this handle.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Invoke `method` with the default call timeout.
    pub async fn call<Req, Resp>(&mut self, method: &str, request: &Req) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let timeout = self.call_timeout;
        self.call_with_timeout(method, request, timeout).await
    }

    /// Invoke `method` and wait at most `timeout` for the reply.
    ///
    /// Transport failures and timeouts close the handle before returning.
    /// A remote exception leaves it open.
    pub async fn call_with_timeout<Req, Resp>(
        &mut self,
        method: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)?;
        let reply = self.round_trip(method, body, timeout).await?;

        match reply.kind {
            MessageKind::Reply => Ok(serde_json::from_slice(&reply.body)?),
            MessageKind::Exception => Err(decode_exception(&reply.body).into()),
            // round_trip only hands back replies and exceptions.
            MessageKind::Call | MessageKind::Oneway => Err(TransportError::Protocol(format!(
                "unexpected {:?} frame in reply",
                reply.kind
            ))
            .into()),
        }
    }

    /// Send a one-way message. No reply is read.
    pub async fn notify<Req>(&mut self, method: &str, request: &Req) -> Result<(), RpcError>
    where
        Req: Serialize + ?Sized,
    {
        let body = serde_json::to_vec(request)?;
        self.close_if_interrupted();
        let seq = self.take_seq();
        let message = Message::new(MessageKind::Oneway, seq, self.wire_name(method), body);
        let timeout = self.call_timeout;

        self.in_flight = true;
        let result = match self.transport.as_mut() {
            Some(transport) => {
                tokio::time::timeout(timeout, write_message(transport.stream_mut(), &message))
                    .await
                    .unwrap_or(Err(TransportError::Timeout {
                        op: "notify",
                        after: timeout,
                    }))
            }
            None => Err(TransportError::Closed),
        };
        self.in_flight = false;

        if let Err(e) = result {
            self.fail(&e);
            return Err(e.into());
        }
        Ok(())
    }

    /// Close the underlying transport. Idempotent.
    pub fn close(&mut self) {
        self.in_flight = false;
        if let Some(transport) = self.transport.take() {
            tracing::debug!(handle = %self.id, peer = %transport.peer(), "closing client handle");
        }
    }

    fn wire_name(&self, method: &str) -> String {
        qualify(self.service.as_ref(), method)
    }

    fn take_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Close a handle whose previous exchange was cancelled part way.
    fn close_if_interrupted(&mut self) {
        if self.in_flight {
            tracing::debug!(handle = %self.id, "previous call was interrupted, closing handle");
            self.close();
        }
    }

    fn fail(&mut self, err: &TransportError) {
        tracing::debug!(handle = %self.id, error = %err, "transport failure, discarding handle");
        self.close();
    }

    async fn round_trip(
        &mut self,
        method: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        self.close_if_interrupted();
        let seq = self.take_seq();
        let wire_name = self.wire_name(method);

        self.in_flight = true;
        let exchange = self.exchange(seq, &wire_name, method, body);
        let result = match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                op: "call",
                after: timeout,
            }),
        };
        self.in_flight = false;

        match result {
            Ok(reply) => {
                self.calls += 1;
                Ok(reply)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn exchange(
        &mut self,
        seq: u32,
        wire_name: &str,
        method: &str,
        body: Vec<u8>,
    ) -> Result<Message, TransportError> {
        let transport = self.transport.as_mut().ok_or(TransportError::Closed)?;
        let stream = transport.stream_mut();

        write_message(stream, &Message::new(MessageKind::Call, seq, wire_name, body)).await?;

        let reply = read_message(stream).await?.ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ))
        })?;

        if !matches!(reply.kind, MessageKind::Reply | MessageKind::Exception) {
            return Err(TransportError::Protocol(format!(
                "expected reply, got {:?}",
                reply.kind
            )));
        }
        if reply.seq != seq {
            return Err(TransportError::Protocol(format!(
                "out of order reply: expected seq {}, got {}",
                seq, reply.seq
            )));
        }
        if reply.name != wire_name && reply.name != method {
            return Err(TransportError::Protocol(format!(
                "reply for '{}' while waiting on '{}'",
                reply.name, wire_name
            )));
        }
        Ok(reply)
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("service", &self.service)
            .field("state", &self.state())
            .field("calls", &self.calls)
            .finish()
    }
}

fn decode_exception(body: &[u8]) -> RemoteApplicationError {
    serde_json::from_slice(body).unwrap_or_else(|_| {
        RemoteApplicationError::new("Unknown", String::from_utf8_lossy(body).into_owned())
    })
}
