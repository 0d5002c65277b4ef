// ABOUTME: Minimal framed RPC server that dispatches calls on their multiplexed method name.
// ABOUTME: Backs in-process self-tests and integration tests of the client layer.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};
use tokio::net::TcpListener;

use crate::endpoint::ServiceName;
use crate::error::{RemoteApplicationError, TransportError};
use crate::health::DEFAULT_HEALTH_METHOD;
use crate::protocol::{qualify, read_message, write_message, Message, MessageKind};

/// Exception code sent back for methods nobody registered.
pub const UNKNOWN_METHOD: &str = "UnknownMethod";

type HandlerFuture = BoxFuture<'static, Result<Vec<u8>, RemoteApplicationError>>;
type Handler = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Routes wire method names to typed handlers.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `method`, prefixed with `service` when given.
    ///
    /// Request bodies that do not decode as `Req` are answered with a
    /// `BadRequest` exception without calling the handler.
    pub fn register<Req, Resp, F, Fut>(
        &mut self,
        service: Option<&ServiceName>,
        method: &str,
        handler: F,
    ) -> &mut Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RemoteApplicationError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: Handler = Arc::new(move |body: Vec<u8>| -> HandlerFuture {
            let handler = handler.clone();
            Box::pin(async move {
                let request: Req = serde_json::from_slice(&body)
                    .map_err(|e| RemoteApplicationError::new("BadRequest", e.to_string()))?;
                let response = handler(request).await?;
                serde_json::to_vec(&response)
                    .map_err(|e| RemoteApplicationError::new("InternalError", e.to_string()))
            })
        });
        self.handlers.insert(qualify(service, method), erased);
        self
    }

    /// Register the default health method, answering with `version`.
    pub fn register_version(&mut self, service: Option<&ServiceName>, version: &str) -> &mut Self {
        let version = version.to_string();
        self.register(service, DEFAULT_HEALTH_METHOD, move |()| {
            let version = version.clone();
            async move { Ok::<_, RemoteApplicationError>(version) }
        })
    }

    /// Registered wire names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Run the handler registered for `name` against a raw JSON body.
    pub async fn dispatch(
        &self,
        name: &str,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, RemoteApplicationError> {
        match self.handlers.get(name) {
            Some(handler) => handler(body).await,
            None => Err(RemoteApplicationError::new(
                UNKNOWN_METHOD,
                format!("no handler for '{}'", name),
            )),
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("methods", &self.methods())
            .finish()
    }
}

/// Answer framed calls on one connection until the peer hangs up.
///
/// Calls are processed strictly in order. Oneway messages are dispatched
/// without a reply.
pub async fn serve_connection<S>(
    stream: S,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = BufStream::new(stream);

    while let Some(message) = read_message(&mut stream).await? {
        match message.kind {
            MessageKind::Call => {
                let reply = match dispatcher.dispatch(&message.name, message.body).await {
                    Ok(body) => Message::new(MessageKind::Reply, message.seq, message.name, body),
                    Err(err) => {
                        tracing::debug!(
                            method = %message.name,
                            code = %err.code,
                            "call raised exception"
                        );
                        let body = serde_json::to_vec(&err).unwrap_or_default();
                        Message::new(MessageKind::Exception, message.seq, message.name, body)
                    }
                };
                write_message(&mut stream, &reply).await?;
            }
            MessageKind::Oneway => {
                if let Err(err) = dispatcher.dispatch(&message.name, message.body).await {
                    tracing::debug!(method = %message.name, error = %err, "oneway handler failed");
                }
            }
            MessageKind::Reply | MessageKind::Exception => {
                return Err(TransportError::Protocol(format!(
                    "client sent {:?} frame",
                    message.kind
                )));
            }
        }
    }

    tracing::trace!("connection closed by peer");
    Ok(())
}

/// Accept connections forever, serving each on its own task.
pub async fn serve(listener: TcpListener, dispatcher: Arc<Dispatcher>) -> std::io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        tracing::debug!(%peer, "accepted connection");

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(stream, dispatcher).await {
                tracing::warn!(%peer, error = %e, "connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatcher() -> Arc<Dispatcher> {
        let registry = ServiceName::new("SharingRegistry").unwrap();
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .register_version(Some(&registry), "0.18")
            .register(Some(&registry), "countShares", |ids: Vec<String>| async move {
                Ok::<_, RemoteApplicationError>(ids.len())
            });
        Arc::new(dispatcher)
    }

    async fn round_trip<S>(stream: &mut S, message: Message) -> Message
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        write_message(stream, &message).await.unwrap();
        read_message(stream).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_dispatches_multiplexed_call() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, dispatcher()));

        let reply = round_trip(
            &mut client,
            Message::new(
                MessageKind::Call,
                1,
                "SharingRegistry:countShares",
                br#"["a","b","c"]"#.to_vec(),
            ),
        )
        .await;
        assert_eq!(reply.kind, MessageKind::Reply);
        assert_eq!(reply.seq, 1);
        assert_eq!(reply.body, b"3");
    }

    #[tokio::test]
    async fn test_unknown_method_is_exception() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, dispatcher()));

        let reply = round_trip(
            &mut client,
            Message::new(MessageKind::Call, 9, "countShares", b"[]".to_vec()),
        )
        .await;
        assert_eq!(reply.kind, MessageKind::Exception);
        let err: RemoteApplicationError = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(err.code, UNKNOWN_METHOD);
    }

    #[tokio::test]
    async fn test_bad_request_body() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, dispatcher()));

        let reply = round_trip(
            &mut client,
            Message::new(
                MessageKind::Call,
                2,
                "SharingRegistry:countShares",
                b"42".to_vec(),
            ),
        )
        .await;
        let err: RemoteApplicationError = serde_json::from_slice(&reply.body).unwrap();
        assert_eq!(err.code, "BadRequest");
    }

    #[tokio::test]
    async fn test_oneway_gets_no_reply_and_later_calls_still_work() {
        let (mut client, server) = tokio::io::duplex(4096);
        tokio::spawn(serve_connection(server, dispatcher()));

        write_message(
            &mut client,
            &Message::new(MessageKind::Oneway, 1, "SharingRegistry:countShares", b"[]".to_vec()),
        )
        .await
        .unwrap();

        let reply = round_trip(
            &mut client,
            Message::new(
                MessageKind::Call,
                2,
                "SharingRegistry:getAPIVersion",
                b"null".to_vec(),
            ),
        )
        .await;
        assert_eq!(reply.seq, 2);
        assert_eq!(reply.body, b"\"0.18\"");
    }

    #[tokio::test]
    async fn test_reply_from_client_is_protocol_error() {
        let (mut client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, dispatcher()));

        write_message(
            &mut client,
            &Message::new(MessageKind::Reply, 1, "x", Vec::new()),
        )
        .await
        .unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_clean_close_ends_connection() {
        let (client, server) = tokio::io::duplex(4096);
        let task = tokio::spawn(serve_connection(server, dispatcher()));
        drop(client);
        assert!(task.await.unwrap().is_ok());
    }

    #[test]
    fn test_methods_sorted() {
        let dispatcher = dispatcher();
        assert_eq!(
            dispatcher.methods(),
            vec!["SharingRegistry:countShares", "SharingRegistry:getAPIVersion"]
        );
        assert!(format!("{:?}", dispatcher).contains("countShares"));
    }
}
