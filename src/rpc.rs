//! RPC channel to an instrument server.
//!
//! [`RpcChannel`] is the contract the connection manager and device proxies
//! program against. [`RpcClient`] implements it over TCP using the frame codec
//! from [`crate::protocol`].
//!
//! Every call is a synchronous round trip bounded by the connection timeout.
//! A call that times out or hits an I/O error *poisons* the channel: the
//! socket is dropped and every later call fails immediately with
//! [`InservError::Connection`]. The channel stays where it is (the manager
//! keeps its map entry) until it is reconnected or disconnected.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::error::{InservError, InservResult};
use crate::protocol::{self, AttributeInfo, ProtocolError, RemoteError, Request, Response, Value};

/// Reason reported for calls that exceed the timeout.
pub const TIMED_OUT: &str = "timed out";

/// Request/response access to one instrument server.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    /// Id of the server at the other end.
    fn server_id(&self) -> &str;

    /// Liveness check; returns the server's own name.
    async fn ping(&self) -> InservResult<String>;

    async fn list_devices(&self) -> InservResult<Vec<String>>;

    async fn list_attributes(&self, device: &str) -> InservResult<Vec<AttributeInfo>>;

    async fn get_attribute(&self, device: &str, attribute: &str) -> InservResult<Value>;

    async fn set_attribute(&self, device: &str, attribute: &str, value: Value)
        -> InservResult<()>;

    /// Close the channel. Later calls fail with a connection error.
    async fn close(&self) -> InservResult<()>;
}

type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// TCP implementation of [`RpcChannel`].
pub struct RpcClient {
    server_id: String,
    endpoint: String,
    timeout: Duration,
    stream: Mutex<Option<FramedStream>>,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("server_id", &self.server_id)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RpcClient {
    /// Open a channel and perform the `Ping` handshake.
    ///
    /// Both the TCP connect and the handshake are bounded by `timeout`, which
    /// also bounds every later call on the channel.
    pub async fn connect(
        server_id: &str,
        address: &str,
        port: u16,
        timeout: Duration,
    ) -> InservResult<Self> {
        let endpoint = format!("{address}:{port}");
        let connect_error = |reason: String| InservError::Connect {
            server_id: server_id.to_string(),
            address: endpoint.clone(),
            reason,
        };

        let stream = tokio::time::timeout(timeout, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| connect_error(TIMED_OUT.to_string()))?
            .map_err(|e| connect_error(e.to_string()))?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(server_id, error = %e, "Failed to set TCP_NODELAY");
        }

        let client = Self {
            server_id: server_id.to_string(),
            endpoint: endpoint.clone(),
            timeout,
            stream: Mutex::new(Some(Framed::new(stream, protocol::codec()))),
        };

        match client.ping().await {
            Ok(name) => {
                if name != server_id {
                    warn!(server_id, reported = %name, "Server reports a different name");
                }
                debug!(server_id, endpoint = %endpoint, "Channel open");
                Ok(client)
            }
            Err(InservError::Connection { reason, .. }) => Err(connect_error(reason)),
            Err(e) => Err(connect_error(e.to_string())),
        }
    }

    /// `address:port` of the server.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether the socket is still usable (not closed or poisoned).
    pub async fn is_open(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    fn connection_error(&self, reason: impl Into<String>) -> InservError {
        InservError::Connection {
            server_id: self.server_id.clone(),
            reason: reason.into(),
        }
    }

    fn remote_error(&self, device: &str, error: RemoteError) -> InservError {
        InservError::Remote {
            server_id: self.server_id.clone(),
            device: device.to_string(),
            kind: error.kind,
            message: error.message,
        }
    }

    async fn call(&self, request: Request) -> InservResult<Response> {
        let name = request.name();
        let frame = protocol::encode(&request)?;

        let mut guard = self.stream.lock().await;
        let Some(framed) = guard.as_mut() else {
            return Err(self.connection_error("channel closed"));
        };

        let exchange = async {
            framed.send(frame).await?;
            framed.next().await.transpose()
        };

        let outcome = tokio::time::timeout(self.timeout, exchange).await;
        let reply = match outcome {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => {
                *guard = None;
                return Err(self.connection_error("connection closed by server"));
            }
            Ok(Err(e)) => {
                *guard = None;
                warn!(server_id = %self.server_id, request = name, error = %e, "Channel failed");
                return Err(self.connection_error(e.to_string()));
            }
            Err(_) => {
                *guard = None;
                warn!(server_id = %self.server_id, request = name, "Call timed out; channel poisoned");
                return Err(self.connection_error(TIMED_OUT));
            }
        };

        protocol::decode(&reply).map_err(|e| {
            *guard = None;
            e.into()
        })
    }

    fn unexpected(request: &'static str, response: Response) -> InservError {
        ProtocolError::UnexpectedResponse {
            request,
            response: format!("{response:?}"),
        }
        .into()
    }
}

#[async_trait]
impl RpcChannel for RpcClient {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    async fn ping(&self) -> InservResult<String> {
        match self.call(Request::Ping).await? {
            Response::Pong { server } => Ok(server),
            other => Err(Self::unexpected("ping", other)),
        }
    }

    async fn list_devices(&self) -> InservResult<Vec<String>> {
        match self.call(Request::ListDevices).await? {
            Response::Devices(devices) => Ok(devices),
            Response::Error(e) => Err(self.remote_error("*", e)),
            other => Err(Self::unexpected("list_devices", other)),
        }
    }

    async fn list_attributes(&self, device: &str) -> InservResult<Vec<AttributeInfo>> {
        let request = Request::ListAttributes {
            device: device.to_string(),
        };
        match self.call(request).await? {
            Response::Attributes(attributes) => Ok(attributes),
            Response::Error(e) => Err(self.remote_error(device, e)),
            other => Err(Self::unexpected("list_attributes", other)),
        }
    }

    async fn get_attribute(&self, device: &str, attribute: &str) -> InservResult<Value> {
        let request = Request::GetAttribute {
            device: device.to_string(),
            attribute: attribute.to_string(),
        };
        match self.call(request).await? {
            Response::Value(value) => Ok(value),
            Response::Error(e) => Err(self.remote_error(device, e)),
            other => Err(Self::unexpected("get_attribute", other)),
        }
    }

    async fn set_attribute(
        &self,
        device: &str,
        attribute: &str,
        value: Value,
    ) -> InservResult<()> {
        let request = Request::SetAttribute {
            device: device.to_string(),
            attribute: attribute.to_string(),
            value,
        };
        match self.call(request).await? {
            Response::Done => Ok(()),
            Response::Error(e) => Err(self.remote_error(device, e)),
            other => Err(Self::unexpected("set_attribute", other)),
        }
    }

    async fn close(&self) -> InservResult<()> {
        let Some(mut framed) = self.stream.lock().await.take() else {
            return Ok(());
        };
        match tokio::time::timeout(self.timeout, SinkExt::<Bytes>::close(&mut framed)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.connection_error(e.to_string())),
            Err(_) => Err(self.connection_error(TIMED_OUT)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Accepts one connection, answers the handshake, then serves `reply`
    /// for every further request (or stays silent when `None`).
    async fn scripted_server(reply: Option<Response>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, protocol::codec());
            while let Some(Ok(frame)) = framed.next().await {
                let request: Request = protocol::decode(&frame).unwrap();
                let response = match (&request, &reply) {
                    (Request::Ping, _) => Response::Pong {
                        server: "lab1".into(),
                    },
                    (_, Some(reply)) => reply.clone(),
                    (_, None) => {
                        tokio::time::sleep(Duration::from_secs(3600)).await;
                        continue;
                    }
                };
                framed.send(protocol::encode(&response).unwrap()).await.unwrap();
            }
        });
        port
    }

    #[tokio::test]
    async fn unreachable_server_reports_address() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = RpcClient::connect("lab1", "127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            InservError::Connect {
                server_id, address, ..
            } => {
                assert_eq!(server_id, "lab1");
                assert_eq!(address, format!("127.0.0.1:{port}"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn silent_handshake_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _hold = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let err = RpcClient::connect("lab1", "127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, InservError::Connect { reason, .. } if reason == TIMED_OUT));
    }

    #[tokio::test]
    async fn remote_errors_carry_kind() {
        let reply = Response::Error(RemoteError::new(
            protocol::RemoteErrorKind::DeviceNotFound,
            "no such device",
        ));
        let port = scripted_server(Some(reply)).await;
        let client = RpcClient::connect("lab1", "127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();

        let err = client.get_attribute("ghost", "power").await.unwrap_err();
        assert!(matches!(
            err,
            InservError::Remote { ref device, kind: protocol::RemoteErrorKind::DeviceNotFound, .. } if device == "ghost"
        ));
        assert!(client.is_open().await);
    }

    #[tokio::test]
    async fn timeout_poisons_channel() {
        let port = scripted_server(None).await;
        let client = RpcClient::connect("lab1", "127.0.0.1", port, Duration::from_millis(200))
            .await
            .unwrap();

        let err = client.get_attribute("sg", "amplitude").await.unwrap_err();
        assert!(matches!(err, InservError::Connection { ref reason, .. } if reason == TIMED_OUT));
        assert!(!client.is_open().await);

        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, InservError::Connection { ref reason, .. } if reason == "channel closed"));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let port = scripted_server(Some(Response::Done)).await;
        let client = RpcClient::connect("lab1", "127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();

        client
            .set_attribute("sg", "output", Value::Bool(true))
            .await
            .unwrap();
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert!(client.list_devices().await.is_err());
    }
}
