//! RPC endpoint of an instrument server.
//!
//! One accept loop per running endpoint; every client connection runs as its
//! own task and handles its requests in order. A request naming a device first
//! waits for that device's lock. While it waits, the task keeps watching the
//! socket and the shutdown token: if the peer goes away or the endpoint stops,
//! the wait is abandoned. Once the lock is held the driver call always runs to
//! completion, and the lock is released when it returns.
//!
//! Cancelling the endpoint token stops accepting; [`serve`] returns after
//! every connection task has finished its current call.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::devices::{AccessError, DeviceLease, DeviceSet};
use crate::protocol::{self, RemoteError, RemoteErrorKind, Request, Response};
use crate::units::UnitRegistry;
use crate::value::AttrValue;

/// Shared state every connection task needs.
pub struct EndpointContext {
    pub server_name: String,
    pub devices: Arc<DeviceSet>,
    pub units: Arc<UnitRegistry>,
}

/// Accept connections until `shutdown` is cancelled.
pub async fn serve(listener: TcpListener, context: Arc<EndpointContext>, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    debug!(%peer, "Client connected");
                    connections.spawn(handle_connection(socket, peer, context.clone(), shutdown.clone()));
                }
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            },
            Some(finished) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = finished {
                    if e.is_panic() {
                        warn!(error = %e, "Connection task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    let open = connections.len();
    while let Some(finished) = connections.join_next().await {
        if let Err(e) = finished {
            warn!(error = %e, "Connection task failed");
        }
    }
    info!(server = %context.server_name, closed_connections = open, "Endpoint stopped");
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    context: Arc<EndpointContext>,
    shutdown: CancellationToken,
) {
    if let Err(e) = socket.set_nodelay(true) {
        trace!(%peer, error = %e, "Failed to set TCP_NODELAY");
    }
    let mut framed = Framed::new(socket, protocol::codec());

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = framed.next() => next,
        };
        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                debug!(%peer, error = %e, "Read failed");
                break;
            }
            None => break,
        };

        let request: Request = match protocol::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(%peer, error = %e, "Malformed request; closing connection");
                break;
            }
        };
        trace!(%peer, request = request.name(), device = ?request.device(), "Request");

        let response = match request.device().map(str::to_string) {
            Some(device) => {
                // Clients never pipeline, so anything arriving on the socket
                // while waiting (EOF, error or an extra frame) ends the
                // connection.
                let lease = tokio::select! {
                    lease = context.devices.acquire(&device) => lease,
                    _ = framed.next() => {
                        debug!(%peer, device = %device, "Client went away while waiting for the device");
                        break;
                    }
                    _ = shutdown.cancelled() => break,
                };
                dispatch_leased(&context, request, lease).await
            }
            None => describe(&context, &request),
        };

        let encoded = match protocol::encode(&response) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(%peer, error = %e, "Failed to encode response");
                break;
            }
        };
        if let Err(e) = framed.send(encoded).await {
            debug!(%peer, error = %e, "Write failed");
            break;
        }
    }

    debug!(%peer, "Client disconnected");
}

/// Execute one request against the device set, waiting for the device lock
/// when the request names a device.
pub async fn dispatch(context: &EndpointContext, request: Request) -> Response {
    match request.device().map(str::to_string) {
        Some(device) => {
            let lease = context.devices.acquire(&device).await;
            dispatch_leased(context, request, lease).await
        }
        None => describe(context, &request),
    }
}

/// Requests that need no device.
fn describe(context: &EndpointContext, request: &Request) -> Response {
    match request {
        Request::Ping => Response::Pong {
            server: context.server_name.clone(),
        },
        Request::ListDevices => Response::Devices(context.devices.names()),
        other => Response::Error(RemoteError::new(
            RemoteErrorKind::Internal,
            format!("{} requires a device", other.name()),
        )),
    }
}

async fn dispatch_leased(
    context: &EndpointContext,
    request: Request,
    lease: Result<DeviceLease, AccessError>,
) -> Response {
    let mut lease = match lease {
        Ok(lease) => lease,
        Err(e) => return Response::Error(e.to_remote()),
    };

    match request {
        Request::ListAttributes { .. } => match lease.attributes() {
            Ok(attributes) => Response::Attributes(attributes),
            Err(e) => Response::Error(e.to_remote()),
        },
        Request::GetAttribute { device, attribute } => match lease.get(&attribute).await {
            Ok(value) => Response::Value(value.to_wire()),
            Err(e) => {
                debug!(device = %device, attribute = %attribute, error = %e, "Get failed");
                Response::Error(e.to_remote())
            }
        },
        Request::SetAttribute {
            device,
            attribute,
            value,
        } => {
            let value = match AttrValue::from_wire(value, &context.units) {
                Ok(value) => value,
                Err(e) => return Response::Error(RemoteError::new(RemoteErrorKind::InvalidValue, e.to_string())),
            };
            match lease.set(&attribute, value).await {
                Ok(()) => Response::Done,
                Err(e) => {
                    debug!(device = %device, attribute = %attribute, error = %e, "Set failed");
                    Response::Error(e.to_remote())
                }
            }
        }
        other => describe(context, &other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::drivers::{mock, DriverCatalog};
    use crate::protocol::Value;

    async fn context() -> EndpointContext {
        let units = Arc::new(UnitRegistry::new());
        let devices = Arc::new(DeviceSet::new());
        devices
            .load(
                &DeviceConfig::new("sg", mock::SIGNAL_GENERATOR),
                &DriverCatalog::with_builtin(),
                units.clone(),
            )
            .await
            .unwrap();
        EndpointContext {
            server_name: "lab1".into(),
            devices,
            units,
        }
    }

    #[tokio::test]
    async fn ping_and_enumerate() {
        let ctx = context().await;
        assert_eq!(
            dispatch(&ctx, Request::Ping).await,
            Response::Pong {
                server: "lab1".into()
            }
        );
        assert_eq!(
            dispatch(&ctx, Request::ListDevices).await,
            Response::Devices(vec!["sg".into()])
        );
    }

    #[tokio::test]
    async fn set_interprets_units_locally() {
        let ctx = context().await;
        let response = dispatch(
            &ctx,
            Request::SetAttribute {
                device: "sg".into(),
                attribute: "amplitude".into(),
                value: Value::Quantity {
                    magnitude: 1500.0,
                    unit: "millivolt".into(),
                },
            },
        )
        .await;
        assert_eq!(response, Response::Done);

        let Response::Value(Value::Quantity { magnitude, unit }) = dispatch(
            &ctx,
            Request::GetAttribute {
                device: "sg".into(),
                attribute: "amplitude".into(),
            },
        )
        .await
        else {
            panic!("expected a quantity");
        };
        assert!((magnitude - 1.5).abs() < 1e-12);
        assert_eq!(unit, "volt");
    }

    #[tokio::test]
    async fn errors_are_classified() {
        let ctx = context().await;

        let response = dispatch(
            &ctx,
            Request::GetAttribute {
                device: "ghost".into(),
                attribute: "x".into(),
            },
        )
        .await;
        assert!(matches!(response, Response::Error(RemoteError { kind: RemoteErrorKind::DeviceNotFound, .. })));

        let response = dispatch(
            &ctx,
            Request::SetAttribute {
                device: "sg".into(),
                attribute: "amplitude".into(),
                value: Value::Quantity {
                    magnitude: 1.0,
                    unit: "furlong".into(),
                },
            },
        )
        .await;
        assert!(matches!(response, Response::Error(RemoteError { kind: RemoteErrorKind::InvalidValue, .. })));

        let response = dispatch(
            &ctx,
            Request::SetAttribute {
                device: "ghost".into(),
                attribute: "amplitude".into(),
                value: Value::Null,
            },
        )
        .await;
        assert!(matches!(response, Response::Error(RemoteError { kind: RemoteErrorKind::DeviceNotFound, .. })));
    }
}
