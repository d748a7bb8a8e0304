//! The duplex channel a session talks over. Framing below it is the connector's business.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::{ClientMessage, ServerMessage};

/// One open connection to the relay.
pub struct Channel {
    pub outbound: mpsc::UnboundedSender<ClientMessage>,
    pub inbound: mpsc::UnboundedReceiver<ServerMessage>,
}

impl Channel {
    /// Build both ends of an in-process connection.
    pub fn pair() -> (Channel, RemoteEnd) {
        let (client_tx, client_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        (
            Channel { outbound: client_tx, inbound: server_rx },
            RemoteEnd { inbound: client_rx, outbound: server_tx },
        )
    }
}

/// Relay-side view of a `Channel`.
pub struct RemoteEnd {
    pub inbound: mpsc::UnboundedReceiver<ClientMessage>,
    pub outbound: mpsc::UnboundedSender<ServerMessage>,
}

/// Opens connections to the relay.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Channel>;
}
