//! Broker Transport
//!
//! The seam between [`StreamManager`](super::stream::StreamManager) and the
//! MQTT client. A [`Connector`] performs the handshake and subscription for
//! one session; the resulting [`Link`] yields publishes until it drops.
//!
//! [`MqttConnector`] is the production implementation over `rumqttc`
//! (MQTT 3.1.1, TLS through rustls with platform roots).

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, Transport,
};

use super::auth::Credentials;
use super::stream::StreamError;

/// Largest publish accepted from the broker.
const MAX_INCOMING_PACKET: usize = 256 * 1024;

/// Largest packet we send (CONNECT/SUBSCRIBE only).
const MAX_OUTGOING_PACKET: usize = 10 * 1024;

/// Request channel capacity between client handle and event loop.
const CLIENT_CAPACITY: usize = 10;

/// How long a closing link may take to flush its DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to open one broker session.
#[derive(Debug, Clone)]
pub struct SessionParams {
    /// Broker host.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// MQTT keepalive interval.
    pub keepalive: Duration,
    /// Account credentials (username, password, client id, topic).
    pub credentials: Credentials,
}

/// Result of a completed CONNECT exchange.
pub enum Handshake {
    /// Broker accepted the session and the subscription was issued.
    Accepted(Box<dyn Link>),
    /// Broker answered CONNACK with a refusal code.
    Refused(ConnectReturnCode),
}

/// Something that happened on a live link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A publish on the subscribed topic.
    Publish(Vec<u8>),
    /// The link is gone; carries the reason.
    Lost(String),
}

/// Opens broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect, wait for CONNACK and subscribe on acceptance.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Connection`] on transport failure or
    /// [`StreamError::Client`] if the subscription cannot be queued.
    async fn connect(&self, params: &SessionParams) -> Result<Handshake, StreamError>;
}

/// A connected, subscribed session.
#[async_trait]
pub trait Link: Send {
    /// Wait for the next publish or for the link to drop.
    async fn next(&mut self) -> LinkEvent;

    /// Send DISCONNECT and give it a short grace period to flush.
    async fn close(&mut self);
}

// =============================================================================
// rumqttc
// =============================================================================

/// [`Connector`] over `rumqttc` with TLS.
#[derive(Debug, Clone, Copy, Default)]
pub struct MqttConnector;

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, params: &SessionParams) -> Result<Handshake, StreamError> {
        let credentials = &params.credentials;
        let mut options = MqttOptions::new(credentials.client_id(), &params.host, params.port);
        options.set_credentials(credentials.gcid(), credentials.id_token());
        options.set_keep_alive(params.keepalive);
        options.set_clean_session(true);
        options.set_max_packet_size(MAX_INCOMING_PACKET, MAX_OUTGOING_PACKET);
        options.set_transport(Transport::tls_with_default_config());

        let (client, mut eventloop) = AsyncClient::new(options, CLIENT_CAPACITY);
        let code = await_connack(&mut eventloop).await?;
        if code != ConnectReturnCode::Success {
            return Ok(Handshake::Refused(code));
        }

        client
            .subscribe(credentials.topic(), QoS::AtLeastOnce)
            .await?;
        Ok(Handshake::Accepted(Box::new(MqttLink { client, eventloop })))
    }
}

struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

#[async_trait]
impl Link for MqttLink {
    async fn next(&mut self) -> LinkEvent {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    return LinkEvent::Publish(publish.payload.to_vec());
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    return LinkEvent::Lost("broker sent disconnect".to_string());
                }
                Ok(_) => {}
                Err(e) => return LinkEvent::Lost(e.to_string()),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            tracing::debug!(error = %e, "Could not queue DISCONNECT");
        }
        let eventloop = &mut self.eventloop;
        let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            tracing::debug!("DISCONNECT not flushed before grace period");
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<ConnectReturnCode, ConnectionError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => return Ok(ack.code),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => return Ok(code),
            Err(e) => return Err(e),
        }
    }
}
