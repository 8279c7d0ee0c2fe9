use {
    crate::{
        transport::{Connection, Transport, TransportEvent},
        ConnectionOptions,
        Error,
        Result,
    },
    async_trait::async_trait,
    futures_util::{SinkExt, StreamExt},
    tokio::sync::mpsc,
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, warn},
};

/// WebSocket transport to a real relay.
#[derive(Debug, Clone, Default)]
pub struct WebsocketTransport;

impl WebsocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebsocketTransport {
    async fn connect(&self, options: &ConnectionOptions) -> Result<Connection> {
        let request = options.as_ws_request()?;
        let (socket, _) = connect_async(request)
            .await
            .map_err(|err| Error::ConnectionFailed(err.to_string()))?;
        let (mut write, mut read) = socket.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let writer_events = inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = write.send(Message::Text(text.into())).await {
                    warn!(?err, "failed to send frame");
                    let _ = writer_events.send(TransportEvent::Error(err.to_string()));
                    break;
                }
            }

            if let Err(err) = write.close().await {
                debug!(?err, "failed to close socket");
            }
        });

        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if inbound_tx
                            .send(TransportEvent::Message(text.as_str().to_owned()))
                            .is_err()
                        {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|frame| frame.reason.as_str().to_owned());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        let _ = inbound_tx.send(TransportEvent::Error(err.to_string()));
                        break Some(err.to_string());
                    }
                    None => break None,
                }
            };

            debug!(?reason, "socket closed");
            let _ = inbound_tx.send(TransportEvent::Closed(reason));
        });

        Ok(Connection {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
