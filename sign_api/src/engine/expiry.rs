use {
    super::{flow::FlowEvent, Engine},
    crate::{error::SignError, events::SignEvent},
    core_api::expirer::{ExpirerEvent, ExpirerTarget},
    pairing_api::PairingEvent,
    relay_rpc::domain::{MessageId, Topic},
    std::sync::Weak,
    tokio::sync::broadcast,
    tracing::{debug, warn},
};

pub(super) async fn watch_expirations(
    engine: Weak<Engine>,
    mut events: broadcast::Receiver<ExpirerEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "expirer events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let ExpirerEvent::Expired(expiration) = event else {
            continue;
        };
        let Some(engine) = engine.upgrade() else {
            break;
        };
        let result = match expiration.target {
            ExpirerTarget::Topic(topic) => engine.on_topic_expired(&topic).await,
            ExpirerTarget::Id(id) => engine.on_id_expired(id).await,
        };
        if let Err(err) = result {
            warn!(?err, "failed to clean up after expiry");
        }
    }
}

/// Forwards pairing notifications as client events.
pub(super) async fn watch_pairing(engine: Weak<Engine>, mut events: broadcast::Receiver<PairingEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "pairing events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let Some(engine) = engine.upgrade() else {
            break;
        };
        engine.notify(match event {
            PairingEvent::Ping { id, topic } => SignEvent::PairingPing { id, topic },
            PairingEvent::Deleted { id, topic } => SignEvent::PairingDelete { id, topic },
            PairingEvent::Expired { topic } => SignEvent::PairingExpired { topic },
        });
    }
}

impl Engine {
    /// Pairing topics share the expirer and are left to the pairing client.
    async fn on_topic_expired(&self, topic: &Topic) -> crate::error::Result<()> {
        if !self.sessions.contains(topic).await {
            return Ok(());
        }
        self.delete_session(topic).await?;
        debug!(%topic, "session expired");
        self.notify(SignEvent::SessionExpired {
            topic: topic.clone(),
        });
        Ok(())
    }

    async fn on_id_expired(&self, id: MessageId) -> crate::error::Result<()> {
        if let Ok(record) = self.sent_auth_requests.get(&id).await {
            self.forget_sent_auth(&record, true).await?;
            if self.proposals.contains(&record.fallback_proposal_id).await {
                self.delete_proposal(record.fallback_proposal_id).await?;
            }
            debug!(%id, "authentication request expired");
            self.flows
                .resolve(id, FlowEvent::Failed(SignError::AuthRequestExpired(id)));
            return Ok(());
        }

        if self.proposals.contains(&id).await {
            self.delete_proposal(id).await?;
            let fallback = !self
                .sent_auth_requests
                .get_all(move |record| record.fallback_proposal_id == id)
                .await
                .is_empty();
            // The authentication request reports its own expiry.
            if !fallback {
                debug!(%id, "proposal expired");
                self.flows
                    .resolve(id, FlowEvent::Failed(SignError::ProposalExpired(id)));
                self.notify(SignEvent::ProposalExpired { id });
            }
            return Ok(());
        }

        if self.pending_requests.contains(&id).await {
            self.delete_pending_request(id).await?;
            self.notify(SignEvent::SessionRequestExpired { id });
            return Ok(());
        }

        if self.auth_requests.contains(&id).await {
            self.delete_auth_request(id).await?;
            self.notify(SignEvent::AuthenticateExpired { id });
        }
        Ok(())
    }
}
