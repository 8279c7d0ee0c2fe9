//! In-flight connect and authenticate operations.
//!
//! Each operation is a task fed by an mpsc channel and registered under the
//! ids of the requests it waits on. The first event settles it and
//! deregisters every id. Dropping the [`Approval`] is itself an event.

use {
    crate::{
        error::{Result, SignError},
        types::SessionStruct,
    },
    relay_rpc::{auth::cacao::Cacao, domain::MessageId},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex as StdMutex, PoisonError, Weak},
    },
    tokio::sync::{mpsc, oneshot},
    tracing::debug,
};

/// What a settled operation produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowOutcome {
    /// The session, absent when an authentication granted no methods.
    pub session: Option<SessionStruct>,
    /// Signed CACAOs of a one-click authentication.
    pub auths: Option<Vec<Cacao>>,
}

#[derive(Debug)]
pub(crate) enum FlowEvent {
    Settled(FlowOutcome),
    Failed(SignError),
    Cancelled,
}

type Senders = HashMap<MessageId, mpsc::UnboundedSender<FlowEvent>>;

#[derive(Debug, Default)]
pub(crate) struct Flows {
    senders: StdMutex<Senders>,
}

impl Flows {
    /// Registers an operation waiting on `id` and any `extra` request ids.
    pub(crate) fn start(self: &Arc<Self>, id: MessageId, extra: &[MessageId]) -> Approval {
        let (events, receiver) = mpsc::unbounded_channel();
        let (result, outcome) = oneshot::channel();

        let ids = std::iter::once(id)
            .chain(extra.iter().copied())
            .collect::<Vec<_>>();
        {
            let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
            for id in &ids {
                senders.insert(*id, events.clone());
            }
        }
        tokio::spawn(drive(Arc::downgrade(self), ids, receiver, result));

        Approval {
            id,
            events,
            outcome,
        }
    }

    /// Feeds `event` to the operation waiting on `id`. Returns whether one
    /// was.
    pub(crate) fn resolve(&self, id: MessageId, event: FlowEvent) -> bool {
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned();
        match sender {
            Some(sender) => sender.send(event).is_ok(),
            None => {
                debug!(%id, "no operation waiting");
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_waiting(&self, id: MessageId) -> bool {
        self.senders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn remove(&self, ids: &[MessageId]) {
        let mut senders = self.senders.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            senders.remove(id);
        }
    }
}

async fn drive(
    flows: Weak<Flows>,
    ids: Vec<MessageId>,
    mut events: mpsc::UnboundedReceiver<FlowEvent>,
    result: oneshot::Sender<Result<FlowOutcome>>,
) {
    let outcome = match events.recv().await {
        Some(FlowEvent::Settled(outcome)) => Ok(outcome),
        Some(FlowEvent::Failed(err)) => Err(err),
        Some(FlowEvent::Cancelled) | None => Err(SignError::Cancelled),
    };

    if let Some(flows) = flows.upgrade() {
        flows.remove(&ids);
    }
    debug!(?ids, settled = outcome.is_ok(), "operation finished");
    let _ = result.send(outcome);
}

/// Pending result of [`connect`](crate::SignClient::connect) or
/// [`authenticate`](crate::SignClient::authenticate).
#[derive(Debug)]
pub struct Approval {
    id: MessageId,
    events: mpsc::UnboundedSender<FlowEvent>,
    outcome: oneshot::Receiver<Result<FlowOutcome>>,
}

impl Approval {
    /// Id of the request the operation was started with.
    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Waits until the operation settles or fails.
    pub async fn outcome(mut self) -> Result<FlowOutcome> {
        (&mut self.outcome)
            .await
            .map_err(|_| SignError::Cancelled)?
    }

    /// Waits for the settled session.
    pub async fn wait(self) -> Result<SessionStruct> {
        let id = self.id;
        self.outcome().await?.session.ok_or_else(|| {
            SignError::InvalidParams(format!("request {id} settled without a session"))
        })
    }
}

impl Drop for Approval {
    fn drop(&mut self) {
        let _ = self.events.send(FlowEvent::Cancelled);
    }
}

#[cfg(test)]
mod tests {
    use {super::*, anyhow::Result, std::time::Duration};

    #[tokio::test]
    async fn first_event_settles_every_id() -> Result<()> {
        let flows = Arc::new(Flows::default());
        let approval = flows.start(MessageId::new(1), &[MessageId::new(2)]);
        assert!(flows.is_waiting(MessageId::new(2)));

        assert!(flows.resolve(MessageId::new(2), FlowEvent::Settled(FlowOutcome::default())));
        let outcome = tokio::time::timeout(Duration::from_secs(1), approval.outcome()).await??;
        assert_eq!(outcome, FlowOutcome::default());

        assert!(!flows.is_waiting(MessageId::new(1)));
        assert!(!flows.resolve(MessageId::new(1), FlowEvent::Cancelled));
        Ok(())
    }

    #[tokio::test]
    async fn failure_reaches_the_caller() -> Result<()> {
        let flows = Arc::new(Flows::default());
        let approval = flows.start(MessageId::new(3), &[]);
        flows.resolve(
            MessageId::new(3),
            FlowEvent::Failed(SignError::ProposalExpired(MessageId::new(3))),
        );

        let result = tokio::time::timeout(Duration::from_secs(1), approval.wait()).await?;
        assert!(matches!(result, Err(SignError::ProposalExpired(_))));
        Ok(())
    }

    #[tokio::test]
    async fn dropping_the_approval_deregisters() -> Result<()> {
        let flows = Arc::new(Flows::default());
        drop(flows.start(MessageId::new(4), &[]));

        tokio::time::timeout(Duration::from_secs(1), async {
            while flows.is_waiting(MessageId::new(4)) {
                tokio::task::yield_now().await;
            }
        })
        .await?;
        Ok(())
    }
}
