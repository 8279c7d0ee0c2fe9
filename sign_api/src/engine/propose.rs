use {
    super::{
        flow::{Approval, FlowEvent, FlowOutcome},
        Engine,
    },
    crate::{
        error::{Result, SignError},
        events::SignEvent,
        types::{ProposalPatch, ProposalStruct, SessionPatch, SessionStruct},
        validation::validate_approval,
    },
    core_api::time::{self, FIVE_MINUTES, SEVEN_DAYS},
    pairing_api::PairingUri,
    relay_client::{
        messaging::{InboundRequest, InboundResponse, ResponseWaiter},
        subscriber::SubscribeOptions,
    },
    relay_rpc::{
        domain::{MessageId, Topic},
        rpc::{
            params::{
                namespaces::{ProposeNamespaces, SettleNamespaces},
                session_propose::{SessionProposeRequest, SessionProposeResponse},
                session_settle::SessionSettleRequest,
                Participant,
                Relay,
                SdkErrorKind,
            },
            ErrorData,
        },
    },
    serde_json::Value,
    std::sync::{Arc, Weak},
    tracing::{debug, info, warn},
};

/// What a proposer asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub required_namespaces: ProposeNamespaces,
    pub optional_namespaces: Option<ProposeNamespaces>,
    pub session_properties: Option<Value>,
    /// Active pairing to propose on. A new pairing is created when `None` or
    /// when the pairing is not active yet.
    pub pairing_topic: Option<Topic>,
    /// The default relay when empty.
    pub relays: Vec<Relay>,
}

impl ConnectParams {
    pub fn new(required_namespaces: ProposeNamespaces) -> Self {
        Self {
            required_namespaces,
            ..Default::default()
        }
    }

    pub fn with_optional_namespaces(mut self, namespaces: ProposeNamespaces) -> Self {
        self.optional_namespaces = Some(namespaces);
        self
    }

    pub fn with_session_properties(mut self, properties: Value) -> Self {
        self.session_properties = Some(properties);
        self
    }

    pub fn with_pairing_topic(mut self, topic: Topic) -> Self {
        self.pairing_topic = Some(topic);
        self
    }
}

#[derive(Debug)]
pub struct ConnectData {
    /// URI to share with the peer when a new pairing was created.
    pub uri: Option<PairingUri>,
    pub pairing_topic: Topic,
    pub approval: Approval,
}

/// A responder's answer to a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApproveParams {
    pub id: MessageId,
    pub namespaces: SettleNamespaces,
    pub session_properties: Option<Value>,
}

impl ApproveParams {
    pub fn new(id: MessageId, namespaces: SettleNamespaces) -> Self {
        Self {
            id,
            namespaces,
            session_properties: None,
        }
    }

    pub fn with_session_properties(mut self, properties: Value) -> Self {
        self.session_properties = Some(properties);
        self
    }
}

/// A session settled by this client, not yet confirmed by the proposer.
#[derive(Debug)]
pub struct ApprovedData {
    pub topic: Topic,
    pub session: SessionStruct,
    waiter: ResponseWaiter<SessionSettleRequest>,
    engine: Weak<Engine>,
}

impl ApprovedData {
    /// Waits for the proposer to confirm the settlement and returns the
    /// acknowledged session.
    pub async fn acknowledged(self) -> Result<SessionStruct> {
        let Self {
            topic,
            waiter,
            engine,
            ..
        } = self;
        let acknowledged = waiter.wait().await?;
        let engine = engine.upgrade().ok_or(SignError::Cancelled)?;
        engine.on_settle_acknowledged(&topic, acknowledged).await
    }
}

impl Engine {
    /// Proposes a session, on a new pairing or the given active one.
    pub async fn connect(&self, params: ConnectParams) -> Result<ConnectData> {
        params.required_namespaces.validate()?;
        if let Some(optional) = &params.optional_namespaces {
            optional.validate()?;
        }

        let active = match &params.pairing_topic {
            Some(topic) => Some(self.pairing.is_valid_pairing_topic(topic).await?)
                .filter(|pairing| pairing.active)
                .map(|pairing| pairing.topic),
            None => None,
        };
        let (pairing_topic, uri) = match active {
            Some(topic) => (topic, None),
            None => {
                let (topic, uri) = self.pairing.create(None).await?;
                (topic, Some(uri))
            }
        };

        let public_key = self.handler.crypto().generate_key_pair().await?;
        let proposer = Participant {
            public_key,
            metadata: self.metadata.clone(),
        };
        let relays = if params.relays.is_empty() {
            vec![Relay::default()]
        } else {
            params.relays
        };
        let expiry = time::expiry_from_now(FIVE_MINUTES);
        let id = self.handler.next_id();

        self.proposals
            .set(ProposalStruct {
                id,
                expiry,
                relays: relays.clone(),
                proposer: proposer.clone(),
                required_namespaces: params.required_namespaces.clone(),
                optional_namespaces: params.optional_namespaces.clone(),
                pairing_topic: pairing_topic.clone(),
                session_topic: None,
                session_properties: params.session_properties.clone(),
            })
            .await?;
        self.expirer.set(id, expiry).await?;
        let approval = self.flows.start(id, &[]);

        let request = SessionProposeRequest {
            relays,
            proposer,
            required_namespaces: params.required_namespaces,
            optional_namespaces: params.optional_namespaces,
            session_properties: params.session_properties,
            expiry_timestamp: Some(expiry),
        };
        if let Err(err) = self
            .handler
            .send_request_with_id(&pairing_topic, id, request)
            .await
        {
            self.delete_proposal(id).await?;
            return Err(err.into());
        }

        info!(%id, %pairing_topic, "session proposed");
        Ok(ConnectData {
            uri,
            pairing_topic,
            approval,
        })
    }

    /// Settles a received proposal with `params.namespaces`. Nothing is sent
    /// unless the namespaces are well formed and satisfy the required ones.
    pub async fn approve(self: &Arc<Self>, params: ApproveParams) -> Result<ApprovedData> {
        let proposal = self.valid_proposal(params.id).await?;
        validate_approval(&params.namespaces, &proposal)?;

        let crypto = self.handler.crypto();
        let public_key = crypto.generate_key_pair().await?;
        let topic = crypto
            .generate_shared_key(&public_key, &proposal.proposer.public_key, None)
            .await?;
        let relay = proposal.relays.first().cloned().unwrap_or_default();
        self.handler
            .relayer()
            .subscribe(&topic, SubscribeOptions {
                relay: relay.clone(),
            })
            .await?;

        let expiry = time::expiry_from_now(SEVEN_DAYS);
        let self_ = Participant {
            public_key: public_key.clone(),
            metadata: self.metadata.clone(),
        };
        let waiter = self
            .handler
            .send_request_with_waiter(&topic, SessionSettleRequest {
                relay: relay.clone(),
                controller: self_.clone(),
                namespaces: params.namespaces.clone(),
                required_namespaces: Some(proposal.required_namespaces.clone()),
                session_properties: params.session_properties.clone(),
                expiry,
                pairing_topic: Some(proposal.pairing_topic.to_string()),
            })
            .await?;

        let session = SessionStruct {
            topic: topic.clone(),
            pairing_topic: proposal.pairing_topic.clone(),
            relay: relay.clone(),
            expiry,
            acknowledged: false,
            controller: public_key.clone(),
            namespaces: params.namespaces,
            required_namespaces: proposal.required_namespaces,
            optional_namespaces: proposal.optional_namespaces,
            self_,
            peer: proposal.proposer.clone(),
            session_properties: params.session_properties,
        };
        self.sessions.set(session.clone()).await?;
        self.expirer.set(topic.clone(), expiry).await?;

        self.handler
            .send_result::<SessionProposeRequest>(
                &proposal.pairing_topic,
                proposal.id,
                SessionProposeResponse {
                    relay,
                    responder_public_key: public_key,
                },
            )
            .await?;
        self.activate_pairing(&proposal.pairing_topic, proposal.proposer.metadata)
            .await?;
        self.delete_proposal(proposal.id).await?;

        info!(id = %proposal.id, %topic, "proposal approved");
        Ok(ApprovedData {
            topic,
            session,
            waiter,
            engine: Arc::downgrade(self),
        })
    }

    /// Declines a received proposal.
    pub async fn reject(&self, id: MessageId, reason: ErrorData) -> Result<()> {
        let proposal = self.valid_proposal(id).await?;
        self.handler
            .send_error::<SessionProposeRequest>(&proposal.pairing_topic, id, reason)
            .await?;
        self.delete_proposal(id).await?;
        info!(%id, "proposal rejected");
        Ok(())
    }

    pub(super) async fn on_session_propose(&self, request: InboundRequest<SessionProposeRequest>) {
        let InboundRequest { topic, id, params } = request;
        let stored = async {
            params.required_namespaces.validate()?;
            if let Some(optional) = &params.optional_namespaces {
                optional.validate()?;
            }

            let expiry = params
                .expiry_timestamp
                .unwrap_or_else(|| time::expiry_from_now(FIVE_MINUTES));
            let proposal = self
                .proposals
                .set(ProposalStruct {
                    id,
                    expiry,
                    relays: params.relays,
                    proposer: params.proposer,
                    required_namespaces: params.required_namespaces,
                    optional_namespaces: params.optional_namespaces,
                    pairing_topic: topic.clone(),
                    session_topic: None,
                    session_properties: params.session_properties,
                })
                .await?;
            self.expirer.set(id, expiry).await?;
            Result::Ok(proposal)
        }
        .await;

        match stored {
            Ok(proposal) => self.notify(SignEvent::SessionProposal { id, proposal }),
            Err(err) => {
                self.reject_request::<SessionProposeRequest>(&topic, id, &err)
                    .await
            }
        }
    }

    pub(super) async fn on_propose_response(&self, response: InboundResponse<SessionProposeRequest>) {
        let InboundResponse { id, result, .. } = response;
        let Ok(proposal) = self.proposals.get(&id).await else {
            debug!(%id, "response to an unknown proposal");
            return;
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                self.on_proposal_rejected(&proposal, error).await;
                return;
            }
        };

        let subscribed = async {
            let topic = self
                .handler
                .crypto()
                .generate_shared_key(&proposal.proposer.public_key, &response.responder_public_key, None)
                .await?;
            self.proposals
                .update(&id, ProposalPatch {
                    session_topic: Some(topic.clone()),
                    ..Default::default()
                })
                .await?;
            self.handler
                .relayer()
                .subscribe(&topic, SubscribeOptions {
                    relay: response.relay,
                })
                .await?;
            Result::Ok(topic)
        }
        .await;

        match subscribed {
            Ok(topic) => debug!(%id, %topic, "proposal answered, awaiting settlement"),
            Err(err) => {
                warn!(?err, %id, "failed to follow the session topic");
                self.flows.resolve(id, FlowEvent::Failed(err));
            }
        }
    }

    async fn on_proposal_rejected(&self, proposal: &ProposalStruct, error: ErrorData) {
        let id = proposal.id;
        debug!(%id, %error, "proposal rejected by peer");
        if let Err(err) = self.delete_proposal(id).await {
            warn!(?err, %id, "failed to delete rejected proposal");
        }

        // A rejected authentication fallback leaves the authenticate request
        // in charge of the outcome.
        let authenticating = !self
            .sent_auth_requests
            .get_all(|record| record.fallback_proposal_id == id)
            .await
            .is_empty();
        if !authenticating {
            self.flows
                .resolve(id, FlowEvent::Failed(SignError::Rejected(error)));
        }
    }

    pub(super) async fn on_session_settle(&self, request: InboundRequest<SessionSettleRequest>) {
        let InboundRequest { topic, id, params } = request;
        let proposal = self
            .proposals
            .get_all(|proposal| proposal.session_topic.as_ref() == Some(&topic))
            .await
            .into_iter()
            .next();
        let Some(proposal) = proposal else {
            let err = SignError::SessionNotFound(topic.clone());
            self.reject_request::<SessionSettleRequest>(&topic, id, &err)
                .await;
            return;
        };

        let settled = async {
            params.namespaces.validate()?;
            params.namespaces.conforms_to(&proposal.required_namespaces)?;
            if time::is_expired(params.expiry) {
                return Err(SignError::SessionExpired(topic.clone()));
            }

            let session = SessionStruct {
                topic: topic.clone(),
                pairing_topic: proposal.pairing_topic.clone(),
                relay: params.relay,
                expiry: params.expiry,
                acknowledged: true,
                controller: params.controller.public_key.clone(),
                namespaces: params.namespaces,
                required_namespaces: proposal.required_namespaces.clone(),
                optional_namespaces: proposal.optional_namespaces.clone(),
                self_: proposal.proposer.clone(),
                peer: params.controller,
                session_properties: params.session_properties,
            };
            self.sessions.set(session.clone()).await?;
            self.expirer.set(topic.clone(), session.expiry).await?;
            Result::Ok(session)
        }
        .await;

        let session = match settled {
            Ok(session) => session,
            Err(err) => {
                self.reject_request::<SessionSettleRequest>(&topic, id, &err)
                    .await;
                if let Err(err) = self.delete_proposal(proposal.id).await {
                    warn!(?err, id = %proposal.id, "failed to delete proposal");
                }
                self.flows.resolve(proposal.id, FlowEvent::Failed(err));
                return;
            }
        };

        if let Err(err) = self
            .handler
            .send_result::<SessionSettleRequest>(&topic, id, true)
            .await
        {
            warn!(?err, %topic, "failed to acknowledge settlement");
        }
        if let Err(err) = self
            .activate_pairing(&session.pairing_topic, session.peer.metadata.clone())
            .await
        {
            warn!(?err, pairing_topic = %session.pairing_topic, "failed to activate pairing");
        }
        if let Err(err) = self.finish_authentication(proposal.id).await {
            warn!(?err, id = %proposal.id, "failed to drop the authenticate request");
        }
        if let Err(err) = self.delete_proposal(proposal.id).await {
            warn!(?err, id = %proposal.id, "failed to delete settled proposal");
        }

        info!(%topic, "session settled");
        self.flows.resolve(
            proposal.id,
            FlowEvent::Settled(FlowOutcome {
                session: Some(session.clone()),
                auths: None,
            }),
        );
        self.notify(SignEvent::SessionConnect { session });
    }

    pub(super) async fn on_settle_response(&self, response: InboundResponse<SessionSettleRequest>) {
        let acknowledged = response.result.unwrap_or_else(|error| {
            debug!(%error, topic = %response.topic, "settlement rejected by peer");
            false
        });
        if let Err(err) = self
            .on_settle_acknowledged(&response.topic, acknowledged)
            .await
        {
            debug!(?err, topic = %response.topic, "settlement not acknowledged");
        }
    }

    /// Records the proposer's answer to our settlement. A refused settlement
    /// tears the session down. Safe to run more than once.
    pub(super) async fn on_settle_acknowledged(
        &self,
        topic: &Topic,
        acknowledged: bool,
    ) -> Result<SessionStruct> {
        if !acknowledged {
            self.delete_session(topic).await?;
            return Err(SignError::Rejected(
                SdkErrorKind::SessionSettlementFailed.with_context(format!("session topic: {topic}")),
            ));
        }

        self.sessions
            .update(topic, SessionPatch {
                acknowledged: Some(true),
                ..Default::default()
            })
            .await
            .map_err(|_| SignError::SessionNotFound(topic.clone()))
    }
}
