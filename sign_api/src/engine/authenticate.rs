//! `wc_sessionAuthenticate`. The requester sends it together with a fallback
//! `wc_sessionPropose` on the same pairing and takes whichever the wallet
//! answers. The wallet answers on the requester's response topic with a
//! type 1 envelope.

use {
    super::{
        flow::{Approval, FlowEvent, FlowOutcome},
        Engine,
    },
    crate::{
        auth::{
            grants_methods,
            namespaces_from_cacaos,
            response_topic,
            verify_cacaos,
            AuthenticateParams,
            DEFAULT_EVENTS,
        },
        error::{Result, SignError},
        events::SignEvent,
        types::{AuthPendingRequest, AuthRequestRecord, ProposalStruct, SessionStruct},
    },
    core_api::{
        crypto::{DecodeOptions, EncodeOptions},
        time::{self, FIVE_MINUTES, ONE_HOUR, SEVEN_DAYS},
    },
    pairing_api::{Methods, PairingUri},
    relay_client::{
        messaging::{InboundRequest, InboundResponse},
        subscriber::{SubscribeOptions, UnsubscribeOptions},
    },
    relay_rpc::{
        auth::cacao::Cacao,
        domain::{MessageId, Topic},
        rpc::{
            params::{
                namespaces::{ProposeNamespace, ProposeNamespaces, SettleNamespaces},
                session_authenticate::{SessionAuthenticateRequest, SessionAuthenticateResponse},
                session_propose::SessionProposeRequest,
                Participant,
                Relay,
                RpcMethod,
            },
            ErrorData,
        },
    },
    tracing::{debug, info, warn},
};

#[derive(Debug)]
pub struct AuthenticateData {
    /// URI to share with the wallet when a new pairing was created.
    pub uri: Option<PairingUri>,
    pub pairing_topic: Topic,
    /// Settles with the signed CACAOs, and the session when the wallet
    /// granted methods.
    pub approval: Approval,
}

impl Engine {
    /// Asks a wallet to sign in and open a session in one step.
    pub async fn authenticate(&self, params: AuthenticateParams) -> Result<AuthenticateData> {
        params.validate()?;
        let ttl = params.expiry.unwrap_or(ONE_HOUR).clamp(FIVE_MINUTES, SEVEN_DAYS);

        let (pairing_topic, uri) = match &params.pairing_topic {
            Some(topic) => {
                self.pairing.is_valid_pairing_topic(topic).await?;
                (topic.clone(), None)
            }
            None => {
                let methods = Methods(vec![
                    vec![SessionAuthenticateRequest::METHOD.to_owned()],
                    vec![SessionProposeRequest::METHOD.to_owned()],
                ]);
                let (topic, uri) = self.pairing.create(Some(methods)).await?;
                (topic, Some(uri))
            }
        };

        let public_key = self.handler.crypto().generate_key_pair().await?;
        let response_topic = response_topic(&public_key)?;
        self.handler.set_decode_options(response_topic.clone(), DecodeOptions {
            receiver_public_key: Some(public_key.clone()),
        });
        self.handler
            .route_responses(response_topic.clone(), pairing_topic.clone());
        self.handler
            .relayer()
            .subscribe(&response_topic, SubscribeOptions::default())
            .await?;

        let requester = Participant {
            public_key: public_key.clone(),
            metadata: self.metadata.clone(),
        };
        let auth_payload = params.to_payload()?;
        let expiry = time::expiry_from_now(ttl);
        let id = self.handler.next_id();
        let fallback_id = self.handler.next_id();

        let optional_namespaces: ProposeNamespaces = [(params.namespace()?, ProposeNamespace {
            chains: params.chains.iter().cloned().collect(),
            methods: params.methods.iter().cloned().collect(),
            events: DEFAULT_EVENTS.iter().map(|e| (*e).to_owned()).collect(),
        })]
        .into_iter()
        .collect();
        let fallback = ProposalStruct {
            id: fallback_id,
            expiry,
            relays: vec![Relay::default()],
            proposer: requester.clone(),
            required_namespaces: ProposeNamespaces::default(),
            optional_namespaces: Some(optional_namespaces),
            pairing_topic: pairing_topic.clone(),
            session_topic: None,
            session_properties: None,
        };
        let record = AuthRequestRecord {
            id,
            pairing_topic: pairing_topic.clone(),
            response_topic,
            public_key,
            fallback_proposal_id: fallback_id,
            auth_payload: auth_payload.clone(),
            expiry_timestamp: expiry,
        };

        self.proposals.set(fallback.clone()).await?;
        self.expirer.set(fallback_id, expiry).await?;
        self.sent_auth_requests.set(record.clone()).await?;
        self.expirer.set(id, expiry).await?;
        let approval = self.flows.start(id, &[fallback_id]);

        let sent = async {
            self.handler
                .send_request_with_id(&pairing_topic, id, SessionAuthenticateRequest {
                    requester,
                    auth_payload,
                    expiry_timestamp: expiry,
                })
                .await?;
            self.handler
                .send_request_with_id(&pairing_topic, fallback_id, SessionProposeRequest {
                    relays: fallback.relays,
                    proposer: fallback.proposer,
                    required_namespaces: fallback.required_namespaces,
                    optional_namespaces: fallback.optional_namespaces,
                    session_properties: None,
                    expiry_timestamp: Some(expiry),
                })
                .await?;
            Result::Ok(())
        }
        .await;
        if let Err(err) = sent {
            self.forget_sent_auth(&record, true).await?;
            self.delete_proposal(fallback_id).await?;
            return Err(err);
        }

        info!(%id, %pairing_topic, "authentication requested");
        Ok(AuthenticateData {
            uri,
            pairing_topic,
            approval,
        })
    }

    /// Signs in with `cacaos` answering the pending request `id`. Returns the
    /// session when the CACAOs grant methods.
    pub async fn approve_session_authenticate(
        &self,
        id: MessageId,
        cacaos: Vec<Cacao>,
    ) -> Result<Option<SessionStruct>> {
        let request = self.valid_auth_request(id).await?;
        verify_cacaos(&cacaos, &request.auth_payload)?;
        let namespaces = namespaces_from_cacaos(&cacaos)?;

        let crypto = self.handler.crypto();
        let public_key = crypto.generate_key_pair().await?;
        let topic = crypto
            .generate_shared_key(&public_key, &request.requester.public_key, None)
            .await?;
        let responder = Participant {
            public_key: public_key.clone(),
            metadata: self.metadata.clone(),
        };

        let session = if grants_methods(&namespaces) {
            Some(
                self.store_authenticated_session(
                    topic.clone(),
                    &request.pairing_topic,
                    namespaces,
                    responder.clone(),
                    request.requester.clone(),
                    public_key.clone(),
                )
                .await?,
            )
        } else {
            None
        };

        let sent = self
            .send_auth_response(
                &request,
                &public_key,
                Ok(SessionAuthenticateResponse { cacaos, responder }),
            )
            .await;
        if let Err(err) = sent {
            if session.is_some() {
                self.delete_session(&topic).await?;
            }
            return Err(err);
        }
        if session.is_none() {
            crypto.delete_sym_key(&topic).await?;
            crypto.delete_key_pair(&public_key).await?;
        }

        self.delete_auth_request(id).await?;
        for proposal in self
            .proposals
            .get_all(|proposal| proposal.proposer.public_key == request.requester.public_key)
            .await
        {
            self.delete_proposal(proposal.id).await?;
        }
        self.activate_pairing(&request.pairing_topic, request.requester.metadata.clone())
            .await?;

        info!(%id, session = session.is_some(), "authentication approved");
        Ok(session)
    }

    /// Declines the pending authentication request `id`.
    pub async fn reject_session_authenticate(&self, id: MessageId, reason: ErrorData) -> Result<()> {
        let request = self.valid_auth_request(id).await?;
        let public_key = self.handler.crypto().generate_key_pair().await?;

        self.send_auth_response(&request, &public_key, Err(reason))
            .await?;
        self.drop_shared_keys(&public_key, &request.requester.public_key)
            .await?;
        self.delete_auth_request(id).await?;
        info!(%id, "authentication rejected");
        Ok(())
    }

    async fn valid_auth_request(&self, id: MessageId) -> Result<AuthPendingRequest> {
        let request = self
            .auth_requests
            .get(&id)
            .await
            .map_err(|_| SignError::AuthRequestNotFound(id))?;
        if time::is_expired(request.expiry_timestamp) {
            self.delete_auth_request(id).await?;
            return Err(SignError::AuthRequestExpired(id));
        }
        Ok(request)
    }

    async fn send_auth_response(
        &self,
        request: &AuthPendingRequest,
        public_key: &str,
        response: std::result::Result<SessionAuthenticateResponse, ErrorData>,
    ) -> Result<()> {
        let topic = response_topic(&request.requester.public_key)?;
        let options = EncodeOptions::type1(public_key, request.requester.public_key.as_str());
        self.handler
            .send_response::<SessionAuthenticateRequest>(&topic, request.id, response, &options)
            .await?;
        Ok(())
    }

    async fn drop_shared_keys(&self, public_key: &str, peer_public_key: &str) -> Result<()> {
        let crypto = self.handler.crypto();
        let topic = crypto
            .generate_shared_key(public_key, peer_public_key, None)
            .await?;
        crypto.delete_sym_key(&topic).await?;
        crypto.delete_key_pair(public_key).await?;
        Ok(())
    }

    async fn store_authenticated_session(
        &self,
        topic: Topic,
        pairing_topic: &Topic,
        namespaces: SettleNamespaces,
        own: Participant,
        peer: Participant,
        controller: String,
    ) -> Result<SessionStruct> {
        self.handler
            .relayer()
            .subscribe(&topic, SubscribeOptions::default())
            .await?;

        let session = self
            .sessions
            .set(SessionStruct {
                topic,
                pairing_topic: pairing_topic.clone(),
                relay: Relay::default(),
                expiry: time::expiry_from_now(SEVEN_DAYS),
                acknowledged: true,
                controller,
                namespaces,
                required_namespaces: ProposeNamespaces::default(),
                optional_namespaces: None,
                self_: own,
                peer,
                session_properties: None,
            })
            .await?;
        self.expirer
            .set(session.topic.clone(), session.expiry)
            .await?;
        Ok(session)
    }

    /// Forgets a sent authentication request and stops listening on its
    /// response topic. The key pair is kept when a session still uses it.
    pub(super) async fn forget_sent_auth(&self, record: &AuthRequestRecord, delete_keys: bool) -> Result<()> {
        self.handler.remove_decode_options(&record.response_topic);
        self.handler.remove_response_route(&record.response_topic);

        let relayer = self.handler.relayer();
        if relayer
            .subscriber()
            .topics()
            .await
            .contains(&record.response_topic)
        {
            if let Err(err) = relayer
                .unsubscribe(&record.response_topic, UnsubscribeOptions::default())
                .await
            {
                warn!(?err, topic = %record.response_topic, "failed to unsubscribe from response topic");
            }
        }
        relayer.message_tracker().delete(&record.response_topic).await?;

        let crypto = self.handler.crypto();
        if delete_keys && crypto.has_keys(&record.public_key).await {
            crypto.delete_key_pair(&record.public_key).await?;
        }

        self.sent_auth_requests
            .delete(&record.id, "authentication finished")
            .await?;
        self.delete_expiry(record.id).await
    }

    /// Drops the authentication request whose fallback proposal `proposal_id`
    /// settled.
    pub(super) async fn finish_authentication(&self, proposal_id: MessageId) -> Result<()> {
        for record in self
            .sent_auth_requests
            .get_all(|record| record.fallback_proposal_id == proposal_id)
            .await
        {
            self.forget_sent_auth(&record, false).await?;
        }
        Ok(())
    }

    pub(super) async fn on_authenticate_response(
        &self,
        response: InboundResponse<SessionAuthenticateRequest>,
    ) {
        let InboundResponse { id, result, .. } = response;
        let Ok(record) = self.sent_auth_requests.get(&id).await else {
            debug!(%id, "response to an unknown authentication request");
            return;
        };

        let response = match result {
            Ok(response) => response,
            Err(error) => {
                debug!(%id, %error, "authentication rejected by wallet");
                if let Err(err) = self.forget_sent_auth(&record, false).await {
                    warn!(?err, %id, "failed to forget authentication request");
                }
                // The wallet may still settle the fallback proposal.
                if !self.proposals.contains(&record.fallback_proposal_id).await {
                    self.flows
                        .resolve(id, FlowEvent::Failed(SignError::Rejected(error)));
                }
                return;
            }
        };

        match self.settle_authentication(&record, response).await {
            Ok(outcome) => {
                info!(%id, session = outcome.session.is_some(), "authenticated");
                let session = outcome.session.clone();
                self.flows.resolve(id, FlowEvent::Settled(outcome));
                if let Some(session) = session {
                    self.notify(SignEvent::SessionConnect { session });
                }
            }
            Err(err) => {
                warn!(?err, %id, "invalid authentication response");
                self.flows.resolve(id, FlowEvent::Failed(err));
            }
        }
    }

    async fn settle_authentication(
        &self,
        record: &AuthRequestRecord,
        response: SessionAuthenticateResponse,
    ) -> Result<FlowOutcome> {
        verify_cacaos(&response.cacaos, &record.auth_payload)?;
        let namespaces = namespaces_from_cacaos(&response.cacaos)?;

        let crypto = self.handler.crypto();
        let topic = crypto
            .generate_shared_key(&record.public_key, &response.responder.public_key, None)
            .await?;

        let session = if grants_methods(&namespaces) {
            let own = Participant {
                public_key: record.public_key.clone(),
                metadata: self.metadata.clone(),
            };
            Some(
                self.store_authenticated_session(
                    topic,
                    &record.pairing_topic,
                    namespaces,
                    own,
                    response.responder.clone(),
                    response.responder.public_key.clone(),
                )
                .await?,
            )
        } else {
            crypto.delete_sym_key(&topic).await?;
            None
        };

        self.activate_pairing(&record.pairing_topic, response.responder.metadata.clone())
            .await?;
        self.forget_sent_auth(record, session.is_none()).await?;
        self.delete_proposal(record.fallback_proposal_id).await?;

        Ok(FlowOutcome {
            session,
            auths: Some(response.cacaos),
        })
    }

    pub(super) async fn on_session_authenticate(
        &self,
        request: InboundRequest<SessionAuthenticateRequest>,
    ) {
        let InboundRequest { topic, id, params } = request;
        if time::is_expired(params.expiry_timestamp) {
            debug!(%id, "ignoring expired authentication request");
            return;
        }

        let request = AuthPendingRequest {
            id,
            pairing_topic: topic,
            requester: params.requester,
            auth_payload: params.auth_payload,
            expiry_timestamp: params.expiry_timestamp,
        };
        let stored = async {
            self.auth_requests.set(request.clone()).await?;
            self.expirer.set(id, request.expiry_timestamp).await?;
            Result::Ok(())
        }
        .await;

        match stored {
            Ok(()) => self.notify(SignEvent::SessionAuthenticate { id, request }),
            Err(err) => warn!(?err, %id, "failed to store authentication request"),
        }
    }
}
