use {
    crate::types::{AuthPendingRequest, ProposalStruct, SessionStruct},
    relay_rpc::{
        domain::{MessageId, Topic},
        rpc::params::{namespaces::SettleNamespaces, session_event::Event, session_request::Request},
    },
};

/// Something the peer did, or something that expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignEvent {
    /// A peer proposed a session. Answer with `approve` or `reject`.
    SessionProposal { id: MessageId, proposal: ProposalStruct },
    /// A session was settled with this client as proposer.
    SessionConnect { session: SessionStruct },
    SessionUpdate {
        id: MessageId,
        topic: Topic,
        namespaces: SettleNamespaces,
    },
    SessionExtend {
        id: MessageId,
        topic: Topic,
        expiry: u64,
    },
    SessionPing { id: MessageId, topic: Topic },
    SessionDelete { id: MessageId, topic: Topic },
    SessionEvent {
        id: MessageId,
        topic: Topic,
        chain_id: String,
        event: Event,
    },
    /// A request no typed handler answered. Answer with `respond`.
    SessionRequest {
        id: MessageId,
        topic: Topic,
        chain_id: String,
        request: Request,
    },
    SessionExpired { topic: Topic },
    SessionRequestExpired { id: MessageId },
    ProposalExpired { id: MessageId },
    /// A peer asked for a one-click sign in. Answer with
    /// `approve_session_authenticate` or `reject_session_authenticate`.
    SessionAuthenticate { id: MessageId, request: AuthPendingRequest },
    AuthenticateExpired { id: MessageId },
    PairingPing { id: MessageId, topic: Topic },
    PairingDelete { id: MessageId, topic: Topic },
    PairingExpired { topic: Topic },
}
