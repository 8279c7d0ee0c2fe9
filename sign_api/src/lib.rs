//! Sign API: session proposal and settlement, session maintenance, typed
//! session requests and one-click authentication over a pairing.
//!
//! https://specs.walletconnect.com/2.0/specs/clients/sign

pub mod auth;
pub mod client;
pub mod engine;
pub mod error;
pub mod events;
pub mod types;
pub mod validation;

pub use {
    auth::AuthenticateParams,
    client::{SignClient, SignClientOptions},
    engine::{
        Acknowledgement,
        Approval,
        ApproveParams,
        ApprovedData,
        AuthenticateData,
        ConnectData,
        ConnectParams,
        FlowOutcome,
        SessionRequestEvent,
    },
    error::{Result, SignError},
    events::SignEvent,
    types::{
        AuthPendingRequest,
        AuthRequestRecord,
        PendingRequestStruct,
        ProposalStruct,
        SessionMethod,
        SessionStruct,
    },
};
