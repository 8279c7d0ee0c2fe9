//! Checks run before a session operation touches the network.

use {
    crate::{
        error::{Result, SignError},
        types::{ProposalStruct, SessionStruct},
    },
    core_api::time::{self, SEVEN_DAYS},
    relay_rpc::rpc::params::namespaces::{is_valid_chain_id, SettleNamespaces},
};

/// `chain_id` is a CAIP-2 chain the session holds accounts or chains on.
pub fn validate_chain(session: &SessionStruct, chain_id: &str) -> Result<()> {
    if !is_valid_chain_id(chain_id) || !session.namespaces.supports_chain(chain_id) {
        return Err(SignError::UnsupportedChain {
            topic: session.topic.clone(),
            chain_id: chain_id.to_owned(),
        });
    }
    Ok(())
}

pub fn validate_method(session: &SessionStruct, chain_id: &str, method: &str) -> Result<()> {
    validate_chain(session, chain_id)?;
    if !session.namespaces.supports_method(chain_id, method) {
        return Err(SignError::UnsupportedMethod {
            chain_id: chain_id.to_owned(),
            method: method.to_owned(),
        });
    }
    Ok(())
}

pub fn validate_event(session: &SessionStruct, chain_id: &str, event: &str) -> Result<()> {
    validate_chain(session, chain_id)?;
    if !session.namespaces.supports_event(chain_id, event) {
        return Err(SignError::UnsupportedEvent {
            chain_id: chain_id.to_owned(),
            event: event.to_owned(),
        });
    }
    Ok(())
}

/// Namespaces approved for `proposal`: well formed and covering every
/// required namespace.
pub fn validate_approval(namespaces: &SettleNamespaces, proposal: &ProposalStruct) -> Result<()> {
    namespaces.validate()?;
    namespaces.conforms_to(&proposal.required_namespaces)?;
    Ok(())
}

/// Namespaces of a session update. They must still satisfy what the session
/// was created for.
pub fn validate_update(session: &SessionStruct, namespaces: &SettleNamespaces) -> Result<()> {
    namespaces.validate()?;
    namespaces.conforms_to(&session.required_namespaces)?;
    Ok(())
}

/// A session expiry may only move forward and at most seven days from now.
pub fn validate_extend_expiry(current: u64, expiry: u64) -> Result<()> {
    if expiry < current || expiry > time::expiry_from_now(SEVEN_DAYS) {
        return Err(SignError::InvalidExpiry(expiry));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        relay_rpc::{
            domain::{MessageId, Topic},
            rpc::params::{
                namespaces::{ProposeNamespace, ProposeNamespaces, SettleNamespace},
                Participant,
                Relay,
            },
        },
        std::collections::BTreeSet,
    };

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| (*v).to_owned()).collect()
    }

    fn required() -> ProposeNamespaces {
        [("eip155", ProposeNamespace {
            chains: set(&["eip155:1"]),
            methods: set(&["personal_sign"]),
            events: set(&["accountsChanged"]),
        })]
        .into_iter()
        .collect()
    }

    fn approved(account: &str) -> SettleNamespaces {
        [("eip155", SettleNamespace {
            accounts: set(&[account]),
            methods: set(&["personal_sign"]),
            events: set(&["accountsChanged"]),
            ..Default::default()
        })]
        .into_iter()
        .collect()
    }

    fn session() -> SessionStruct {
        SessionStruct {
            topic: Topic::from("session"),
            pairing_topic: Topic::from("pairing"),
            relay: Relay::default(),
            expiry: time::expiry_from_now(SEVEN_DAYS),
            acknowledged: true,
            controller: "wallet".to_owned(),
            namespaces: approved("eip155:1:0xabc"),
            required_namespaces: required(),
            optional_namespaces: None,
            self_: Participant::default(),
            peer: Participant::default(),
            session_properties: None,
        }
    }

    #[test]
    fn request_targets_are_checked() {
        let session = session();
        assert!(validate_method(&session, "eip155:1", "personal_sign").is_ok());
        assert!(matches!(
            validate_method(&session, "eip155:5", "personal_sign"),
            Err(SignError::UnsupportedChain { .. })
        ));
        assert!(matches!(
            validate_method(&session, "eip155:1", "eth_sign"),
            Err(SignError::UnsupportedMethod { .. })
        ));
        assert!(matches!(
            validate_event(&session, "eip155:1", "chainChanged"),
            Err(SignError::UnsupportedEvent { .. })
        ));
        assert!(validate_chain(&session, "not a chain").is_err());
    }

    #[test]
    fn approval_must_conform() {
        let proposal = ProposalStruct {
            id: MessageId::new(1),
            expiry: time::expiry_from_now(300),
            relays: vec![Relay::default()],
            proposer: Participant::default(),
            required_namespaces: required(),
            optional_namespaces: None,
            pairing_topic: Topic::from("pairing"),
            session_topic: None,
            session_properties: None,
        };

        assert!(validate_approval(&approved("eip155:1:0xabc"), &proposal).is_ok());
        assert!(matches!(
            validate_approval(&approved("eip155:5:0xabc"), &proposal),
            Err(SignError::Namespaces(_))
        ));
        assert!(validate_approval(&approved("0xabc"), &proposal).is_err());
    }

    #[test]
    fn extend_only_moves_forward() {
        let current = time::expiry_from_now(60);
        assert!(validate_extend_expiry(current, time::expiry_from_now(SEVEN_DAYS)).is_ok());
        assert!(validate_extend_expiry(current, current - 1).is_err());
        assert!(validate_extend_expiry(current, time::expiry_from_now(SEVEN_DAYS + 60)).is_err());
    }
}
