use {
    crate::uri::Methods,
    core_api::store::StoreValue,
    relay_rpc::{
        domain::Topic,
        rpc::params::{Metadata, Relay},
    },
    serde::{Deserialize, Serialize},
};

/// A pairing with a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStruct {
    pub topic: Topic,
    pub relay: Relay,
    /// Unix time in seconds.
    pub expiry: u64,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub methods: Option<Methods>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingPatch {
    pub expiry: Option<u64>,
    pub active: Option<bool>,
    pub methods: Option<Methods>,
    pub peer_metadata: Option<Metadata>,
}

impl StoreValue for PairingStruct {
    type Key = Topic;
    type Patch = PairingPatch;

    fn key(&self) -> Topic {
        self.topic.clone()
    }

    fn to_patch(&self) -> PairingPatch {
        PairingPatch {
            expiry: (self.expiry != 0).then_some(self.expiry),
            active: self.active.then_some(true),
            methods: self.methods.clone(),
            peer_metadata: self.peer_metadata.clone(),
        }
    }

    fn apply_patch(&mut self, patch: PairingPatch) {
        if let Some(expiry) = patch.expiry {
            self.expiry = expiry;
        }
        if let Some(active) = patch.active {
            self.active = active;
        }
        if let Some(methods) = patch.methods {
            self.methods = Some(methods);
        }
        if let Some(metadata) = patch.peer_metadata {
            self.peer_metadata = Some(metadata);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairing() -> PairingStruct {
        PairingStruct {
            topic: Topic::from("topic"),
            relay: Relay::default(),
            expiry: 100,
            active: false,
            methods: None,
            peer_metadata: None,
        }
    }

    #[test]
    fn patch_merges_set_fields_only() {
        let mut stored = pairing();
        stored.apply_patch(PairingPatch::default());
        assert_eq!(stored, pairing());

        stored.apply_patch(PairingPatch {
            active: Some(true),
            ..Default::default()
        });
        assert!(stored.active);
        assert_eq!(stored.expiry, 100);

        // An inactive value never resets an active pairing.
        let incoming = PairingStruct {
            expiry: 200,
            ..pairing()
        };
        stored.apply_patch(incoming.to_patch());
        assert!(stored.active);
        assert_eq!(stored.expiry, 200);
    }
}
