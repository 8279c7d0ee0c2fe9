#![allow(dead_code)]

use {
    anyhow::{anyhow, Result},
    relay_client::memory::MemoryRelay,
    relay_rpc::{
        domain::Topic,
        rpc::params::{
            namespaces::{ProposeNamespace, ProposeNamespaces, SettleNamespace, SettleNamespaces},
            Metadata,
        },
    },
    serde::{Deserialize, Serialize},
    sign_api::{
        ApproveParams,
        ConnectParams,
        SessionMethod,
        SessionStruct,
        SignClient,
        SignClientOptions,
        SignEvent,
    },
    std::{sync::Arc, time::Duration},
    tokio::sync::broadcast,
};

pub const CHAIN: &str = "eip155:1";
pub const ACCOUNT: &str = "eip155:1:0xab16a96d359ec26a11e2c2b3d8f8b8942d5bfcdb";
pub const TIMEOUT: Duration = Duration::from_secs(10);

/// `personal_sign` with its `[message, address]` params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalSign(pub String, pub String);

impl SessionMethod for PersonalSign {
    type Response = String;

    const METHOD: &'static str = "personal_sign";
}

pub struct Peer {
    pub client: SignClient,
    pub events: broadcast::Receiver<SignEvent>,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn peer(relay: &MemoryRelay, name: &str) -> Result<Peer> {
    init_tracing();
    let metadata = Metadata {
        name: name.to_owned(),
        description: format!("{name} test peer"),
        url: format!("https://{name}.example.com"),
        icons: vec![],
        redirect: None,
    };
    let options = SignClientOptions::new("test-project", metadata)
        .with_transport(Arc::new(relay.transport().await))
        .with_heartbeat_interval(Duration::from_millis(100))
        .with_reconnect_delay(Duration::from_millis(50));

    let client = SignClient::init(options).await?;
    let events = client.subscribe();
    Ok(Peer { client, events })
}

/// Next event `select` picks, skipping the others.
pub async fn wait_for<T>(
    events: &mut broadcast::Receiver<SignEvent>,
    mut select: impl FnMut(SignEvent) -> Option<T>,
) -> Result<T> {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(value) = select(events.recv().await?) {
                return Ok::<_, anyhow::Error>(value);
            }
        }
    })
    .await
    .map_err(|_| anyhow!("no matching event"))?
}

fn set<const N: usize>(items: [&str; N]) -> std::collections::BTreeSet<String> {
    items.into_iter().map(str::to_owned).collect()
}

pub fn required() -> ProposeNamespaces {
    [("eip155", ProposeNamespace {
        chains: set([CHAIN]),
        methods: set(["personal_sign", "eth_sendTransaction"]),
        events: set(["chainChanged"]),
    })]
    .into_iter()
    .collect()
}

pub fn approved() -> SettleNamespaces {
    [("eip155", SettleNamespace {
        accounts: set([ACCOUNT]),
        chains: None,
        methods: set(["personal_sign", "eth_sendTransaction"]),
        events: set(["chainChanged", "accountsChanged"]),
    })]
    .into_iter()
    .collect()
}

/// Runs a full proposal between `dapp` and `wallet` and returns the settled
/// session topic.
pub async fn settle(dapp: &mut Peer, wallet: &mut Peer) -> Result<Topic> {
    let connect = dapp.client.connect(ConnectParams::new(required())).await?;
    let uri = connect.uri.ok_or_else(|| anyhow!("no pairing uri"))?;
    wallet.client.pair(&uri.to_string()).await?;

    let id = wait_for(&mut wallet.events, |event| match event {
        SignEvent::SessionProposal { id, .. } => Some(id),
        _ => None,
    })
    .await?;
    let approved = wallet
        .client
        .approve(ApproveParams::new(id, approved()))
        .await?;

    let session: SessionStruct = tokio::time::timeout(TIMEOUT, connect.approval.wait()).await??;
    let acknowledged = tokio::time::timeout(TIMEOUT, approved.acknowledged()).await??;
    assert_eq!(session.topic, acknowledged.topic);
    Ok(session.topic)
}
