mod common;

use {
    anyhow::{anyhow, Result},
    common::{approved, peer, required, settle, wait_for, PersonalSign, ACCOUNT, CHAIN, TIMEOUT},
    core_api::time,
    relay_client::memory::MemoryRelay,
    relay_rpc::rpc::params::{
        namespaces::SettleNamespace,
        session_event::Event,
        session_request::Request,
        SdkErrorKind,
    },
    serde_json::json,
    sign_api::{ApproveParams, ConnectParams, SignError, SignEvent},
};

#[tokio::test]
async fn pairing_is_shared_and_pingable() -> Result<()> {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, "dapp").await?;
    let wallet = peer(&relay, "wallet").await?;

    let connect = dapp.client.connect(ConnectParams::new(required())).await?;
    let uri = connect.uri.clone().expect("new pairing");
    let pairing = wallet.client.pair(&uri.to_string()).await?;
    assert_eq!(pairing.topic, connect.pairing_topic);
    assert!(!pairing.active);

    tokio::time::timeout(TIMEOUT, dapp.client.ping(&connect.pairing_topic)).await??;
    Ok(())
}

#[tokio::test]
async fn session_lifecycle() -> Result<()> {
    let relay = MemoryRelay::new();
    let mut dapp = peer(&relay, "dapp").await?;
    let mut wallet = peer(&relay, "wallet").await?;

    let topic = settle(&mut dapp, &mut wallet).await?;
    let session = dapp.client.get_session(&topic).await?;
    assert!(session.acknowledged);
    assert_eq!(session.namespaces, approved());
    assert_eq!(session.peer.metadata.name, "wallet");
    assert!(dapp.client.proposals().await.is_empty());
    assert!(wallet.client.proposals().await.is_empty());
    assert_eq!(dapp.client.find(&required()).await.len(), 1);
    assert!(dapp.client.pairing().get_pairing(&session.pairing_topic).await?.active);

    // Only the wallet controls the session.
    assert!(matches!(
        dapp.client.update(&topic, approved()).await,
        Err(SignError::UnauthorizedUpdate(_))
    ));

    let mut updated = approved();
    if let Some(namespace) = updated.get_mut("eip155") {
        namespace.methods.insert("eth_signTypedData".to_owned());
    }
    let ack = wallet.client.update(&topic, updated.clone()).await?;
    tokio::time::timeout(TIMEOUT, ack.acknowledged()).await??;
    let namespaces = wait_for(&mut dapp.events, |event| match event {
        SignEvent::SessionUpdate { namespaces, .. } => Some(namespaces),
        _ => None,
    })
    .await?;
    assert_eq!(namespaces, updated);
    assert_eq!(dapp.client.get_session(&topic).await?.namespaces, updated);

    let before = dapp.client.get_session(&topic).await?.expiry;
    let ack = wallet.client.extend(&topic).await?;
    tokio::time::timeout(TIMEOUT, ack.acknowledged()).await??;
    let expiry = wait_for(&mut dapp.events, |event| match event {
        SignEvent::SessionExtend { expiry, .. } => Some(expiry),
        _ => None,
    })
    .await?;
    assert!(expiry >= before);
    assert_eq!(dapp.client.get_session(&topic).await?.expiry, expiry);

    tokio::time::timeout(TIMEOUT, dapp.client.ping(&topic)).await??;
    wait_for(&mut wallet.events, |event| match event {
        SignEvent::SessionPing { topic: t, .. } if t == topic => Some(()),
        _ => None,
    })
    .await?;

    tokio::time::timeout(
        TIMEOUT,
        wallet.client.emit(&topic, CHAIN, Event {
            name: "chainChanged".to_owned(),
            data: json!(1),
        }),
    )
    .await??;
    let event = wait_for(&mut dapp.events, |event| match event {
        SignEvent::SessionEvent { event, chain_id, .. } if chain_id == CHAIN => Some(event),
        _ => None,
    })
    .await?;
    assert_eq!(event.name, "chainChanged");

    // Not in the approved events.
    assert!(matches!(
        wallet
            .client
            .emit(&topic, CHAIN, Event {
                name: "disconnect".to_owned(),
                data: json!(null),
            })
            .await,
        Err(SignError::UnsupportedEvent { .. })
    ));

    dapp.client.disconnect(&topic).await?;
    assert!(dapp.client.sessions().await.is_empty());
    wait_for(&mut wallet.events, |event| match event {
        SignEvent::SessionDelete { topic: t, .. } if t == topic => Some(()),
        _ => None,
    })
    .await?;
    assert!(wallet.client.sessions().await.is_empty());
    assert!(matches!(
        dapp.client.ping(&topic).await,
        Err(SignError::SessionNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn requests_are_correlated() -> Result<()> {
    let relay = MemoryRelay::new();
    let mut dapp = peer(&relay, "dapp").await?;
    let mut wallet = peer(&relay, "wallet").await?;
    let topic = settle(&mut dapp, &mut wallet).await?;

    wallet
        .client
        .on_session_request::<PersonalSign, _, _>(|event| async move {
            Ok(format!("signed:{}", event.params.0))
        });

    let (first, second) = tokio::time::timeout(TIMEOUT, async {
        tokio::join!(
            dapp.client.request(
                &topic,
                CHAIN,
                PersonalSign("first".to_owned(), ACCOUNT.to_owned())
            ),
            dapp.client.request(
                &topic,
                CHAIN,
                PersonalSign("second".to_owned(), ACCOUNT.to_owned())
            ),
        )
    })
    .await?;
    assert_eq!(first?, "signed:first");
    assert_eq!(second?, "signed:second");

    // No handler for this method: answered through the event.
    let request = Request {
        method: "eth_sendTransaction".to_owned(),
        params: json!([{ "to": "0x0" }]),
        expiry_timestamp: None,
    };
    let wallet_side = async {
        let (id, request_topic) = wait_for(&mut wallet.events, |event| match event {
            SignEvent::SessionRequest { id, topic, request, .. }
                if request.method == "eth_sendTransaction" =>
            {
                Some((id, topic))
            }
            _ => None,
        })
        .await?;
        assert_eq!(wallet.client.pending_session_requests().await.len(), 1);
        wallet
            .client
            .respond(&request_topic, id, Ok(json!("0xhash")))
            .await?;
        anyhow::Ok(())
    };
    let (result, answered) = tokio::time::timeout(TIMEOUT, async {
        tokio::join!(dapp.client.request_raw(&topic, CHAIN, request), wallet_side)
    })
    .await?;
    answered?;
    assert_eq!(result?, json!("0xhash"));
    assert!(wallet.client.pending_session_requests().await.is_empty());

    let rejected = Request {
        method: "eth_sendTransaction".to_owned(),
        params: json!([]),
        expiry_timestamp: None,
    };
    let wallet_side = async {
        let (id, request_topic) = wait_for(&mut wallet.events, |event| match event {
            SignEvent::SessionRequest { id, topic, .. } => Some((id, topic)),
            _ => None,
        })
        .await?;
        wallet
            .client
            .respond(&request_topic, id, Err(SdkErrorKind::UserRejected.error_data()))
            .await?;
        anyhow::Ok(())
    };
    let (result, answered) = tokio::time::timeout(TIMEOUT, async {
        tokio::join!(dapp.client.request_raw(&topic, CHAIN, rejected), wallet_side)
    })
    .await?;
    answered?;
    assert!(matches!(
        result,
        Err(SignError::Rejected(error)) if error.code == SdkErrorKind::UserRejected.code()
    ));

    // Checked locally, before anything is sent.
    assert!(matches!(
        dapp.client
            .request(&topic, "eip155:5", PersonalSign("x".to_owned(), ACCOUNT.to_owned()))
            .await,
        Err(SignError::UnsupportedChain { .. })
    ));
    assert!(matches!(
        dapp.client
            .request_raw(&topic, CHAIN, Request {
                method: "eth_signTypedData".to_owned(),
                params: json!([]),
                expiry_timestamp: None,
            })
            .await,
        Err(SignError::UnsupportedMethod { .. })
    ));
    Ok(())
}

#[tokio::test]
async fn non_conforming_approval_sends_nothing() -> Result<()> {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, "dapp").await?;
    let mut wallet = peer(&relay, "wallet").await?;

    let connect = dapp.client.connect(ConnectParams::new(required())).await?;
    let uri = connect.uri.clone().expect("new pairing");
    wallet.client.pair(&uri.to_string()).await?;
    let id = wait_for(&mut wallet.events, |event| match event {
        SignEvent::SessionProposal { id, .. } => Some(id),
        _ => None,
    })
    .await?;

    let published = relay.published(&connect.pairing_topic).await.len();
    let missing_method = [("eip155", SettleNamespace {
        methods: ["personal_sign".to_owned()].into_iter().collect(),
        ..approved().get("eip155").cloned().unwrap_or_default()
    })]
    .into_iter()
    .collect();
    assert!(matches!(
        wallet
            .client
            .approve(ApproveParams::new(id, missing_method))
            .await,
        Err(SignError::Namespaces(_))
    ));
    assert_eq!(relay.published(&connect.pairing_topic).await.len(), published);
    assert!(wallet.client.sessions().await.is_empty());
    assert_eq!(wallet.client.proposals().await.len(), 1);

    wallet
        .client
        .reject(id, SdkErrorKind::UserRejected.error_data())
        .await?;
    assert!(wallet.client.proposals().await.is_empty());
    let result = tokio::time::timeout(TIMEOUT, connect.approval.wait()).await?;
    assert!(matches!(
        result,
        Err(SignError::Rejected(error)) if error.code == SdkErrorKind::UserRejected.code()
    ));
    assert!(dapp.client.proposals().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn dropping_the_approval_keeps_the_proposal() -> Result<()> {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, "dapp").await?;

    let connect = dapp.client.connect(ConnectParams::new(required())).await?;
    let id = connect.approval.id();
    drop(connect);

    // The proposal stays until it expires or is answered.
    assert_eq!(dapp.client.proposals().await.first().map(|p| p.id), Some(id));
    Ok(())
}

#[tokio::test]
async fn unanswered_request_expires() -> Result<()> {
    let relay = MemoryRelay::new();
    let mut dapp = peer(&relay, "dapp").await?;
    let mut wallet = peer(&relay, "wallet").await?;
    let topic = settle(&mut dapp, &mut wallet).await?;

    let request = Request {
        method: "eth_sendTransaction".to_owned(),
        params: json!([]),
        expiry_timestamp: Some(time::expiry_from_now(2)),
    };
    let pending = dapp.client.request_raw(&topic, CHAIN, request);
    let expired = wait_for(&mut wallet.events, |event| match event {
        SignEvent::SessionRequestExpired { id } => Some(id),
        _ => None,
    });
    let id = tokio::select! {
        result = pending => Err(anyhow!("request answered: {result:?}")),
        id = expired => id,
    }?;

    assert!(wallet.client.pending_session_requests().await.is_empty());
    assert!(matches!(
        wallet.client.respond(&topic, id, Ok(json!("0xlate"))).await,
        Err(SignError::RequestNotFound(_))
    ));
    Ok(())
}
