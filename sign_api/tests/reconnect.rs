mod common;

use {
    anyhow::Result,
    common::{peer, settle, wait_for, TIMEOUT},
    relay_client::memory::MemoryRelay,
    sign_api::SignEvent,
    std::time::Duration,
};

#[tokio::test]
async fn session_survives_a_dropped_connection() -> Result<()> {
    let relay = MemoryRelay::new();
    let mut dapp = peer(&relay, "dapp").await?;
    let mut wallet = peer(&relay, "wallet").await?;
    let topic = settle(&mut dapp, &mut wallet).await?;
    assert_eq!(relay.subscriber_count(&topic).await, 2);

    relay.drop_connections().await;
    assert_eq!(relay.subscriber_count(&topic).await, 0);

    // Both clients reconnect on their own and restore their subscriptions.
    tokio::time::timeout(TIMEOUT, async {
        while relay.subscriber_count(&topic).await < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    assert_eq!(relay.connection_count().await, 2);

    tokio::time::timeout(TIMEOUT, dapp.client.ping(&topic)).await??;
    wait_for(&mut wallet.events, |event| match event {
        SignEvent::SessionPing { topic: t, .. } if t == topic => Some(()),
        _ => None,
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn closed_client_stays_closed() -> Result<()> {
    let relay = MemoryRelay::new();
    let dapp = peer(&relay, "dapp").await?;
    assert_eq!(relay.connection_count().await, 1);

    dapp.client.close().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(relay.connection_count().await, 0);
    Ok(())
}
