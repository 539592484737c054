//! QUIC 回环测试：在本机启动隧道出口与入口，验证双通道往返、消息边界与协作关闭。

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use tunnel_core::{
    CloseReason, DATAGRAM_THRESHOLD, Delivery, Initiator, SessionError, TunnelClientConfig,
    TunnelConfig, TunnelServerConfig, testing::RecordingHost,
};
use tunnel_transport_quic::{TunnelClient, TunnelEndpoint, TunnelServer};

const WAIT: Duration = Duration::from_secs(10);

struct Loopback {
    client: TunnelEndpoint,
    client_host: Arc<RecordingHost>,
    server: TunnelEndpoint,
    server_host: Arc<RecordingHost>,
}

async fn connect(server_tunnel: TunnelConfig, mut client: TunnelClientConfig) -> Result<Loopback> {
    let server = TunnelServer::bind(TunnelServerConfig {
        bind: "127.0.0.1:0".to_owned(),
        tunnel: server_tunnel,
    })
    .await?;
    client.remote = server.local_addr().to_string();

    let server_host = Arc::new(RecordingHost::default());
    let accept = tokio::spawn({
        let host = server_host.clone();
        async move { server.accept(host).await }
    });

    let client_host = Arc::new(RecordingHost::default());
    let client = TunnelClient::start(&client, client_host.clone()).await?;
    let server = accept.await??;
    Ok(Loopback {
        client,
        client_host,
        server,
        server_host,
    })
}

async fn default_loopback() -> Result<Loopback> {
    connect(TunnelConfig::default(), TunnelClientConfig::default()).await
}

async fn teardown(loopback: Loopback) {
    loopback.client.shutdown().await;
    loopback.server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_round_trip_handles_empty_and_multi_chunk_payloads() -> Result<()> {
    let loopback = default_loopback().await?;
    let server_addr = loopback
        .server
        .local_addr()
        .context("server endpoint has no local address")?;
    assert_eq!(loopback.client.remote_addr().port(), server_addr.port());
    let large: Vec<u8> = (0..5000).map(|i| (i % 239) as u8).collect();

    loopback.client.send_stream(b"").await?;
    loopback.client.send_stream(b"x").await?;
    loopback.client.send_stream(&large).await?;

    let mut received = loopback
        .server_host
        .wait_for_messages(3, WAIT)
        .await
        .context("server did not receive three messages")?;
    received.sort_by_key(|message| message.len());
    assert_eq!(received[0].len(), 0);
    assert_eq!(received[1].as_ref(), b"x");
    assert_eq!(received[2].as_ref(), large.as_slice());

    teardown(loopback).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn back_to_back_streams_arrive_as_distinct_messages() -> Result<()> {
    let loopback = default_loopback().await?;
    loopback.server.send_stream(b"first").await?;
    loopback.server.send_stream(b"second").await?;

    let mut received = loopback
        .client_host
        .wait_for_messages(2, WAIT)
        .await
        .context("client did not receive two messages")?;
    received.sort();
    assert_eq!(
        received,
        vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]
    );

    teardown(loopback).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn size_policy_selects_the_channel() -> Result<()> {
    let loopback = default_loopback().await?;

    let small = loopback
        .client
        .send_datagram(Bytes::from_static(b"ping"))
        .await?;
    assert_eq!(small, Delivery::Datagram);

    let large = Bytes::from(vec![7_u8; 3000]);
    let fallback = loopback.client.send_datagram(large.clone()).await?;
    assert_eq!(fallback, Delivery::Stream);

    let mut received = loopback
        .server_host
        .wait_for_messages(2, WAIT)
        .await
        .context("server did not receive both messages")?;
    received.sort_by_key(|message| message.len());
    assert_eq!(received, vec![Bytes::from_static(b"ping"), large]);

    teardown(loopback).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn threshold_sized_datagram_fits_on_default_config() -> Result<()> {
    let loopback = default_loopback().await?;
    let limit = loopback
        .client
        .session()
        .max_datagram_size()
        .context("datagrams should be negotiated")?;
    assert!(limit >= DATAGRAM_THRESHOLD, "datagram limit {limit} below threshold");

    let from_client = Bytes::from(vec![1_u8; DATAGRAM_THRESHOLD]);
    let from_server = Bytes::from(vec![2_u8; DATAGRAM_THRESHOLD]);
    assert_eq!(
        loopback.client.send_datagram(from_client.clone()).await?,
        Delivery::Datagram
    );
    assert_eq!(
        loopback.server.send_datagram(from_server.clone()).await?,
        Delivery::Datagram
    );

    let at_server = loopback
        .server_host
        .wait_for_messages(1, WAIT)
        .await
        .context("server did not receive the datagram")?;
    assert_eq!(at_server, vec![from_client]);
    let at_client = loopback
        .client_host
        .wait_for_messages(1, WAIT)
        .await
        .context("client did not receive the datagram")?;
    assert_eq!(at_client, vec![from_server]);

    teardown(loopback).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn disabled_datagrams_route_small_payloads_through_streams() -> Result<()> {
    let tunnel = TunnelConfig {
        enable_datagrams: false,
        ..TunnelConfig::default()
    };
    let client = TunnelClientConfig {
        tunnel: tunnel.clone(),
        ..TunnelClientConfig::default()
    };
    let loopback = connect(tunnel, client).await?;
    assert_eq!(loopback.client.session().connection_id().as_bytes().len(), 8);

    let delivery = loopback
        .client
        .send_datagram(Bytes::from_static(b"tiny"))
        .await?;
    assert_eq!(delivery, Delivery::Stream);
    let received = loopback
        .server_host
        .wait_for_messages(1, WAIT)
        .await
        .context("server did not receive the message")?;
    assert_eq!(received, vec![Bytes::from_static(b"tiny")]);

    teardown(loopback).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_closes_both_sides_cooperatively() -> Result<()> {
    let loopback = default_loopback().await?;

    loopback.client.stop()?;
    assert_eq!(
        loopback.client.send_stream(b"late").await,
        Err(SessionError::Closed)
    );
    assert_eq!(
        loopback
            .client
            .send_datagram(Bytes::from_static(b"late"))
            .await,
        Err(SessionError::Closed)
    );

    let server_reason = tokio::time::timeout(WAIT, loopback.server.closed())
        .await
        .map_err(|_| anyhow!("server session did not close"))?;
    assert_eq!(
        server_reason,
        CloseReason::Cooperative {
            initiator: Initiator::Peer
        }
    );
    let client_reason = tokio::time::timeout(WAIT, loopback.client.closed())
        .await
        .map_err(|_| anyhow!("client session did not close"))?;
    assert_eq!(
        client_reason,
        CloseReason::Cooperative {
            initiator: Initiator::Local
        }
    );
    assert_eq!(loopback.server_host.closes(), vec![server_reason]);
    assert!(loopback.server_host.messages().is_empty());

    teardown(loopback).await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn qlog_file_is_created_per_connection() -> Result<()> {
    let scratch = tempfile::tempdir()?;
    let dir = scratch.path().join("qlog");
    let client = TunnelClientConfig {
        tunnel: TunnelConfig {
            qlog_dir: Some(dir.clone()),
            ..TunnelConfig::default()
        },
        ..TunnelClientConfig::default()
    };
    let loopback = connect(TunnelConfig::default(), client).await?;

    let filenames = loopback.client_host.qlog_filenames();
    assert_eq!(filenames.len(), 1);
    let expected = format!("{}.qlog", loopback.client.session().connection_id());
    assert_eq!(filenames[0], expected);
    assert!(loopback.server_host.qlog_filenames().is_empty());

    let client_host = loopback.client_host.clone();
    teardown(loopback).await;
    assert_eq!(client_host.closes().len(), 1);

    let contents = std::fs::read_to_string(dir.join(&expected))?;
    assert!(contents.contains("connectivity:connection_closed"));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn trusted_certificate_verifies_the_server() -> Result<()> {
    let server = TunnelServer::bind(TunnelServerConfig::new("127.0.0.1:0")).await?;
    let cert_file = tempfile::Builder::new().suffix(".der").tempfile()?;
    std::fs::write(cert_file.path(), server.certificate().as_ref())?;

    let client_config = TunnelClientConfig {
        remote: server.local_addr().to_string(),
        trusted_certificate: Some(cert_file.path().to_path_buf()),
        ..TunnelClientConfig::default()
    };
    let server_host = Arc::new(RecordingHost::default());
    let accept = tokio::spawn({
        let host = server_host.clone();
        async move { server.accept(host).await }
    });
    let client = TunnelClient::start(&client_config, Arc::new(RecordingHost::default())).await?;
    let server = accept.await??;

    client.send_stream(b"verified").await?;
    let received = server_host
        .wait_for_messages(1, WAIT)
        .await
        .context("server did not receive the message")?;
    assert_eq!(received, vec![Bytes::from_static(b"verified")]);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_certificate_path_fails_before_dialing() -> Result<()> {
    let config = TunnelClientConfig {
        remote: "127.0.0.1:9".to_owned(),
        trusted_certificate: Some(PathBuf::from("/nonexistent/server.der")),
        ..TunnelClientConfig::default()
    };
    let err = TunnelClient::start(&config, Arc::new(RecordingHost::default()))
        .await
        .expect_err("missing certificate must fail");
    assert_eq!(err.code(), "tunnel.quic.credentials_failed");
    Ok(())
}
