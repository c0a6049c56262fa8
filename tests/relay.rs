mod common;

use bytes::Bytes;
use common::*;
use minecraft_relay::{
    control_channel::{self, ControlRequest, ControlResponse, CONTROL_CHANNEL},
    hooks::LoginStatus,
    protocol::{
        packet::{Disconnect, KeepAlive, PluginMessage},
        DecodedPacket, Packet, ProtocolVersion, RawPacket,
    },
    session::MAX_CHANNELS,
    ProxyConfig,
};
use std::time::Duration;

const MODERN: ProtocolVersion = ProtocolVersion::V1_20_3;
/// Not assigned to any packet in Play for this version.
const UNASSIGNED_ID: i32 = 0x7a;
const PACKETS_PER_DIRECTION: u32 = 1_000;

fn numbered(sequence: u32) -> RawPacket {
    let size = if sequence % 2 == 0 { 10 } else { 400 };
    let mut payload = vec![(sequence % 251) as u8; size];
    payload[..4].copy_from_slice(&sequence.to_be_bytes());
    RawPacket {
        id: UNASSIGNED_ID,
        payload: Bytes::from(payload),
    }
}

async fn expect_numbered(conn: &mut minecraft_relay::connection::Connection) {
    for sequence in 0..PACKETS_PER_DIRECTION {
        match recv(conn).await {
            DecodedPacket::Opaque(raw) => assert_eq!(raw, numbered(sequence)),
            other => panic!("expected packet {sequence}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn relays_in_order_through_compression() {
    let config = ProxyConfig {
        compression_threshold: 256,
        ..config()
    };
    let proxy = TestProxy::new(config);
    let (mut client, mut lobby) = proxy.join(MODERN, "Steve").await;

    let send = async {
        for sequence in 0..PACKETS_PER_DIRECTION {
            client.write_raw(&numbered(sequence)).await.unwrap();
        }
    };
    tokio::join!(send, expect_numbered(&mut lobby.conn));

    let send = async {
        for sequence in 0..PACKETS_PER_DIRECTION {
            lobby.conn.write_raw(&numbered(sequence)).await.unwrap();
        }
    };
    tokio::join!(send, expect_numbered(&mut client));
}

async fn ask(lobby: &mut MockBackend, request: ControlRequest) -> ControlResponse {
    let message = control_channel::to_plugin_message(&request).unwrap();
    lobby.conn.write_packet(message).await.unwrap();
    let received = recv_until(&mut lobby.conn, |p| {
        matches!(p, DecodedPacket::Known(Packet::PluginMessage(m)) if m.channel == CONTROL_CHANNEL)
    })
    .await;
    match received.last() {
        Some(DecodedPacket::Known(Packet::PluginMessage(message))) => {
            control_channel::decode(&message.data).unwrap()
        }
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn backends_talk_to_the_proxy_over_the_control_channel() {
    let proxy = TestProxy::new(config());
    let (mut client, mut lobby) = proxy.join(MODERN, "Steve").await;

    assert_eq!(
        ask(&mut lobby, ControlRequest::GetServers).await,
        ControlResponse::Servers(vec![
            "lobby".to_owned(),
            "survival".to_owned(),
            "void".to_owned()
        ])
    );
    assert_eq!(
        ask(&mut lobby, ControlRequest::GetCurrentServer).await,
        ControlResponse::CurrentServer(Some("lobby".to_owned()))
    );
    let failed = ask(
        &mut lobby,
        ControlRequest::Connect {
            server: "nowhere".to_owned(),
        },
    )
    .await;
    assert!(
        matches!(&failed, ControlResponse::ConnectFailed { server, .. } if server == "nowhere"),
        "{failed:?}"
    );

    let connect = control_channel::to_plugin_message(&ControlRequest::Connect {
        server: "survival".to_owned(),
    })
    .unwrap();
    lobby.conn.write_packet(connect).await.unwrap();
    let mut survival = proxy.accept("survival").await;
    enter_configuration(&mut client).await;
    configure(&mut client, &mut survival).await;
    proxy
        .events
        .wait_for(|e| {
            *e == Event::SwitchCompleted {
                previous: Some("lobby".to_owned()),
                server: "survival".to_owned(),
            }
        })
        .await;

    // The control channel never reaches players.
    survival
        .conn
        .write_packet(control_channel::to_plugin_message(&ControlRequest::GetServers).unwrap())
        .await
        .unwrap();
    survival.conn.write_packet(KeepAlive { id: 5 }).await.unwrap();
    let seen = recv_until(&mut client, |p| {
        p.known() == Some(&Packet::KeepAlive(KeepAlive { id: 5 }))
    })
    .await;
    assert!(!seen.iter().any(|p| matches!(
        p,
        DecodedPacket::Known(Packet::PluginMessage(m)) if m.channel == CONTROL_CHANNEL
    )));
}

#[tokio::test]
async fn players_cannot_use_the_control_channel() {
    let proxy = TestProxy::new(config());
    let (mut client, mut lobby) = proxy.join(MODERN, "Steve").await;

    let spoofed = control_channel::to_plugin_message(&ControlRequest::Connect {
        server: "survival".to_owned(),
    })
    .unwrap();
    client.write_packet(spoofed).await.unwrap();
    client
        .write_packet(PluginMessage::new("example:chat", b"hello".to_vec()))
        .await
        .unwrap();

    let seen = recv_until(&mut lobby.conn, |p| {
        matches!(p, DecodedPacket::Known(Packet::PluginMessage(m)) if m.channel == "example:chat")
    })
    .await;
    assert_eq!(seen.len(), 1, "{seen:?}");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        proxy.session("Steve").current_server().as_deref(),
        Some("lobby")
    );
}

#[tokio::test]
async fn hooks_can_drop_and_replace_packets() {
    let proxy = TestProxy::new(config());
    let (mut client, mut lobby) = proxy.join(MODERN, "Steve").await;

    lobby
        .conn
        .write_packet(PluginMessage::new(SECRET_CHANNEL, vec![1, 2, 3]))
        .await
        .unwrap();
    lobby
        .conn
        .write_packet(KeepAlive {
            id: REWRITE_KEEP_ALIVE,
        })
        .await
        .unwrap();
    let seen = recv_until(&mut client, |p| {
        matches!(p, DecodedPacket::Known(Packet::KeepAlive(_)))
    })
    .await;
    assert_eq!(
        seen,
        vec![DecodedPacket::Known(
            KeepAlive {
                id: REWRITTEN_KEEP_ALIVE
            }
            .into()
        )]
    );

    client
        .write_packet(PluginMessage::new(SECRET_CHANNEL, Vec::new()))
        .await
        .unwrap();
    client.write_packet(KeepAlive { id: 3 }).await.unwrap();
    let seen = recv_until(&mut lobby.conn, |p| {
        matches!(p, DecodedPacket::Known(Packet::KeepAlive(_)))
    })
    .await;
    assert_eq!(seen, vec![DecodedPacket::Known(KeepAlive { id: 3 }.into())]);
}

#[tokio::test]
async fn leaving_ends_the_session() {
    let proxy = TestProxy::new(config());
    let (client, mut lobby) = proxy.join(MODERN, "Steve").await;

    drop(client);
    expect_closed(&mut lobby.conn).await;
    proxy
        .events
        .wait_for(|e| *e == Event::Disconnected(LoginStatus::SuccessfulLogin))
        .await;
    within(async {
        while !proxy.ctx.sessions().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
}

fn register(channels: impl Iterator<Item = String>) -> PluginMessage {
    let names: Vec<_> = channels.collect();
    PluginMessage::new("minecraft:register", names.join("\0").into_bytes())
}

#[tokio::test]
async fn registering_too_many_channels_kicks_the_client() {
    let proxy = TestProxy::new(config());
    let (mut client, mut lobby) = proxy.join(MODERN, "Steve").await;

    client
        .write_packet(register((0..MAX_CHANNELS).map(|i| format!("mod:c{i}"))))
        .await
        .unwrap();
    recv_until(&mut lobby.conn, |p| {
        matches!(p, DecodedPacket::Known(Packet::PluginMessage(m)) if m.channel == "minecraft:register")
    })
    .await;
    assert_eq!(proxy.session("Steve").channels().len(), MAX_CHANNELS);

    client
        .write_packet(register(std::iter::once("mod:overflow".to_owned())))
        .await
        .unwrap();
    let packets = recv_until(&mut client, |p| {
        matches!(p, DecodedPacket::Known(Packet::Disconnect(_)))
    })
    .await;
    match packets.last() {
        Some(DecodedPacket::Known(Packet::Disconnect(Disconnect { reason }))) => {
            assert!(reason.plain_text().contains("too many plugin channels"), "{reason:?}");
        }
        other => panic!("expected a disconnect, got {other:?}"),
    }
    expect_closed(&mut client).await;
    proxy
        .events
        .wait_for(|e| *e == Event::Disconnected(LoginStatus::CancelledByProxy))
        .await;

    let mut leaked = Vec::new();
    within(async {
        while let Ok(packet) = lobby.conn.read_packet().await {
            leaked.push(packet);
        }
    })
    .await;
    assert!(
        !leaked.iter().any(|p| matches!(
            p.known(),
            Some(Packet::PluginMessage(m)) if m.channel == "minecraft:register"
        )),
        "{leaked:?}"
    );
}
