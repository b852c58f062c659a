//! UDP ingestion and publication. Each socket gets its own async loop that
//! decodes or forwards datagrams and hands them to the processor thread
//! over unbounded channels.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use clock::Clock;
use futures::channel::mpsc;
use futures::StreamExt;
use miette::{IntoDiagnostic, Result, WrapErr};
use tokio::net::UdpSocket;
use wire::radio::RadioCommand;
use wire::world::Status;
use wire::Encode;

/// Binds a socket to `port` and joins the given multicast group.
pub async fn bind_multicast(group: &str, port: u16) -> Result<UdpSocket> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .into_diagnostic()
        .wrap_err_with(|| format!("binding udp port {port}"))?;
    let group: Ipv4Addr = group
        .parse()
        .into_diagnostic()
        .wrap_err_with(|| format!("invalid multicast group {group}"))?;
    socket
        .join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)
        .into_diagnostic()
        .wrap_err("joining multicast group")?;
    Ok(socket)
}

/// Forwards raw vision datagrams with their receive time on the virtual
/// clock. Parsing is the tracker's job; a tick boundary is the right place
/// to pay for it.
pub async fn vision_receive_loop(
    socket: UdpSocket,
    clock: Arc<Clock>,
    tx: mpsc::UnboundedSender<(Vec<u8>, i64)>,
) {
    let mut buffer = vec![0u8; 65536];
    loop {
        let Ok((size, _address)) = socket.recv_from(&mut buffer).await else {
            tracing::error!("vision socket receive failed");
            continue;
        };
        if tx
            .unbounded_send((buffer[..size].to_vec(), clock.now()))
            .is_err()
        {
            // processor gone, nothing left to feed
            return;
        }
    }
}

pub async fn referee_receive_loop(socket: UdpSocket, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buffer = vec![0u8; 8192];
    loop {
        let Ok((size, _address)) = socket.recv_from(&mut buffer).await else {
            tracing::error!("referee socket receive failed");
            continue;
        };
        if tx.unbounded_send(buffer[..size].to_vec()).is_err() {
            return;
        }
    }
}

/// Publishes every status as one encoded datagram.
pub async fn status_publish_loop(
    socket: UdpSocket,
    target: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<Status>,
) {
    while let Some(status) = rx.next().await {
        let bytes = status.encode_to_vec();
        if let Err(error) = socket.send_to(&bytes, target).await {
            tracing::warn!(%error, "failed to publish status");
        }
    }
}

/// Radio-command contract toward the command converter: one datagram per
/// batch, the processing delay first, then the encoded command list.
pub async fn radio_publish_loop(
    socket: UdpSocket,
    target: SocketAddr,
    mut rx: mpsc::UnboundedReceiver<(Vec<RadioCommand>, i64)>,
) {
    while let Some((commands, processing_delay)) = rx.next().await {
        let mut bytes = Vec::new();
        // writing to a Vec cannot fail
        processing_delay.encode(&mut bytes).unwrap();
        commands.encode(&mut bytes).unwrap();
        if let Err(error) = socket.send_to(&bytes, target).await {
            tracing::warn!(%error, "failed to send radio commands");
        }
    }
}
