//! WebSocket fan-out of the broadcast hub.
//!
//! Each accepted connection becomes one hub subscriber. Snapshots are
//! forwarded as text frames; inbound frames are read only to notice the
//! peer closing. A client that stops draining its socket fills its queue
//! and simply misses snapshots.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::BroadcastHub;
use crate::logging::{log, log_fault, obj, v_str, Domain, Level};

/// Accept connections until `stop` flips to true.
pub async fn serve(listener: TcpListener, hub: Arc<BroadcastHub>, mut stop: watch::Receiver<bool>) -> Result<()> {
    let local = listener.local_addr()?;
    log(
        Level::Info,
        Domain::Broadcast,
        "ws_listening",
        obj(&[("addr", v_str(&local.to_string()))]),
    );

    loop {
        if *stop.borrow() {
            break;
        }
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    let hub = hub.clone();
                    let stop = stop.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(tcp, peer, hub, stop).await {
                            log_fault(Domain::Broadcast, "connection", &format!("{:#}", err));
                        }
                    });
                }
                Err(err) => log_fault(Domain::Broadcast, "accept", &err.to_string()),
            },
        }
    }
    log(Level::Info, Domain::Broadcast, "ws_closed", obj(&[]));
    Ok(())
}

async fn handle_connection(
    tcp: TcpStream,
    peer: SocketAddr,
    hub: Arc<BroadcastHub>,
    mut stop: watch::Receiver<bool>,
) -> Result<()> {
    let ws = tokio_tungstenite::accept_async(tcp).await?;
    let (mut write, mut read) = ws.split();
    let mut sub = hub.subscribe();
    log(
        Level::Info,
        Domain::Broadcast,
        "subscriber_joined",
        obj(&[("peer", v_str(&peer.to_string())), ("subscriber", json!(sub.id.get()))]),
    );

    let outcome: Result<()> = async {
        loop {
            tokio::select! {
                _ = stop.changed() => {
                    write.send(Message::Close(None)).await?;
                    return Ok(());
                }
                payload = sub.receiver.recv() => match payload {
                    Some(text) => write.send(Message::Text(text.to_string())).await?,
                    None => return Ok(()),
                },
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }
    }
    .await;

    hub.unsubscribe(sub.id);
    log(
        Level::Info,
        Domain::Broadcast,
        "subscriber_left",
        obj(&[("peer", v_str(&peer.to_string())), ("subscriber", json!(sub.id.get()))]),
    );
    outcome
}
