use anyhow::{Context, Result};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::Filter;

pub type Client = Arc<Mutex<SplitSink<WebSocket, Message>>>;
pub type Rooms = Arc<Mutex<HashMap<String, HashMap<String, Client>>>>;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_IP: &str = "127.0.0.1";

/// Room-scoped relay: every text frame is copied to the other members of the
/// sender's room. It never inspects the payload.
#[derive(Clone)]
pub struct RelayServer {
    pub rooms: Rooms,
    pub port: u16,
    pub ip: String,
}

impl RelayServer {
    pub fn new(port: Option<u16>, ip: Option<String>) -> Self {
        RelayServer {
            rooms: Arc::new(Mutex::new(HashMap::new())),
            port: port.unwrap_or(DEFAULT_PORT),
            ip: ip.unwrap_or_else(|| DEFAULT_IP.to_string()),
        }
    }

    pub fn routes(
        &self,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
        warp::path("ws")
            .and(warp::path::param::<String>())
            .and(warp::path::end())
            .and(warp::ws())
            .and(with_rooms(self.rooms.clone()))
            .map(|room: String, ws: warp::ws::Ws, rooms: Rooms| {
                ws.on_upgrade(move |socket| handle_connection(socket, room, rooms))
            })
    }

    pub async fn run(&self) -> Result<()> {
        let ip_addr: IpAddr = self
            .ip
            .parse()
            .with_context(|| format!("Invalid IP address {}", self.ip))?;
        info!(
            "Signaling relay running on ws://{}:{}/ws/{{room}}",
            self.ip, self.port
        );
        warp::serve(self.routes()).run((ip_addr, self.port)).await;
        Ok(())
    }

    /// Binds without serving yet; port 0 picks a free one.
    pub fn bind(&self, addr: SocketAddr) -> Result<(SocketAddr, impl Future<Output = ()>)> {
        let (bound, server) = warp::serve(self.routes())
            .try_bind_ephemeral(addr)
            .context("Failed to bind relay")?;
        info!("Signaling relay bound to {}", bound);
        Ok((bound, server))
    }

    /// Room name to member count.
    pub async fn rooms(&self) -> HashMap<String, usize> {
        self.rooms
            .lock()
            .await
            .iter()
            .map(|(room, members)| (room.clone(), members.len()))
            .collect()
    }

    pub async fn client_count(&self, room: &str) -> usize {
        self.rooms
            .lock()
            .await
            .get(room)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub async fn clients(&self, room: &str) -> Vec<String> {
        members_of(&self.rooms, room, None)
            .await
            .into_iter()
            .map(|(id, _)| id)
            .collect()
    }

    /// Sends `message` to every member of `room`; returns how many got it.
    pub async fn broadcast(&self, room: &str, message: String) -> usize {
        let members = members_of(&self.rooms, room, None).await;
        let mut delivered = 0;
        for (client_id, client) in members {
            let mut client = client.lock().await;
            match client.send(Message::text(message.clone())).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Error broadcasting to {}: {}", client_id, e),
            }
        }
        delivered
    }

    pub async fn disconnect(&self, room: &str, client_id: &str) -> bool {
        let client = {
            let mut rooms = self.rooms.lock().await;
            let Some(members) = rooms.get_mut(room) else {
                return false;
            };
            let client = members.remove(client_id);
            if members.is_empty() {
                rooms.remove(room);
            }
            client
        };
        match client {
            Some(client) => {
                let _ = client.lock().await.close().await;
                info!("Client {} removed from room {}", client_id, room);
                true
            }
            None => false,
        }
    }
}

fn with_rooms(
    rooms: Rooms,
) -> impl Filter<Extract = (Rooms,), Error = std::convert::Infallible> + Clone {
    warp::any().map(move || rooms.clone())
}

async fn handle_connection(ws: WebSocket, room: String, rooms: Rooms) {
    let (sender, mut receiver) = ws.split();
    let sender = Arc::new(Mutex::new(sender));

    let client_id = Uuid::new_v4().to_string();
    rooms
        .lock()
        .await
        .entry(room.clone())
        .or_default()
        .insert(client_id.clone(), sender);

    info!("Client {} joined room {}", client_id, room);

    while let Some(result) = receiver.next().await {
        match result {
            Ok(msg) => {
                if let Ok(text) = msg.to_str() {
                    forward_message(&room, &client_id, text, &rooms).await;
                } else if msg.is_close() {
                    break;
                }
            }
            Err(e) => {
                warn!("Error receiving message from {}: {}", client_id, e);
                break;
            }
        }
    }

    let mut rooms = rooms.lock().await;
    if let Some(members) = rooms.get_mut(&room) {
        members.remove(&client_id);
        if members.is_empty() {
            rooms.remove(&room);
            debug!("Room {} is empty, removed", room);
        }
    }
    info!("Client {} left room {}", client_id, room);
}

async fn members_of(rooms: &Rooms, room: &str, except: Option<&str>) -> Vec<(String, Client)> {
    rooms
        .lock()
        .await
        .get(room)
        .map(|members| {
            members
                .iter()
                .filter(|(id, _)| Some(id.as_str()) != except)
                .map(|(id, client)| (id.clone(), client.clone()))
                .collect()
        })
        .unwrap_or_default()
}

async fn forward_message(room: &str, sender_id: &str, text: &str, rooms: &Rooms) {
    for (client_id, client) in members_of(rooms, room, Some(sender_id)).await {
        let mut client = client.lock().await;
        if let Err(e) = client.send(Message::text(text)).await {
            warn!("Error sending message to {}: {}", client_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_creation() {
        let server = RelayServer::new(Some(3031), Some("0.0.0.0".to_string()));
        assert_eq!(server.port, 3031);
        assert_eq!(server.ip, "0.0.0.0");
    }

    #[test]
    fn test_server_default_values() {
        let server = RelayServer::new(None, None);
        assert_eq!(server.port, 8000);
        assert_eq!(server.ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_invalid_ip_is_rejected() {
        let server = RelayServer::new(Some(0), Some("not-an-ip".to_string()));
        assert!(server.run().await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_room_queries() {
        let server = RelayServer::new(None, None);
        assert_eq!(server.client_count("nope").await, 0);
        assert_eq!(server.broadcast("nope", "x".to_string()).await, 0);
        assert!(!server.disconnect("nope", "id").await);
        assert!(server.rooms().await.is_empty());
    }
}
