use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use huddle_types::events::{GatewayEvent, Room};

pub type ConnectionId = Uuid;

/// Tracks live connections and the rooms each one belongs to, and fans
/// events out to room members.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    registry: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
}

struct Connection {
    user_id: Uuid,
    tx: mpsc::UnboundedSender<GatewayEvent>,
    rooms: HashSet<Room>,
}

impl Registry {
    fn insert_member(&mut self, conn_id: ConnectionId, room: Room) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        conn.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(conn_id);
        true
    }

    fn remove_member(&mut self, conn_id: ConnectionId, room: Room) {
        if let Some(members) = self.rooms.get_mut(&room) {
            members.remove(&conn_id);
            if members.is_empty() {
                self.rooms.remove(&room);
            }
        }
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a verified connection. It joins its user's personal room
    /// before any event can be routed to it.
    pub async fn register(&self, user_id: Uuid) -> (ConnectionId, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut registry = self.inner.registry.write().await;
        registry.connections.insert(
            conn_id,
            Connection {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        registry.insert_member(conn_id, Room::User(user_id));
        (conn_id, rx)
    }

    /// Drop a connection and every room membership it held.
    pub async fn unregister(&self, conn_id: ConnectionId) {
        let mut registry = self.inner.registry.write().await;
        if let Some(conn) = registry.connections.remove(&conn_id) {
            for room in conn.rooms {
                registry.remove_member(conn_id, room);
            }
        }
    }

    /// Idempotent. Returns false if the connection is gone.
    pub async fn join(&self, conn_id: ConnectionId, room: Room) -> bool {
        self.inner.registry.write().await.insert_member(conn_id, room)
    }

    pub async fn leave(&self, conn_id: ConnectionId, room: Room) {
        let mut registry = self.inner.registry.write().await;
        if let Some(conn) = registry.connections.get_mut(&conn_id) {
            conn.rooms.remove(&room);
        }
        registry.remove_member(conn_id, room);
    }

    /// Deliver `event` to every connection in `room` except `exclude`.
    /// Returns how many connections it was handed to.
    pub async fn publish(&self, room: Room, event: GatewayEvent, exclude: Option<ConnectionId>) -> usize {
        self.publish_to(&[room], event, exclude).await
    }

    /// Like [`publish`](Self::publish) across several rooms; a connection
    /// sitting in more than one of them still gets a single copy.
    pub async fn publish_to(&self, rooms: &[Room], event: GatewayEvent, exclude: Option<ConnectionId>) -> usize {
        let registry = self.inner.registry.read().await;

        let mut targets = HashSet::new();
        for room in rooms {
            if let Some(members) = registry.rooms.get(room) {
                targets.extend(members.iter().copied());
            }
        }
        if let Some(excluded) = exclude {
            targets.remove(&excluded);
        }

        let mut delivered = 0;
        for conn_id in targets {
            if let Some(conn) = registry.connections.get(&conn_id) {
                if conn.tx.send(event.clone()).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }

    /// Send a targeted event to a single connection.
    pub async fn send_to(&self, conn_id: ConnectionId, event: GatewayEvent) -> bool {
        let registry = self.inner.registry.read().await;
        registry
            .connections
            .get(&conn_id)
            .is_some_and(|conn| conn.tx.send(event).is_ok())
    }

    pub async fn rooms_of(&self, conn_id: ConnectionId) -> Vec<Room> {
        let registry = self.inner.registry.read().await;
        registry
            .connections
            .get(&conn_id)
            .map(|conn| conn.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    pub async fn room_size(&self, room: Room) -> usize {
        self.inner
            .registry
            .read()
            .await
            .rooms
            .get(&room)
            .map_or(0, HashSet::len)
    }

    /// Connections currently open for a user, across devices.
    pub async fn connections_of(&self, user_id: Uuid) -> usize {
        self.inner
            .registry
            .read()
            .await
            .connections
            .values()
            .filter(|conn| conn.user_id == user_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_types::models::DeletedMessage;

    fn deleted(chat_id: Uuid) -> GatewayEvent {
        GatewayEvent::DeletedMessage(DeletedMessage {
            id: Uuid::new_v4(),
            chat_id,
        })
    }

    #[tokio::test]
    async fn register_joins_personal_room() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (conn, _rx) = dispatcher.register(user).await;

        assert_eq!(dispatcher.rooms_of(conn).await, vec![Room::User(user)]);
        assert_eq!(dispatcher.room_size(Room::User(user)).await, 1);
    }

    #[tokio::test]
    async fn publish_skips_excluded_connection() {
        let dispatcher = Dispatcher::new();
        let chat = Uuid::new_v4();
        let (a, mut rx_a) = dispatcher.register(Uuid::new_v4()).await;
        let (b, mut rx_b) = dispatcher.register(Uuid::new_v4()).await;
        assert!(dispatcher.join(a, Room::Chat(chat)).await);
        assert!(dispatcher.join(b, Room::Chat(chat)).await);
        // Joining twice changes nothing
        assert!(dispatcher.join(b, Room::Chat(chat)).await);

        let delivered = dispatcher.publish(Room::Chat(chat), deleted(chat), Some(a)).await;
        assert_eq!(delivered, 1);
        assert!(matches!(rx_b.try_recv(), Ok(GatewayEvent::DeletedMessage(_))));
        assert!(rx_b.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn left_and_unregistered_connections_receive_nothing() {
        let dispatcher = Dispatcher::new();
        let chat = Uuid::new_v4();
        let (a, mut rx_a) = dispatcher.register(Uuid::new_v4()).await;
        let (b, _rx_b) = dispatcher.register(Uuid::new_v4()).await;
        dispatcher.join(a, Room::Chat(chat)).await;
        dispatcher.join(b, Room::Chat(chat)).await;

        dispatcher.leave(a, Room::Chat(chat)).await;
        dispatcher.unregister(b).await;

        assert_eq!(dispatcher.publish(Room::Chat(chat), deleted(chat), None).await, 0);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(dispatcher.room_size(Room::Chat(chat)).await, 0);
        assert!(!dispatcher.join(b, Room::Chat(chat)).await);
    }

    #[tokio::test]
    async fn user_room_reaches_every_device() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_, mut phone) = dispatcher.register(user).await;
        let (_, mut laptop) = dispatcher.register(user).await;
        assert_eq!(dispatcher.connections_of(user).await, 2);

        let chat = Uuid::new_v4();
        let rooms = [Room::User(user), Room::User(user)];
        assert_eq!(dispatcher.publish_to(&rooms, deleted(chat), None).await, 2);
        assert!(phone.try_recv().is_ok());
        assert!(laptop.try_recv().is_ok());
        assert!(laptop.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_keep_emission_order() {
        let dispatcher = Dispatcher::new();
        let chat = Uuid::new_v4();
        let (a, mut rx) = dispatcher.register(Uuid::new_v4()).await;
        dispatcher.join(a, Room::Chat(chat)).await;

        let ids: Vec<GatewayEvent> = (0..5).map(|_| deleted(chat)).collect();
        for event in &ids {
            dispatcher.publish(Room::Chat(chat), event.clone(), None).await;
        }
        for expected in ids {
            assert_eq!(rx.recv().await, Some(expected));
        }
    }
}
