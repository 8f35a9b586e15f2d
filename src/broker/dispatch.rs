//! Broker state and packet dispatch, independent of sockets.
//!
//! [`BrokerCore`] owns every queue and every client session. The server loop
//! feeds it raw bytes per client and asks it, once per tick, which clients
//! must be dropped. Responses leave through each client's [`WriterHandle`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bytes::Bytes;
use subtle::ConstantTimeEq;

use crate::config::BrokerConfig;
use crate::protocol::{
    ConnectionResponse, Packet, PacketDecoder, PopError, PopResponse, PushError, PushResponse,
};
use crate::queue::{ClientId, QueueRegistry, QueueStats};
use crate::writer::WriterHandle;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

fn next_client_id() -> ClientId {
    NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The username and password every client must present.
#[derive(Clone)]
pub struct Credentials {
    username: Vec<u8>,
    password: Vec<u8>,
}

impl Credentials {
    pub fn new(username: impl Into<Vec<u8>>, password: impl Into<Vec<u8>>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Compare in constant time.
    pub fn matches(&self, username: &[u8], password: &[u8]) -> bool {
        let user_ok = self.username.as_slice().ct_eq(username);
        let pass_ok = self.password.as_slice().ct_eq(password);
        bool::from(user_ok & pass_ok)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &String::from_utf8_lossy(&self.username))
            .finish_non_exhaustive()
    }
}

struct ClientSession {
    decoder: PacketDecoder,
    writer: WriterHandle,
    authorized: bool,
}

enum Flow {
    Continue,
    Close,
}

/// Queues plus connected clients, driven by the server loop.
pub struct BrokerCore {
    credentials: Credentials,
    max_body_size: u32,
    registry: QueueRegistry,
    clients: HashMap<ClientId, ClientSession>,
    removals: HashSet<ClientId>,
}

impl BrokerCore {
    pub fn new(config: &BrokerConfig) -> Self {
        Self {
            credentials: Credentials::new(config.username.as_bytes(), config.password.as_bytes()),
            max_body_size: config.max_body_size,
            registry: QueueRegistry::new(config.max_queue_bytes),
            clients: HashMap::new(),
            removals: HashSet::new(),
        }
    }

    /// Track a new connection whose responses go to `writer`.
    pub fn register_client(&mut self, writer: WriterHandle) -> ClientId {
        let client = next_client_id();
        self.clients.insert(
            client,
            ClientSession {
                decoder: PacketDecoder::with_max_body(self.max_body_size),
                writer,
                authorized: false,
            },
        );
        client
    }

    /// Decode and dispatch every complete packet now available from `client`.
    pub fn handle_data(&mut self, client: ClientId, data: &[u8]) {
        if self.removals.contains(&client) {
            return;
        }
        let Some(session) = self.clients.get_mut(&client) else {
            return;
        };
        session.decoder.append(data);

        loop {
            let packet = match session.decoder.next_packet() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Client {} sent an invalid packet: {}", client, e);
                    mark_for_removal(&mut self.registry, &mut self.removals, client);
                    break;
                }
            };

            match dispatch(client, session, &mut self.registry, &self.credentials, packet) {
                Flow::Continue => {}
                Flow::Close => {
                    mark_for_removal(&mut self.registry, &mut self.removals, client);
                    break;
                }
            }
        }
    }

    /// The connection of `client` reached end of stream or failed.
    pub fn handle_closed(&mut self, client: ClientId) {
        if self.clients.contains_key(&client) {
            mark_for_removal(&mut self.registry, &mut self.removals, client);
        }
    }

    /// Expire timed-out waiters in every queue.
    pub fn prune(&mut self) -> usize {
        self.prune_at(Instant::now())
    }

    pub fn prune_at(&mut self, now: Instant) -> usize {
        self.registry.prune_all_at(now)
    }

    /// Drop every client marked during this tick or whose writer failed.
    ///
    /// Waiters of marked clients were already cancelled when they were
    /// marked. Returns the ids removed so the caller can stop their reader
    /// tasks.
    pub fn finish_tick(&mut self) -> Vec<ClientId> {
        let failed: Vec<ClientId> = self
            .clients
            .iter()
            .filter(|(_, session)| session.writer.is_failed())
            .map(|(client, _)| *client)
            .collect();
        for client in failed {
            mark_for_removal(&mut self.registry, &mut self.removals, client);
        }

        let removed: Vec<ClientId> = self.removals.drain().collect();
        for client in &removed {
            self.clients.remove(client);
        }
        removed
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_authorized(&self, client: ClientId) -> bool {
        self.clients
            .get(&client)
            .map_or(false, |session| session.authorized)
    }

    pub fn stats(&self) -> Vec<QueueStats> {
        self.registry.stats()
    }
}

/// Mark `client` for removal and cancel its waiters right away, so nothing
/// is handed to a connection that is going away.
fn mark_for_removal(
    registry: &mut QueueRegistry,
    removals: &mut HashSet<ClientId>,
    client: ClientId,
) {
    if !removals.insert(client) {
        return;
    }
    let cancelled = registry.cancel_requester(client);
    if cancelled > 0 {
        tracing::debug!("Cancelled {} waiters of client {}", cancelled, client);
    }
}

fn dispatch(
    client: ClientId,
    session: &mut ClientSession,
    registry: &mut QueueRegistry,
    credentials: &Credentials,
    packet: Packet,
) -> Flow {
    if !session.authorized {
        return match packet {
            Packet::ConnectionRequest(request)
                if credentials.matches(&request.username, &request.password) =>
            {
                session.authorized = true;
                tracing::debug!("Client {} authenticated", client);
                send_packet(
                    &session.writer,
                    &Packet::ConnectionResponse(ConnectionResponse { failure: None }),
                );
                Flow::Continue
            }
            Packet::ConnectionRequest(_) => {
                tracing::warn!("Client {} sent wrong credentials", client);
                Flow::Close
            }
            other => {
                tracing::warn!(
                    "Client {} sent {:?} before authenticating",
                    client,
                    other.packet_type()
                );
                Flow::Close
            }
        };
    }

    match packet {
        Packet::Push(request) => {
            let writer = session.writer.clone();
            let id = request.id;
            let timeout = request.timeout();
            registry.queue(request.queue).push(
                request.payload,
                timeout,
                client,
                Box::new(move |result| {
                    let failure = result.err();
                    send_packet(&writer, &Packet::PushResponse(PushResponse { id, failure }));
                }),
            );
        }
        Packet::TryPush(request) => {
            let accepted = registry.queue(request.queue).try_push(request.payload);
            let failure = (!accepted).then_some(PushError::QueueFull);
            send_packet(
                &session.writer,
                &Packet::PushResponse(PushResponse {
                    id: request.id,
                    failure,
                }),
            );
        }
        Packet::Pop(request) => {
            let writer = session.writer.clone();
            let id = request.id;
            let timeout = request.timeout();
            registry.queue(request.queue).pop(
                timeout,
                client,
                Box::new(move |result| {
                    send_packet(&writer, &pop_response(id, result));
                }),
            );
        }
        Packet::TryPop(request) => {
            let result = registry
                .queue(request.queue)
                .try_pop()
                .ok_or(PopError::QueueEmpty);
            send_packet(&session.writer, &pop_response(request.id, result));
        }
        Packet::Disconnect => {
            tracing::debug!("Client {} disconnected", client);
            return Flow::Close;
        }
        Packet::ConnectionRequest(_) => {
            tracing::debug!("Client {} repeated its connection request", client);
        }
        other @ (Packet::ConnectionResponse(_)
        | Packet::PushResponse(_)
        | Packet::PopResponse(_)) => {
            tracing::debug!(
                "Ignoring client-bound {:?} from client {}",
                other.packet_type(),
                client
            );
        }
    }
    Flow::Continue
}

fn pop_response(id: u64, result: Result<Bytes, PopError>) -> Packet {
    let (failure, payload) = match result {
        Ok(payload) => (None, payload),
        Err(e) => (Some(e), Bytes::new()),
    };
    Packet::PopResponse(PopResponse {
        id,
        failure,
        payload,
    })
}

/// Queue a response; any failure marks the connection for removal.
fn send_packet(writer: &WriterHandle, packet: &Packet) {
    if writer.is_failed() {
        return;
    }
    let outbound = match packet.encode() {
        Ok(outbound) => outbound,
        Err(e) => {
            tracing::error!("Failed to encode {:?}: {}", packet.packet_type(), e);
            writer.mark_failed();
            return;
        }
    };
    if let Err(e) = writer.try_send(outbound) {
        tracing::warn!("Failed to send {:?}: {}", packet.packet_type(), e);
        writer.mark_failed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        ConnectionRequest, PopRequest, PushRequest, TryPopRequest, TryPushRequest,
    };
    use crate::writer::{spawn_writer_task, WriterConfig};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct Peer {
        id: ClientId,
        stream: DuplexStream,
        decoder: PacketDecoder,
    }

    impl Peer {
        fn connect(core: &mut BrokerCore) -> Self {
            let (ours, theirs) = duplex(64 * 1024);
            let (writer, _task) = spawn_writer_task(ours, &WriterConfig::default());
            Self {
                id: core.register_client(writer),
                stream: theirs,
                decoder: PacketDecoder::new(),
            }
        }

        fn send(&self, core: &mut BrokerCore, packet: Packet) {
            core.handle_data(self.id, &packet.to_vec().unwrap());
        }

        async fn recv(&mut self) -> Option<Packet> {
            tokio::time::timeout(Duration::from_secs(2), async {
                loop {
                    if let Some(packet) = self.decoder.next_packet().unwrap() {
                        return Some(packet);
                    }
                    let mut buf = [0u8; 1024];
                    let n = self.stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return None;
                    }
                    self.decoder.append(&buf[..n]);
                }
            })
            .await
            .unwrap()
        }

        async fn login(core: &mut BrokerCore) -> Self {
            let mut peer = Self::connect(core);
            peer.send(core, login_packet(b"user", b"pass"));
            assert_eq!(
                peer.recv().await,
                Some(Packet::ConnectionResponse(ConnectionResponse { failure: None }))
            );
            peer
        }
    }

    fn core() -> BrokerCore {
        BrokerCore::new(
            &BrokerConfig::default()
                .with_credentials("user", "pass")
                .with_max_queue_bytes(1024),
        )
    }

    fn login_packet(username: &'static [u8], password: &'static [u8]) -> Packet {
        Packet::ConnectionRequest(ConnectionRequest {
            username: Bytes::from_static(username),
            password: Bytes::from_static(password),
        })
    }

    fn try_push(id: u64, len: usize) -> Packet {
        Packet::TryPush(TryPushRequest {
            queue: "jobs".into(),
            id,
            payload: Bytes::from(vec![1u8; len]),
        })
    }

    #[test]
    fn test_credentials_match() {
        let credentials = Credentials::new("user", "pass");
        assert!(credentials.matches(b"user", b"pass"));
        assert!(!credentials.matches(b"user", b"pas"));
        assert!(!credentials.matches(b"USER", b"pass"));
        assert!(!format!("{:?}", credentials).contains("pass"));
    }

    #[tokio::test]
    async fn test_successful_login() {
        let mut core = core();
        let peer = Peer::login(&mut core).await;
        assert!(core.is_authorized(peer.id));
        assert!(core.finish_tick().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_credentials_close_without_response() {
        let mut core = core();
        let mut peer = Peer::connect(&mut core);

        peer.send(&mut core, login_packet(b"user", b"nope"));
        assert_eq!(core.finish_tick(), vec![peer.id]);
        assert_eq!(core.client_count(), 0);

        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn test_request_before_login_closes() {
        let mut core = core();
        let mut peer = Peer::connect(&mut core);

        peer.send(&mut core, try_push(1, 3));
        assert_eq!(core.finish_tick(), vec![peer.id]);
        assert_eq!(peer.recv().await, None);
        assert!(core.stats().is_empty());
    }

    #[tokio::test]
    async fn test_try_push_and_try_pop() {
        let mut core = core();
        let mut peer = Peer::login(&mut core).await;

        peer.send(&mut core, try_push(1, 600));
        peer.send(&mut core, try_push(2, 500));
        peer.send(
            &mut core,
            Packet::TryPop(TryPopRequest {
                queue: "jobs".into(),
                id: 3,
            }),
        );
        peer.send(
            &mut core,
            Packet::TryPop(TryPopRequest {
                queue: "jobs".into(),
                id: 4,
            }),
        );

        assert_eq!(
            peer.recv().await,
            Some(Packet::PushResponse(PushResponse { id: 1, failure: None }))
        );
        assert_eq!(
            peer.recv().await,
            Some(Packet::PushResponse(PushResponse {
                id: 2,
                failure: Some(PushError::QueueFull)
            }))
        );
        match peer.recv().await {
            Some(Packet::PopResponse(response)) => {
                assert_eq!(response.id, 3);
                assert_eq!(response.failure, None);
                assert_eq!(response.payload.len(), 600);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            peer.recv().await,
            Some(Packet::PopResponse(PopResponse {
                id: 4,
                failure: Some(PopError::QueueEmpty),
                payload: Bytes::new(),
            }))
        );
    }

    #[tokio::test]
    async fn test_waiting_pop_served_by_other_client() {
        let mut core = core();
        let mut consumer = Peer::login(&mut core).await;
        let mut producer = Peer::login(&mut core).await;

        consumer.send(
            &mut core,
            Packet::Pop(PopRequest {
                queue: "jobs".into(),
                id: 10,
                timeout_millis: 0,
            }),
        );
        producer.send(
            &mut core,
            Packet::Push(PushRequest {
                queue: "jobs".into(),
                id: 20,
                payload: Bytes::from_static(b"work"),
                timeout_millis: 0,
            }),
        );

        assert_eq!(
            consumer.recv().await,
            Some(Packet::PopResponse(PopResponse {
                id: 10,
                failure: None,
                payload: Bytes::from_static(b"work"),
            }))
        );
        assert_eq!(
            producer.recv().await,
            Some(Packet::PushResponse(PushResponse { id: 20, failure: None }))
        );
    }

    #[tokio::test]
    async fn test_prune_sends_timeout() {
        let mut core = core();
        let mut peer = Peer::login(&mut core).await;

        peer.send(
            &mut core,
            Packet::Pop(PopRequest {
                queue: "jobs".into(),
                id: 5,
                timeout_millis: 10,
            }),
        );
        assert_eq!(core.prune_at(Instant::now() + Duration::from_secs(1)), 1);

        assert_eq!(
            peer.recv().await,
            Some(Packet::PopResponse(PopResponse {
                id: 5,
                failure: Some(PopError::Timeout),
                payload: Bytes::new(),
            }))
        );
    }

    #[tokio::test]
    async fn test_disconnect_cancels_waiters() {
        let mut core = core();
        let consumer = Peer::login(&mut core).await;
        let mut producer = Peer::login(&mut core).await;

        consumer.send(
            &mut core,
            Packet::Pop(PopRequest {
                queue: "jobs".into(),
                id: 1,
                timeout_millis: 0,
            }),
        );
        consumer.send(&mut core, Packet::Disconnect);
        assert_eq!(core.finish_tick(), vec![consumer.id]);
        assert_eq!(core.stats()[0].waiting_poppers, 0);

        producer.send(&mut core, try_push(2, 4));
        assert_eq!(
            producer.recv().await,
            Some(Packet::PushResponse(PushResponse { id: 2, failure: None }))
        );
        assert_eq!(core.stats()[0].buffered, 1);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_waiters_within_the_tick() {
        let mut core = core();
        let consumer = Peer::login(&mut core).await;
        let mut producer = Peer::login(&mut core).await;

        consumer.send(
            &mut core,
            Packet::Pop(PopRequest {
                queue: "jobs".into(),
                id: 1,
                timeout_millis: 0,
            }),
        );
        consumer.send(&mut core, Packet::Disconnect);
        producer.send(&mut core, try_push(2, 4));

        assert_eq!(core.stats()[0].waiting_poppers, 0);
        assert_eq!(core.stats()[0].buffered, 1);
        assert_eq!(core.finish_tick(), vec![consumer.id]);
        assert_eq!(
            producer.recv().await,
            Some(Packet::PushResponse(PushResponse { id: 2, failure: None }))
        );
        assert_eq!(core.stats()[0].buffered, 1);
    }

    #[tokio::test]
    async fn test_closed_event_cancels_waiters_within_the_tick() {
        let mut core = core();
        let consumer = Peer::login(&mut core).await;
        let producer = Peer::login(&mut core).await;

        consumer.send(
            &mut core,
            Packet::Pop(PopRequest {
                queue: "jobs".into(),
                id: 1,
                timeout_millis: 0,
            }),
        );
        core.handle_closed(consumer.id);
        producer.send(&mut core, try_push(2, 4));

        assert_eq!(core.stats()[0].buffered, 1);
        assert_eq!(core.finish_tick(), vec![consumer.id]);
    }

    #[tokio::test]
    async fn test_closed_connection_is_removed() {
        let mut core = core();
        let peer = Peer::login(&mut core).await;

        core.handle_closed(peer.id);
        core.handle_closed(999_999);
        assert_eq!(core.finish_tick(), vec![peer.id]);
        assert!(!core.is_authorized(peer.id));
    }

    #[tokio::test]
    async fn test_garbage_closes_connection() {
        let mut core = core();
        let peer = Peer::login(&mut core).await;

        core.handle_data(peer.id, &[0xFF, 0, 0, 0, 0]);
        assert_eq!(core.finish_tick(), vec![peer.id]);
    }

    #[tokio::test]
    async fn test_data_after_removal_mark_is_ignored() {
        let mut core = core();
        let peer = Peer::login(&mut core).await;

        peer.send(&mut core, Packet::Disconnect);
        peer.send(&mut core, try_push(1, 4));
        core.finish_tick();

        assert!(core.stats().is_empty());
    }

    #[tokio::test]
    async fn test_client_bound_packets_are_ignored() {
        let mut core = core();
        let mut peer = Peer::login(&mut core).await;

        peer.send(
            &mut core,
            Packet::PushResponse(PushResponse { id: 1, failure: None }),
        );
        peer.send(&mut core, try_push(2, 1));

        assert!(core.finish_tick().is_empty());
        assert_eq!(
            peer.recv().await,
            Some(Packet::PushResponse(PushResponse { id: 2, failure: None }))
        );
    }
}
