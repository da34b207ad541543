//! Full stack on a loopback port: REST store, gateway, and two client runners.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use courier_api::middleware::create_token;
use courier_client::{
    ClientConfig, EntryKey, Exit, HttpStore, SessionRunner, UiEvent, UserAction,
};
use courier_db::Database;
use courier_gateway::{Broker, Channel, ConnectionId};
use courier_server::{app_state, build_router};
use courier_types::api::{AdminActionResponse, Draft};
use courier_types::events::ControlSignal;
use courier_types::models::Role;
use courier_types::{ConversationId, ParticipantId};

const SECRET: &str = "end-to-end-secret";

fn pid(s: &str) -> ParticipantId {
    ParticipantId::new(s).unwrap()
}

struct Server {
    addr: SocketAddr,
    http: String,
    gateway: String,
    broker: Broker,
}

async fn start_server() -> Server {
    let db = Database::open_in_memory().unwrap();
    db.create_user(&pid("U1"), "Uma", Role::User).unwrap();
    db.create_user(&pid("U2"), "Ugo", Role::User).unwrap();
    db.create_user(&pid("Root"), "Root", Role::Admin).unwrap();

    let state = app_state(db, SECRET.into());
    let broker = state.broker.clone();
    let app = build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    Server {
        addr,
        http: format!("http://{addr}"),
        gateway: format!("ws://{addr}/gateway"),
        broker,
    }
}

impl Server {
    /// Connections of `id` that are members of `channel`.
    async fn members(&self, channel: Channel, id: &str) -> HashSet<ConnectionId> {
        let registry = self.broker.registry();
        let mut found = HashSet::new();
        for conn in registry.members_of(&channel).await {
            if registry.identity_of(conn).await.is_some_and(|(who, _)| who == pid(id)) {
                found.insert(conn);
            }
        }
        found
    }

    /// Poll until `id`'s memberships in `channel` satisfy `done`.
    async fn wait_members(
        &self,
        channel: Channel,
        id: &str,
        done: impl Fn(&HashSet<ConnectionId>) -> bool,
    ) -> HashSet<ConnectionId> {
        timeout(Duration::from_secs(10), async {
            loop {
                let members = self.members(channel.clone(), id).await;
                if done(&members) {
                    return members;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("timed out waiting for channel membership")
    }
}

/// TCP forwarder in front of the gateway whose live sockets can be cut.
struct Relay {
    url: String,
    live: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Relay {
    async fn start(upstream: SocketAddr) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let live: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::default();
        let tracked = live.clone();
        tokio::spawn(async move {
            while let Ok((mut inbound, _)) = listener.accept().await {
                let forward = tokio::spawn(async move {
                    if let Ok(mut outbound) = TcpStream::connect(upstream).await {
                        let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
                    }
                });
                tracked.lock().unwrap().push(forward);
            }
        });
        Self {
            url: format!("ws://{addr}/gateway"),
            live,
        }
    }

    /// Drop every forwarded connection. New connections are still accepted.
    fn cut(&self) {
        for forward in self.live.lock().unwrap().drain(..) {
            forward.abort();
        }
    }
}

struct Client {
    actions: mpsc::UnboundedSender<UserAction>,
    events: mpsc::UnboundedReceiver<UiEvent>,
    runner: JoinHandle<Exit>,
}

impl Client {
    fn start(server: &Server, id: &str, name: &str) -> Self {
        Self::start_via(server, &server.gateway, id, name)
    }

    fn start_via(server: &Server, gateway: &str, id: &str, name: &str) -> Self {
        let token = create_token(SECRET, &pid(id), name, Role::User).unwrap();
        let store = HttpStore::new(&server.http, token);
        let mut config = ClientConfig::new(gateway, pid(id), name);
        config.reconnect_initial_delay = Duration::from_millis(100);
        config.reconnect_max_delay = Duration::from_millis(500);

        let (ui_tx, events) = mpsc::unbounded_channel();
        let (actions, action_rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(SessionRunner::new(config, store, ui_tx).run(action_rx));
        Self {
            actions,
            events,
            runner,
        }
    }

    fn act(&self, action: UserAction) {
        self.actions.send(action).unwrap();
    }

    async fn wait_for(&mut self, wanted: impl Fn(&UiEvent) -> bool) -> UiEvent {
        timeout(Duration::from_secs(10), async {
            loop {
                match self.events.recv().await {
                    Some(event) if wanted(&event) => return event,
                    Some(_) => continue,
                    None => panic!("runner stopped before the expected event"),
                }
            }
        })
        .await
        .expect("timed out waiting for client event")
    }

    /// Identified and holding the initial conversation list, in either order.
    async fn connected(&mut self) {
        let (mut ready, mut listed) = (false, false);
        while !(ready && listed) {
            match self
                .wait_for(|e| matches!(e, UiEvent::Ready { .. } | UiEvent::ConversationsUpdated))
                .await
            {
                UiEvent::Ready { .. } => ready = true,
                _ => listed = true,
            }
        }
    }

    async fn exit(self) -> Exit {
        timeout(Duration::from_secs(10), self.runner)
            .await
            .expect("runner did not stop")
            .unwrap()
    }
}

#[tokio::test]
async fn first_message_delivery_and_forced_logout() {
    let server = start_server().await;
    let mut u1 = Client::start(&server, "U1", "Uma");
    let mut u2 = Client::start(&server, "U2", "Ugo");
    u1.connected().await;
    u2.connected().await;

    u1.act(UserAction::OpenPeer {
        peer: pid("U2"),
        name: "Ugo".into(),
    });
    u1.act(UserAction::Send(Draft::text("hi")));
    let UiEvent::MessageSent(sent_id) = u1
        .wait_for(|e| matches!(e, UiEvent::MessageSent(_)))
        .await
    else {
        unreachable!()
    };

    let notified = u2
        .wait_for(|e| matches!(e, UiEvent::Notified { .. }))
        .await;
    assert_eq!(
        notified,
        UiEvent::Notified {
            message_id: sent_id.clone(),
            sender_name: "Uma".into(),
            preview: "hi".into(),
        }
    );

    let admin_token = create_token(SECRET, &pid("Root"), "Root", Role::Admin).unwrap();
    let response = reqwest::Client::new()
        .post(format!("{}/admin/users/U2/force-logout", server.http))
        .bearer_auth(admin_token)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let report: AdminActionResponse = response.json().await.unwrap();
    assert_eq!(report.connections, 1);

    match u2.exit().await {
        Exit::Terminated(termination) => {
            assert!(matches!(termination.signal, ControlSignal::ForceLogout { .. }));
            assert!(termination.session.is_terminated());
            assert!(termination.session.conversations().is_empty());
        }
        other => panic!("expected termination, got {other:?}"),
    }

    u1.act(UserAction::Quit);
    let Exit::Closed(session) = u1.exit().await else {
        panic!("expected a clean close");
    };
    let expected = ConversationId::parse("U1-U2").unwrap();
    assert_eq!(session.conversations().len(), 1);
    assert_eq!(
        session.conversations().entries()[0].key,
        EntryKey::Canonical(expected.clone())
    );
    assert_eq!(session.open().conversation_id(), Some(&expected));
    assert_eq!(session.messages().len(), 1);
    assert_eq!(session.messages()[0].message, "hi");
    assert_eq!(session.messages()[0].id(), Some(&sent_id));
}

#[tokio::test]
async fn send_to_suspended_peer_fails_without_reaching_the_gateway() {
    let server = start_server().await;
    let admin_token = create_token(SECRET, &pid("Root"), "Root", Role::Admin).unwrap();
    let response = reqwest::Client::new()
        .post(format!("{}/admin/users/U2/suspend", server.http))
        .bearer_auth(admin_token)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let mut u1 = Client::start(&server, "U1", "Uma");
    u1.connected().await;
    u1.act(UserAction::OpenPeer {
        peer: pid("U2"),
        name: "Ugo".into(),
    });
    u1.act(UserAction::Send(Draft::text("anyone there?")));
    let failed = u1
        .wait_for(|e| matches!(e, UiEvent::SendFailed { .. }))
        .await;
    assert!(matches!(
        failed,
        UiEvent::SendFailed {
            error: courier_types::api::StoreError::Unauthorized(_),
            ..
        }
    ));

    u1.act(UserAction::Quit);
    let Exit::Closed(session) = u1.exit().await else {
        panic!("expected a clean close");
    };
    assert!(session.messages().is_empty());
    assert_eq!(
        session.conversations().entries()[0].key,
        EntryKey::Provisional(pid("U2"))
    );
}

#[tokio::test]
async fn reconnect_reidentifies_rejoins_and_keeps_receiving() {
    let server = start_server().await;
    let relay = Relay::start(server.addr).await;
    let mut u1 = Client::start_via(&server, &relay.url, "U1", "Uma");
    let mut u2 = Client::start(&server, "U2", "Ugo");
    u1.connected().await;
    u2.connected().await;

    u1.act(UserAction::OpenPeer {
        peer: pid("U2"),
        name: "Ugo".into(),
    });
    u1.act(UserAction::Send(Draft::text("hi")));
    u1.wait_for(|e| matches!(e, UiEvent::MessageSent(_))).await;
    u2.wait_for(|e| matches!(e, UiEvent::Notified { .. })).await;

    let room = Channel::Conversation(ConversationId::parse("U1-U2").unwrap());
    let before = server.wait_members(room.clone(), "U1", |m| m.len() == 1).await;

    relay.cut();
    u1.wait_for(|e| matches!(e, UiEvent::Reconnecting { .. })).await;
    u1.connected().await;

    let after = server
        .wait_members(room, "U1", |m| m.len() == 1 && m.is_disjoint(&before))
        .await;
    let identity = server.members(Channel::Identity(pid("U1")), "U1").await;
    assert_eq!(identity, after);

    u2.act(UserAction::OpenConversation(ConversationId::parse("U1-U2").unwrap()));
    u2.act(UserAction::Send(Draft::text("still there?")));
    let notified = u1
        .wait_for(|e| matches!(e, UiEvent::Notified { .. }))
        .await;
    let UiEvent::Notified { preview, .. } = notified else {
        unreachable!()
    };
    assert_eq!(preview, "still there?");

    u1.act(UserAction::Quit);
    let Exit::Closed(session) = u1.exit().await else {
        panic!("expected a clean close");
    };
    assert_eq!(session.conversations().len(), 1);
    let bodies: Vec<&str> = session.messages().iter().map(|m| m.message.as_str()).collect();
    assert_eq!(bodies, ["hi", "still there?"]);
}
