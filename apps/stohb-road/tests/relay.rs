use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use stohb_core::identity::PeerCode;
use stohb_core::protocol::signaling::{ClientMessage, RegisterRejection, ServerMessage};
use stohb_core::protocol::{AppMessage, CellRef};
use stohb_core::session::{
    ConnectionErrorKind, ConnectionFacade, InboundMessage, Role, SignalingStatus, Subscription,
};
use stohb_core::transport::RelayTransport;
use stohb_road::{config::Config, serve, websocket::SignalingState};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

fn code(s: &str) -> PeerCode {
    PeerCode::parse(s).expect("valid code")
}

async fn start_broker() -> (SocketAddr, SignalingState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = SignalingState::new(&Config::default());
    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = serve(listener, server_state).await;
    });
    (addr, state)
}

struct RawClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl RawClient {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        Self { ws }
    }

    async fn send(&mut self, message: ClientMessage) {
        let text = serde_json::to_string(&message).unwrap();
        self.ws.send(Message::Text(text)).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        loop {
            match self.ws.next().await.expect("socket open").unwrap() {
                Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                _ => continue,
            }
        }
    }

    async fn register(addr: SocketAddr, id: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(ClientMessage::Register { peer_id: code(id) }).await;
        assert_eq!(
            client.recv().await,
            ServerMessage::Registered { peer_id: code(id) }
        );
        client
    }
}

#[test_timeout::tokio_timeout_test]
async fn broker_relays_between_registered_codes() {
    let (addr, state) = start_broker().await;
    let mut a = RawClient::register(addr, "7F3K2Q").await;
    let mut b = RawClient::register(addr, "B0B0B0").await;

    let mut c = RawClient::connect(addr).await;
    c.send(ClientMessage::Register {
        peer_id: code("7F3K2Q"),
    })
    .await;
    assert_eq!(
        c.recv().await,
        ServerMessage::RegisterError {
            reason: RegisterRejection::IdTaken
        }
    );

    b.send(ClientMessage::Offer {
        to_peer: code("NOBODY"),
        connection_id: "c0".into(),
    })
    .await;
    assert_eq!(
        b.recv().await,
        ServerMessage::PeerUnavailable {
            peer_id: code("NOBODY"),
            connection_id: "c0".into()
        }
    );

    b.send(ClientMessage::Offer {
        to_peer: code("7F3K2Q"),
        connection_id: "c1".into(),
    })
    .await;
    assert_eq!(
        a.recv().await,
        ServerMessage::Offer {
            from_peer: code("B0B0B0"),
            connection_id: "c1".into()
        }
    );
    a.send(ClientMessage::Answer {
        to_peer: code("B0B0B0"),
        connection_id: "c1".into(),
    })
    .await;
    assert_eq!(
        b.recv().await,
        ServerMessage::Answer {
            from_peer: code("7F3K2Q"),
            connection_id: "c1".into()
        }
    );

    b.send(ClientMessage::Data {
        to_peer: code("7F3K2Q"),
        connection_id: "c1".into(),
        payload: r#"{"type":"GREET","v":1}"#.into(),
    })
    .await;
    assert_eq!(
        a.recv().await,
        ServerMessage::Data {
            from_peer: code("B0B0B0"),
            connection_id: "c1".into(),
            payload: r#"{"type":"GREET","v":1}"#.into()
        }
    );

    a.ws.close(None).await.unwrap();
    assert_eq!(
        b.recv().await,
        ServerMessage::Close {
            from_peer: code("7F3K2Q"),
            connection_id: "c1".into()
        }
    );
    assert!(!state.is_registered(&code("7F3K2Q")));
    assert_eq!(state.peer_codes(), vec![code("B0B0B0")]);
}

fn relay_facade(addr: SocketAddr, role: Role, id: &str) -> ConnectionFacade {
    let transport = RelayTransport::new(&format!("http://{addr}"), Duration::from_secs(30)).unwrap();
    ConnectionFacade::builder(role, Arc::new(transport))
        .identity(code(id))
        .greet_delay(Duration::from_millis(20))
        .build()
        .unwrap()
}

async fn next(inbound: &mut Subscription) -> InboundMessage {
    inbound.recv().await.expect("inbound message")
}

#[test_timeout::tokio_timeout_test]
async fn facades_pair_and_exchange_photos_through_the_broker() {
    let (addr, state) = start_broker().await;
    let tab_a = relay_facade(addr, Role::Provider, "7F3K2Q");
    let tab_b = relay_facade(addr, Role::Receiver, "PHONE1");
    let mut a_inbound = tab_a.subscribe();
    let mut b_inbound = tab_b.subscribe();
    tab_a.wait_for(|state| state.is_registered).await.unwrap();
    tab_b.wait_for(|state| state.is_registered).await.unwrap();

    tab_b.connect("7f3k2q").await.unwrap();
    let a_state = tab_a
        .wait_for(|state| !state.open_sessions.is_empty())
        .await
        .unwrap();
    assert_eq!(a_state.open_sessions, vec![code("PHONE1")]);

    let greet = next(&mut a_inbound).await;
    assert_eq!(greet.from, code("PHONE1"));
    assert_eq!(greet.message, AppMessage::Greet);

    let assign = AppMessage::assign(CellRef::new(2, 0), 0);
    tab_a
        .send(assign.clone(), Some(code("PHONE1")))
        .await
        .unwrap();
    let inbound = next(&mut b_inbound).await;
    assert_eq!(inbound.from, code("7F3K2Q"));
    assert_eq!(inbound.message, assign);

    let uri = format!("data:image/jpeg;base64,{}", "/9j/4AAQSkZJRgABAQ+=".repeat(20_000));
    tab_b
        .send(AppMessage::image(CellRef::new(2, 0), uri.clone()), None)
        .await
        .unwrap();
    match next(&mut a_inbound).await.message {
        AppMessage::ImageData(payload) => {
            assert_eq!(payload.cell(), CellRef::new(2, 0));
            assert_eq!(payload.image, uri);
        }
        other => panic!("unexpected message: {other:?}"),
    }

    tab_b.dispose().await;
    tab_a
        .wait_for(|state| state.open_sessions.is_empty())
        .await
        .unwrap();
    tab_a.dispose().await;
    assert_eq!(state.link_count(), 0);
}

#[test_timeout::tokio_timeout_test]
async fn unknown_code_over_the_broker_reports_device_not_found() {
    let (addr, _state) = start_broker().await;
    let receiver = relay_facade(addr, Role::Receiver, "LONELY");
    receiver.wait_for(|state| state.is_registered).await.unwrap();

    receiver.connect("NOBODY").await.unwrap();
    let state = receiver
        .wait_for(|state| state.last_error.is_some())
        .await
        .unwrap();
    let err = state.last_error.unwrap();
    assert_eq!(err.kind, ConnectionErrorKind::PeerUnreachable);
    assert_eq!(err.reason, "Device not found. Check the code.");
    assert!(state.open_sessions.is_empty());

    receiver.dispose().await;
}

#[test_timeout::tokio_timeout_test]
async fn taken_code_fails_registration_over_the_broker() {
    let (addr, _state) = start_broker().await;
    let first = relay_facade(addr, Role::Provider, "SAME01");
    first.wait_for(|state| state.is_registered).await.unwrap();

    let second = relay_facade(addr, Role::Provider, "SAME01");
    let state = second
        .wait_for(|state| state.signaling == SignalingStatus::Failed)
        .await
        .unwrap();
    assert!(!state.is_registered);
    assert!(state.last_error.is_some());

    second.dispose().await;
    first.dispose().await;
}
