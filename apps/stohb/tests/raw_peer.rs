use std::sync::Arc;
use std::time::Duration;

use stohb_core::identity::PeerCode;
use stohb_core::protocol::{ActiveCell, AppMessage};
use stohb_core::session::{ConnectionFacade, Role};
use stohb_core::transport::{ChannelEvent, MemoryBroker, RawChannel, Transport, TransportEvent};

fn code(s: &str) -> PeerCode {
    PeerCode::parse(s).expect("valid code")
}

async fn provider(broker: &MemoryBroker, id: &str) -> ConnectionFacade {
    let facade = ConnectionFacade::builder(Role::Provider, Arc::new(broker.transport()))
        .identity(code(id))
        .greet_delay(Duration::from_millis(20))
        .build()
        .unwrap();
    facade.wait_for(|state| state.is_registered).await.unwrap();
    facade
}

async fn dial_open(transport: &dyn Transport, remote: &PeerCode) -> RawChannel {
    let mut channel = transport.dial(remote).unwrap();
    assert_eq!(channel.events.recv().await, Some(ChannelEvent::Open));
    channel
}

fn marker(row: u32) -> String {
    AppMessage::SetActiveCell(ActiveCell {
        row,
        col: 0,
        current_count: Some(0),
    })
    .encode()
    .unwrap()
}

#[test_timeout::tokio_timeout_test]
async fn unreadable_messages_do_not_disturb_the_channel() {
    let broker = MemoryBroker::new();
    let host = provider(&broker, "HOST01").await;
    let mut inbound = host.subscribe();

    let device = broker.transport();
    let mut events = device.start(&code("RAWDEV")).unwrap();
    assert!(matches!(events.recv().await, Some(TransportEvent::Open(_))));
    let channel = dial_open(&device, &code("HOST01")).await;
    host.wait_for(|state| state.open_sessions.contains(&code("RAWDEV")))
        .await
        .unwrap();

    for text in [
        r#"{"type":"CURSOR_MOVED","payload":{"x":1}}"#.to_string(),
        r#"{"type":"GREET","v":7}"#.to_string(),
        "definitely not json".to_string(),
        r#"{"type":"IMAGE_DATA"}"#.to_string(),
        r#"{"type":"GREET"}"#.to_string(),
        marker(5),
    ] {
        channel.link.send(text).unwrap();
    }

    let first = inbound.recv().await.unwrap();
    assert_eq!(first.from, code("RAWDEV"));
    assert_eq!(first.message, AppMessage::Greet);
    let second = inbound.recv().await.unwrap();
    assert_eq!(second.message, AppMessage::decode(&marker(5)).unwrap().unwrap());
    assert_eq!(host.open_sessions(), vec![code("RAWDEV")]);

    device.stop();
    host.dispose().await;
}

#[test_timeout::tokio_timeout_test]
async fn duplicate_dial_is_closed_and_first_session_survives() {
    let broker = MemoryBroker::new();
    let host = provider(&broker, "HOST02").await;
    let mut inbound = host.subscribe();

    let device = broker.transport();
    let _events = device.start(&code("TWICE1")).unwrap();
    let first = dial_open(&device, &code("HOST02")).await;
    host.wait_for(|state| state.open_sessions.contains(&code("TWICE1")))
        .await
        .unwrap();

    let mut second = dial_open(&device, &code("HOST02")).await;
    assert_eq!(second.events.recv().await, Some(ChannelEvent::Close));

    first.link.send(marker(1)).unwrap();
    let message = inbound.recv().await.unwrap();
    assert_eq!(message.from, code("TWICE1"));
    assert_eq!(message.message, AppMessage::decode(&marker(1)).unwrap().unwrap());
    assert_eq!(host.open_sessions(), vec![code("TWICE1")]);

    device.stop();
    host.dispose().await;
}
