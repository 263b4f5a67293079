use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use fabric_agent::agent::Agent;
use fabric_agent::config::AgentConfig;
use fabric_agent::gateway::frame::{self, OPCODE_PING, OPCODE_PONG};
use fabric_agent::message::Message as FabricMessage;
use fabric_agent::routing::{RouteTableStore, RoutingTable};
use fabric_agent::state::AppState;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type TestResult = Result<(), Box<dyn std::error::Error>>;

struct Running {
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

async fn spawn_agent(table: RoutingTable) -> Running {
    let agent = Agent::start(&AgentConfig::default(), RouteTableStore::new(table)).expect("start");
    let state = agent.state().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(agent.serve(listener, shutdown.clone()));
    Running {
        addr,
        state,
        shutdown,
        task,
    }
}

async fn connect(addr: SocketAddr, element_id: &str) -> Socket {
    let url = format!("ws://{addr}/v2/message/socket/id/{element_id}");
    let (socket, _) = connect_async(url).await.expect("connect");
    socket
}

async fn next_binary(socket: &mut Socket) -> Vec<u8> {
    loop {
        match socket.next().await.expect("stream open").expect("frame") {
            Message::Binary(data) => return data.to_vec(),
            _ => continue,
        }
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[test_timeout::tokio_timeout_test(secs = 15)]
async fn client_message_is_receipted_and_pushed_to_receiver() -> TestResult {
    let running = spawn_agent(RoutingTable::new().with_route("e1", ["e2"])).await;
    let mut receiver = connect(running.addr, "e2").await;
    let gateway = running.state.gateway().clone();
    wait_until(|| gateway.is_connected("e2")).await;
    let mut publisher = connect(running.addr, "e1").await;

    let outgoing = FabricMessage::new("ignored", &b"reading: 21.5"[..]).with_content_type("text/plain");
    publisher
        .send(Message::Binary(frame::encode_message_frame(&outgoing)?))
        .await?;

    let (receipt_id, receipt_ts) = frame::decode_receipt(&next_binary(&mut publisher).await)?;
    assert!(!receipt_id.is_empty());
    assert!(receipt_ts > 0);

    let pushed = frame::decode_message_frame(&next_binary(&mut receiver).await)?;
    assert_eq!(pushed.id, receipt_id);
    assert_eq!(pushed.publisher, "e1");
    assert_eq!(&pushed.payload[..], b"reading: 21.5");

    wait_until(|| gateway.pending_count("e2") == 1).await;
    receiver
        .send(Message::Binary(frame::encode_ack(&pushed.id)?))
        .await?;
    wait_until(|| gateway.pending_count("e2") == 0).await;

    assert_eq!(running.state.status().published_by("e1"), Some(1));
    running.stop().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 15)]
async fn binary_ping_gets_pong() -> TestResult {
    let running = spawn_agent(RoutingTable::new()).await;
    let mut socket = connect(running.addr, "e1").await;

    socket.send(Message::Binary(vec![OPCODE_PING].into())).await?;
    assert_eq!(next_binary(&mut socket).await, vec![OPCODE_PONG]);

    running.stop().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 15)]
async fn newer_connection_replaces_older_one() -> TestResult {
    let running = spawn_agent(RoutingTable::new().with_route("e1", ["e2"])).await;
    let gateway = running.state.gateway().clone();

    let mut first = connect(running.addr, "e2").await;
    wait_until(|| gateway.is_connected("e2")).await;
    let _second = connect(running.addr, "e2").await;

    loop {
        match first.next().await {
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
            Some(Ok(_)) => continue,
        }
    }
    assert!(gateway.is_connected("e2"));
    assert_eq!(gateway.session_count(), 1);
    assert_eq!(running.state.status().open_realtime_sessions(), 1);

    running.stop().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 15)]
async fn handshake_without_element_id_is_refused() -> TestResult {
    let running = spawn_agent(RoutingTable::new()).await;
    let url = format!("ws://{}/v2/message/socket/id/", running.addr);
    assert!(connect_async(url).await.is_err());
    running.stop().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 15)]
async fn closing_the_socket_disables_realtime_delivery() -> TestResult {
    let running = spawn_agent(RoutingTable::new().with_route("e1", ["e2"])).await;
    let gateway = running.state.gateway().clone();
    let bus = running.state.bus().clone();

    let mut receiver = connect(running.addr, "e2").await;
    wait_until(|| bus.get_receiver("e2").map(|r| r.is_realtime()).unwrap_or(false)).await;

    receiver.close(None).await?;
    wait_until(|| !gateway.is_connected("e2")).await;
    wait_until(|| bus.get_receiver("e2").map(|r| !r.is_realtime()).unwrap_or(false)).await;

    bus.publish(FabricMessage::new("e1", &b"buffered"[..]))?;
    let buffered = bus.get_receiver("e2").expect("receiver").get_messages(10)?;
    assert_eq!(buffered.len(), 1);

    running.stop().await;
    Ok(())
}

#[test_timeout::tokio_timeout_test(secs = 15)]
async fn session_opened_before_routing_receives_pushes_once_routed() -> TestResult {
    let running = spawn_agent(RoutingTable::new()).await;
    let gateway = running.state.gateway().clone();
    let bus = running.state.bus().clone();

    let mut receiver = connect(running.addr, "e2").await;
    wait_until(|| gateway.is_connected("e2")).await;
    assert!(bus.get_receiver("e2").is_none());

    running
        .state
        .routes()
        .replace(RoutingTable::new().with_route("e1", ["e2"]));
    bus.update();
    assert!(bus.get_receiver("e2").expect("receiver").is_realtime());

    let sent = bus.publish(FabricMessage::new("e1", &b"late route"[..]))?;
    let pushed = frame::decode_message_frame(&next_binary(&mut receiver).await)?;
    assert_eq!(pushed.id, sent.id);
    assert_eq!(&pushed.payload[..], b"late route");

    running.stop().await;
    Ok(())
}
