use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use tankfall_core::net::messages::{ClientMessage, JoinMsg, JoinResponseMsg, ServerMessage};
use tankfall_core::net::protocol::{PROTOCOL_VERSION, decode_server_message, encode_client_message};

use tankfall_server::config::{MatchConfig, ServerConfig, SideChannelConfig};
use tankfall_server::coordinator::MatchOutcome;
use tankfall_server::run_match;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    pub base_port: u16,
    pub shutdown: CancellationToken,
    pub task: tokio::task::JoinHandle<std::io::Result<Option<MatchOutcome>>>,
}

impl TestServer {
    /// Start a one-round match with short delays.
    pub async fn new() -> Self {
        Self::with_rounds(1).await
    }

    pub async fn with_rounds(num_rounds_to_win: u32) -> Self {
        let base_port = rand::rng().random_range(20000..60000);
        let config = ServerConfig {
            match_rules: MatchConfig {
                num_rounds_to_win,
                start_delay_secs: 0.2,
                end_delay_secs: 0.2,
                tick_rate_hz: 50,
                ..MatchConfig::default()
            },
            side_channel: SideChannelConfig {
                base_port,
                accept_timeout_ms: 50,
                ..SideChannelConfig::default()
            },
            ..ServerConfig::default()
        };
        Self::from_config(config).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let base_port = config.side_channel.base_port;
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(run_match(
            listener,
            config,
            Arc::from("127.0.0.1"),
            shutdown.clone(),
        ));

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            base_port,
            shutdown,
            task,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Wait for `run_match` to return.
    pub async fn finish(self) -> Option<MatchOutcome> {
        tokio::time::timeout(Duration::from_secs(10), self.task)
            .await
            .expect("match did not end")
            .unwrap()
            .unwrap()
    }
}

pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

pub async fn ws_send_client_msg(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Binary(encoded.into())).await.unwrap();
}

/// Send a Join and return the JoinResponse.
pub async fn ws_join(stream: &mut WsStream, name: &str) -> JoinResponseMsg {
    ws_join_with_version(stream, name, PROTOCOL_VERSION).await
}

pub async fn ws_join_with_version(
    stream: &mut WsStream,
    name: &str,
    protocol_version: u8,
) -> JoinResponseMsg {
    let msg = ClientMessage::Join(JoinMsg {
        display_name: name.to_string(),
        protocol_version,
    });
    ws_send_client_msg(stream, &msg).await;
    match ws_read_server_msg(stream).await {
        ServerMessage::JoinResponse(join) => join,
        other => panic!("Expected JoinResponse, got: {other:?}"),
    }
}

/// Connect and join, returning the stream and assigned id.
pub async fn connect_and_join(server: &TestServer, name: &str) -> (WsStream, u64) {
    let mut ws = ws_connect(&server.ws_url()).await;
    let resp = ws_join(&mut ws, name).await;
    assert!(resp.success, "Expected successful join: {resp:?}");
    (ws, resp.participant_id.unwrap())
}

/// Read raw binary data from a WebSocket stream (5s timeout).
pub async fn ws_read_raw(stream: &mut WsStream) -> Vec<u8> {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let data = ws_read_raw(stream).await;
    decode_server_message(&data).unwrap()
}

/// Read messages until one matches, returning everything read on the way.
pub async fn ws_read_until(
    stream: &mut WsStream,
    pred: impl Fn(&ServerMessage) -> bool,
) -> Vec<ServerMessage> {
    let mut seen = Vec::new();
    loop {
        let msg = ws_read_server_msg(stream).await;
        let done = pred(&msg);
        seen.push(msg);
        if done {
            return seen;
        }
    }
}

/// True once the server has closed the socket (or it errored) within 5s.
pub async fn ws_expect_closed(stream: &mut WsStream) -> bool {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return true,
                _ => continue,
            }
        }
    })
    .await
    .unwrap_or(false)
}
