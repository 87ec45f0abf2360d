//! # Status Feed
//!
//! **INTERNAL USE ONLY**: This crate exists solely to stand in for a SoundDrop node in the
//! integration tests of `dropwatch-core`. It is not intended for production use.
//!
//! It serves a protobuf.js JSON schema at `/messages` and plays a fixed list of binary frames
//! to every client of `/ws`, then closes the socket.
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{net::TcpListener, task::JoinHandle};

/// What the fake node serves.
#[derive(Debug, Clone, Default)]
pub struct FeedScript {
    /// Schema body. `None` makes `/messages` answer `500`.
    pub schema: Option<serde_json::Value>,
    /// Delay before `/messages` answers.
    pub schema_delay: Duration,
    /// Frames sent, in order, to each socket client.
    pub frames: Vec<Vec<u8>>,
}

#[derive(Debug)]
struct Feed {
    script: FeedScript,
    connections: AtomicUsize,
}

/// A running fake node. Stops when dropped.
#[derive(Debug)]
pub struct StatusFeed {
    addr: SocketAddr,
    feed: Arc<Feed>,
    server: JoinHandle<()>,
}

impl StatusFeed {
    /// Starts serving `script` on an ephemeral local port.
    pub async fn spawn(script: FeedScript) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let feed = Arc::new(Feed {
            script,
            connections: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/messages", get(serve_schema))
            .route("/ws", get(serve_socket))
            .with_state(Arc::clone(&feed));

        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "status feed stopped");
            }
        });

        Ok(Self { addr, feed, server })
    }

    /// `host:port` of the feed.
    pub fn host(&self) -> String {
        self.addr.to_string()
    }

    /// How many socket connections have been accepted so far.
    pub fn connections(&self) -> usize {
        self.feed.connections.load(Ordering::SeqCst)
    }
}

impl Drop for StatusFeed {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Builds a frame from a tag byte and an encoded payload.
pub fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(tag);
    frame.extend_from_slice(payload);
    frame
}

async fn serve_schema(State(feed): State<Arc<Feed>>) -> Response {
    tokio::time::sleep(feed.script.schema_delay).await;

    match &feed.script.schema {
        Some(schema) => Json(schema.clone()).into_response(),
        None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn serve_socket(
    ws: WebSocketUpgrade,
    State(feed): State<Arc<Feed>>,
) -> impl IntoResponse {
    feed.connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(move |socket| play(socket, feed))
}

async fn play(mut socket: WebSocket, feed: Arc<Feed>) {
    for frame in &feed.script.frames {
        if socket
            .send(Message::Binary(frame.clone().into()))
            .await
            .is_err()
        {
            return;
        }
    }

    if socket.send(Message::Close(None)).await.is_err() {
        return;
    }

    // Wait for the client to answer the close frame
    while let Some(Ok(_)) = socket.recv().await {}
}
