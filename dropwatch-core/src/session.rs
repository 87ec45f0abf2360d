//! # Status Session
//!
//! A session is one WebSocket connection to a node's status feed. It ties together the two
//! asynchronous events the feed depends on:
//!
//! 1. **Schema load**: runs as its own task, started before the socket is opened.
//! 2. **Socket messages**: binary frames, read one at a time.
//!
//! Frames that arrive before the schema is ready are held in a bounded backlog and decoded,
//! oldest first, as soon as it is. When the backlog is full, further early frames are logged
//! and skipped. Decode failures only affect the frame at hand.
//!
//! The session ends when the socket closes. It is never reopened.
mod backlog;

use crate::{
    frame::{DEVICE_STATUS_MESSAGE, DecodedFrame, FrameDecoder},
    schema::{LoadError, SchemaError, SchemaLoader, SchemaRegistry, SchemaSource},
};
use backlog::Backlog;
use futures_util::{Stream, StreamExt};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message, error::ProtocolError},
};
use tracing::{debug, info, trace, warn};

/// Node address used when nothing else is configured.
pub const DEFAULT_HOST: &str = "localhost:8080";
/// Path of the status socket on the node.
pub const DEFAULT_SOCKET_PATH: &str = "/ws";
/// Frames held back while the schema is loading.
pub const DEFAULT_BACKLOG: usize = 64;

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to load schema: {0}")]
    Load(#[from] LoadError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("Failed to connect to '{url}': '{source}'")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("Socket failed: '{0}'")]
    Socket(#[source] tungstenite::Error),
    #[error("Schema loading task failed: '{0}'")]
    SchemaTask(#[from] tokio::task::JoinError),
}

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Node address, `host:port`.
    pub host: String,
    /// Where the schema comes from.
    pub schema: SchemaSource,
    /// Path of the status socket on `host`.
    pub socket_path: String,
    /// Fully qualified name of the message carried by each frame.
    pub message: String,
    /// How many frames may wait for the schema.
    pub backlog: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            schema: SchemaSource::default(),
            socket_path: DEFAULT_SOCKET_PATH.to_string(),
            message: DEVICE_STATUS_MESSAGE.to_string(),
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl SessionConfig {
    /// The `ws://` URL of the status socket.
    pub fn socket_url(&self) -> String {
        crate::endpoint("ws", &self.host, &self.socket_path)
    }
}

/// Frame counters reported when a session ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Frames decoded and handed to the sink.
    pub decoded: usize,
    /// Frames that failed to decode.
    pub rejected: usize,
    /// Frames dropped because they arrived before the schema with a full backlog.
    pub skipped: usize,
}

/// Receives every decoded frame.
pub trait FrameSink {
    fn accept(&mut self, frame: DecodedFrame);
}

impl<F> FrameSink for F
where
    F: FnMut(DecodedFrame),
{
    fn accept(&mut self, frame: DecodedFrame) {
        self(frame)
    }
}

/// Watches the status feed described by `config` until the socket closes.
///
/// The schema load is started first and runs concurrently with the socket handshake.
///
/// # Returns
///
/// * `Ok(SessionSummary)` - The socket closed, counters of what was seen.
/// * `Err(SessionError)` - The schema could not be loaded, the socket could not be opened,
///   or it failed mid-session.
pub async fn watch<K>(config: &SessionConfig, sink: &mut K) -> Result<SessionSummary, SessionError>
where
    K: FrameSink,
{
    let loader = SchemaLoader::new(config.host.clone(), config.schema.clone());
    let schema_task = SchemaTask(tokio::spawn(async move { loader.load().await }));

    let url = config.socket_url();
    info!(%url, "connecting");

    let socket = match connect_async(url.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(source) => return Err(SessionError::Connect { url, source }),
    };

    info!(%url, "socket opened");

    drive(socket, schema_task.join(), &config.message, config.backlog, sink).await
}

/// The spawned schema load. Dropping it cancels the load.
struct SchemaTask(JoinHandle<Result<SchemaRegistry, LoadError>>);

impl SchemaTask {
    async fn join(mut self) -> Result<SchemaRegistry, SessionError> {
        Ok((&mut self.0).await??)
    }
}

impl Drop for SchemaTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Runs the frame loop over an already open socket.
///
/// `socket` yields socket messages and `schema` resolves once the registry is loaded. Frames
/// are decoded as `message_type`, holding at most `backlog` frames until `schema` resolves.
pub async fn drive<St, F, K>(
    mut socket: St,
    schema: F,
    message_type: &str,
    backlog: usize,
    sink: &mut K,
) -> Result<SessionSummary, SessionError>
where
    St: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    F: Future<Output = Result<SchemaRegistry, SessionError>>,
    K: FrameSink,
{
    tokio::pin!(schema);

    let mut decoder: Option<FrameDecoder> = None;
    let mut backlog = Backlog::new(backlog);
    let mut summary = SessionSummary::default();

    loop {
        tokio::select! {
            biased;

            registry = &mut schema, if decoder.is_none() => {
                let ready = ready_decoder(registry?, message_type)?;
                deliver_backlog(&ready, &mut backlog, sink, &mut summary);
                decoder = Some(ready);
            }

            next = socket.next() => {
                let message = match next {
                    Some(Ok(message)) => message,
                    None
                    | Some(Err(tungstenite::Error::ConnectionClosed))
                    | Some(Err(tungstenite::Error::AlreadyClosed)) => {
                        info!("socket closed");
                        break;
                    }
                    Some(Err(tungstenite::Error::Protocol(
                        ProtocolError::ResetWithoutClosingHandshake,
                    ))) => {
                        warn!("socket reset without closing handshake");
                        break;
                    }
                    Some(Err(err)) => return Err(SessionError::Socket(err)),
                };

                match message {
                    Message::Binary(data) => match &decoder {
                        Some(decoder) => deliver(decoder, &data, sink, &mut summary),
                        None => hold(&mut backlog, data.to_vec(), &mut summary),
                    },
                    Message::Text(text) => warn!(len = text.len(), "ignoring text frame"),
                    Message::Close(frame) => info!(?frame, "socket closing"),
                    other => trace!(?other, "control frame"),
                }
            }
        }
    }

    // The socket may close before the schema is ready. Its failure still ends the session
    // and frames held back are still decoded.
    if decoder.is_none() {
        let ready = ready_decoder(schema.await?, message_type)?;
        deliver_backlog(&ready, &mut backlog, sink, &mut summary);
    }

    info!(
        decoded = summary.decoded,
        rejected = summary.rejected,
        skipped = summary.skipped,
        "session ended"
    );

    Ok(summary)
}

fn ready_decoder(
    registry: SchemaRegistry,
    message_type: &str,
) -> Result<FrameDecoder, SchemaError> {
    let decoder = FrameDecoder::new(&registry, message_type)?;
    info!(message = message_type, "schema ready");
    Ok(decoder)
}

fn deliver<K: FrameSink>(
    decoder: &FrameDecoder,
    frame: &[u8],
    sink: &mut K,
    summary: &mut SessionSummary,
) {
    match decoder.decode(frame) {
        Ok(decoded) => {
            debug!(tag = decoded.tag, len = frame.len(), "frame decoded");
            summary.decoded += 1;
            sink.accept(decoded);
        }
        Err(err) => {
            warn!(len = frame.len(), error = %err, "dropping undecodable frame");
            summary.rejected += 1;
        }
    }
}

fn deliver_backlog<K: FrameSink>(
    decoder: &FrameDecoder,
    backlog: &mut Backlog,
    sink: &mut K,
    summary: &mut SessionSummary,
) {
    for frame in backlog.drain() {
        deliver(decoder, &frame, sink, summary);
    }
}

fn hold(backlog: &mut Backlog, frame: Vec<u8>, summary: &mut SessionSummary) {
    let len = frame.len();
    match backlog.push(frame) {
        Ok(()) => debug!(len, pending = backlog.len(), "schema not ready, holding frame"),
        Err(_) => {
            warn!(len, "schema not ready and backlog full, skipping frame");
            summary.skipped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::time::Duration;

    const DEVICE_STATUS_SCHEMA: &str = r#"{"nested":{"message":{"nested":{"WSDeviceStatus":{"fields":{"battery":{"type":"uint32","id":1}}}}}}}"#;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::from_json(DEVICE_STATUS_SCHEMA.as_bytes()).expect("Failed to build registry")
    }

    fn socket(
        messages: Vec<Result<Message, tungstenite::Error>>,
    ) -> impl Stream<Item = Result<Message, tungstenite::Error>> + Unpin {
        stream::iter(messages)
    }

    fn battery(tag: u8, level: u8) -> Result<Message, tungstenite::Error> {
        Ok(Message::binary(vec![tag, 0x08, level]))
    }

    #[test]
    fn test_default_socket_url() {
        let config = SessionConfig::default();
        assert_eq!(config.socket_url(), "ws://localhost:8080/ws");
        assert_eq!(config.message, "message.WSDeviceStatus");
    }

    #[tokio::test]
    async fn test_bad_frames_do_not_end_the_session() {
        let mut received = Vec::new();
        let mut sink = |frame: DecodedFrame| received.push(frame);

        let messages = vec![
            battery(0x00, 100),
            Ok(Message::binary(vec![0x00, 0x08, 0xff])),
            Ok(Message::text("hello")),
            Ok(Message::binary(Vec::new())),
            Ok(Message::Ping(Default::default())),
            battery(0x05, 1),
        ];

        let summary = drive(
            socket(messages),
            async { Ok(registry()) },
            DEVICE_STATUS_MESSAGE,
            DEFAULT_BACKLOG,
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            SessionSummary {
                decoded: 2,
                rejected: 2,
                skipped: 0
            }
        );
        assert_eq!(received[0].message, serde_json::json!({ "battery": 100 }));
        assert_eq!(received[1].tag, 0x05);
        assert_eq!(received[1].message, serde_json::json!({ "battery": 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_frames_wait_for_schema() {
        let mut received = Vec::new();
        let mut sink = |frame: DecodedFrame| received.push(frame);

        let schema = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(registry())
        };

        let summary = drive(
            socket(vec![battery(0, 10), battery(0, 20), battery(0, 30)]),
            schema,
            DEVICE_STATUS_MESSAGE,
            DEFAULT_BACKLOG,
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(summary.decoded, 3);
        let levels: Vec<_> = received.iter().map(|f| f.message["battery"].clone()).collect();
        assert_eq!(levels, vec![10, 20, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_backlog_skips_frames() {
        let mut received = Vec::new();
        let mut sink = |frame: DecodedFrame| received.push(frame);

        let schema = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(registry())
        };

        let summary = drive(
            socket(vec![battery(0, 10), battery(0, 20), battery(0, 30)]),
            schema,
            DEVICE_STATUS_MESSAGE,
            1,
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            SessionSummary {
                decoded: 1,
                rejected: 0,
                skipped: 2
            }
        );
        assert_eq!(received[0].message, serde_json::json!({ "battery": 10 }));
    }

    #[tokio::test]
    async fn test_schema_failure_is_fatal() {
        let mut sink = |_: DecodedFrame| {
            panic!("no frame should be decoded");
        };

        let schema = async {
            Err(SessionError::Load(LoadError::Status {
                url: "http://localhost:8080/messages".to_string(),
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            }))
        };

        let err = drive(
            socket(vec![battery(0, 10)]),
            schema,
            DEVICE_STATUS_MESSAGE,
            DEFAULT_BACKLOG,
            &mut sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::Load(LoadError::Status { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schema_failure_after_socket_closed() {
        let mut sink = |_: DecodedFrame| {};

        let schema = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(SessionError::Load(LoadError::Status {
                url: "http://localhost:8080/messages".to_string(),
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            }))
        };

        let err = drive(
            socket(Vec::new()),
            schema,
            DEVICE_STATUS_MESSAGE,
            DEFAULT_BACKLOG,
            &mut sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::Load(LoadError::Status { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_drains_before_later_frames() {
        let mut received = Vec::new();
        let mut sink = |frame: DecodedFrame| received.push(frame);

        let schema = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(registry())
        };

        let early = stream::iter(vec![battery(0, 10), battery(0, 20)]);
        let late = stream::once(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            battery(0, 30)
        });

        // With room for two frames only, the third is decoded directly or not at all
        let summary = drive(
            early.chain(late).boxed(),
            schema,
            DEVICE_STATUS_MESSAGE,
            2,
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(
            summary,
            SessionSummary {
                decoded: 3,
                rejected: 0,
                skipped: 0
            }
        );
        let levels: Vec<_> = received.iter().map(|f| f.message["battery"].clone()).collect();
        assert_eq!(levels, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_socket_error_cancels_schema_load() {
        let mut sink = |_: DecodedFrame| {};
        let (loading, cancelled) = tokio::sync::oneshot::channel::<()>();

        let task = SchemaTask(tokio::spawn(async move {
            let _loading = loading;
            std::future::pending::<Result<SchemaRegistry, LoadError>>().await
        }));

        let err = drive(
            socket(vec![Err(tungstenite::Error::Io(std::io::Error::other(
                "broken pipe",
            )))]),
            task.join(),
            DEVICE_STATUS_MESSAGE,
            DEFAULT_BACKLOG,
            &mut sink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::Socket(_)));

        // The load task is dropped, closing its end of the channel
        let closed = tokio::time::timeout(Duration::from_secs(5), cancelled)
            .await
            .expect("schema load was not cancelled");
        assert!(closed.is_err());
    }

    #[tokio::test]
    async fn test_unknown_message_type() {
        let mut sink = |_: DecodedFrame| {};

        let err = drive(
            socket(vec![battery(0, 10)]),
            async { Ok(registry()) },
            "message.Ghost",
            DEFAULT_BACKLOG,
            &mut sink,
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            SessionError::Schema(SchemaError::MessageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_socket_errors() {
        let mut sink = |_: DecodedFrame| {};

        // A closed connection ends the session normally
        let summary = drive(
            socket(vec![battery(0, 10), Err(tungstenite::Error::ConnectionClosed)]),
            async { Ok(registry()) },
            DEVICE_STATUS_MESSAGE,
            DEFAULT_BACKLOG,
            &mut sink,
        )
        .await
        .unwrap();
        assert_eq!(summary.decoded, 1);

        // Anything else is reported
        let err = drive(
            socket(vec![Err(tungstenite::Error::Io(std::io::Error::other(
                "broken pipe",
            )))]),
            async { Ok(registry()) },
            DEVICE_STATUS_MESSAGE,
            DEFAULT_BACKLOG,
            &mut sink,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SessionError::Socket(_)));
    }
}
