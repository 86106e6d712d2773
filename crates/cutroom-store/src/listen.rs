//! WebSocket live queries against the hosted document store.
//!
//! The client opens `/v1/listen`, sends the query once, and receives the full
//! result set on every change. On disconnect the listener reports an error to
//! the subscriber and reconnects with exponential backoff; the server replays
//! a full snapshot on every new connection, so nothing needs to be resumed.

use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, trace, warn};

use crate::subscription::{self, SnapshotSink};
use crate::{Document, Query, SnapshotEvent, StoreError, Subscription};

/// Reconnect if the server goes quiet for this long.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Frames pushed by the server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ListenFrame {
    Snapshot {
        #[serde(default)]
        documents: Vec<Document>,
    },
    Error {
        code: String,
        #[serde(default)]
        message: String,
    },
}

#[derive(Serialize)]
struct ListenRequest<'a> {
    query: &'a Query,
}

/// How a connection ended.
enum Disconnect {
    /// The subscriber went away; stop for good.
    Detached,
    /// The connection failed; reconnect.
    Failed(StoreError),
}

/// A live query bound to one store endpoint.
pub(crate) struct LiveQuery {
    url: String,
    api_key: Option<String>,
}

impl LiveQuery {
    pub(crate) fn new(base_url: &str, api_key: Option<String>) -> Self {
        let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base_url.to_string()
        };
        Self {
            url: format!("{}/v1/listen", ws_base),
            api_key,
        }
    }

    /// Start listening in the background. Dropping the returned subscription
    /// closes the socket.
    pub(crate) fn spawn(self, query: Query) -> Subscription {
        let (sink, sub) = subscription::channel(query.clone());
        tokio::spawn(async move {
            self.run(query, sink).await;
        });
        sub
    }

    async fn run(&self, query: Query, mut sink: SnapshotSink) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            if sink.is_closed() {
                break;
            }

            debug!(url = %self.url, collection = %query.collection, "opening live query");

            match self.connect_and_process(&query, &mut sink, &mut backoff).await {
                Disconnect::Detached => break,
                Disconnect::Failed(e) => {
                    warn!(
                        collection = %query.collection,
                        error = %e,
                        "live query disconnected, reconnecting"
                    );
                    if !sink.send(SnapshotEvent::Error(e)).await {
                        break;
                    }

                    let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
                    tokio::select! {
                        _ = sink.closed() => break,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }

        info!(collection = %query.collection, "live query detached");
    }

    async fn connect_and_process(
        &self,
        query: &Query,
        sink: &mut SnapshotSink,
        backoff: &mut ExponentialBackoff,
    ) -> Disconnect {
        let mut request = match self.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(e) => return Disconnect::Failed(StoreError::WebSocket(format!("bad url: {}", e))),
        };
        if let Some(key) = &self.api_key {
            match HeaderValue::from_str(&format!("Bearer {}", key)) {
                Ok(value) => {
                    request.headers_mut().insert("Authorization", value);
                }
                Err(e) => {
                    return Disconnect::Failed(StoreError::InvalidRequest(format!(
                        "api key is not a valid header: {}",
                        e
                    )));
                }
            }
        }

        let ws_stream = match connect_async(request).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                return Disconnect::Failed(StoreError::WebSocket(format!(
                    "connection failed: {}",
                    e
                )));
            }
        };
        let (mut write, mut read) = ws_stream.split();

        let hello = match serde_json::to_string(&ListenRequest { query }) {
            Ok(hello) => hello,
            Err(e) => return Disconnect::Failed(StoreError::Json(e)),
        };
        if let Err(e) = write.send(Message::Text(hello)).await {
            return Disconnect::Failed(StoreError::WebSocket(format!("send failed: {}", e)));
        }

        backoff.reset();
        debug!(collection = %query.collection, "live query connected");

        loop {
            tokio::select! {
                biased;

                _ = sink.closed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Disconnect::Detached;
                }

                result = tokio::time::timeout(READ_TIMEOUT, read.next()) => {
                    let event = match result {
                        Ok(Some(Ok(Message::Text(text)))) => match parse_frame(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(error = %e, "failed to parse live query frame");
                                continue;
                            }
                        },
                        Ok(Some(Ok(Message::Ping(_)))) => {
                            trace!("received ping");
                            continue;
                        }
                        Ok(Some(Ok(Message::Close(_)))) => {
                            return Disconnect::Failed(StoreError::WebSocket(
                                "connection closed".to_string(),
                            ));
                        }
                        Ok(Some(Ok(_))) => continue,
                        Ok(Some(Err(e))) => {
                            return Disconnect::Failed(StoreError::WebSocket(format!(
                                "read error: {}",
                                e
                            )));
                        }
                        Ok(None) => {
                            return Disconnect::Failed(StoreError::WebSocket(
                                "stream ended".to_string(),
                            ));
                        }
                        Err(_) => {
                            return Disconnect::Failed(StoreError::WebSocket(
                                "read timeout".to_string(),
                            ));
                        }
                    };

                    if !sink.send(event).await {
                        return Disconnect::Detached;
                    }
                }
            }
        }
    }
}

/// Decode a server frame into a subscriber event.
fn parse_frame(text: &str) -> Result<SnapshotEvent, StoreError> {
    let frame: ListenFrame = serde_json::from_str(text)?;
    Ok(match frame {
        ListenFrame::Snapshot { documents } => SnapshotEvent::Snapshot(documents),
        ListenFrame::Error { code, message } if code == "permission-denied" => {
            SnapshotEvent::Error(StoreError::PermissionDenied(message))
        }
        ListenFrame::Error { code, message } => {
            SnapshotEvent::Error(StoreError::Server { code, message })
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_url_switches_scheme() {
        assert_eq!(
            LiveQuery::new("https://store.example.com", None).url,
            "wss://store.example.com/v1/listen"
        );
        assert_eq!(
            LiveQuery::new("http://localhost:8080", None).url,
            "ws://localhost:8080/v1/listen"
        );
    }

    #[test]
    fn snapshot_frame_decodes_documents() {
        let event = parse_frame(
            r#"{"type":"snapshot","documents":[{"id":"m1","data":{"content":"hi"}}]}"#,
        )
        .unwrap();
        match event {
            SnapshotEvent::Snapshot(docs) => {
                assert_eq!(docs.len(), 1);
                assert_eq!(docs[0].id, "m1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn permission_error_frame_is_typed() {
        let event =
            parse_frame(r#"{"type":"error","code":"permission-denied","message":"nope"}"#).unwrap();
        assert!(matches!(
            event,
            SnapshotEvent::Error(StoreError::PermissionDenied(_))
        ));
    }
}
