use beach_harbor_core::TypedEvent;
use metrics::counter;
use redis::aio::ConnectionManager;
use redis::RedisResult;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Destination for exported events.
pub enum EventSink {
    /// Appends each event to a Redis stream with `key`, `kind` and `payload`
    /// fields.
    Redis {
        conn: ConnectionManager,
        stream: String,
        max_len: usize,
    },
    Log,
}

impl EventSink {
    pub async fn connect_redis(url: &str, stream: String, max_len: usize) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(EventSink::Redis {
            conn,
            stream,
            max_len,
        })
    }

    fn label(&self) -> &'static str {
        match self {
            EventSink::Redis { .. } => "redis",
            EventSink::Log => "log",
        }
    }

    async fn publish(&mut self, event: &TypedEvent, payload: Vec<u8>) -> RedisResult<()> {
        match self {
            EventSink::Redis {
                conn,
                stream,
                max_len,
            } => {
                let _: String = redis::cmd("XADD")
                    .arg(stream.as_str())
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(*max_len)
                    .arg("*")
                    .arg("key")
                    .arg(event.routing_key())
                    .arg("kind")
                    .arg(event.kind())
                    .arg("payload")
                    .arg(payload)
                    .query_async(conn)
                    .await?;
                Ok(())
            }
            EventSink::Log => {
                info!(
                    kind = event.kind(),
                    key = event.routing_key(),
                    payload = %String::from_utf8_lossy(&payload),
                    "event"
                );
                Ok(())
            }
        }
    }
}

/// Drains the event queue into `sink`. Publish failures are logged and the
/// event dropped; the loop only ends on cancellation or a closed queue.
pub async fn run_sink(
    mut sink: EventSink,
    mut events: mpsc::Receiver<TypedEvent>,
    cancel: CancellationToken,
) {
    info!(sink = sink.label(), "event sink started");
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let payload = match event.to_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                counter!("beach_harbor_events_published_total", 1, "outcome" => "encode_error");
                warn!(error = %err, kind = event.kind(), "failed to encode event");
                continue;
            }
        };
        match sink.publish(&event, payload).await {
            Ok(()) => {
                counter!("beach_harbor_events_published_total", 1, "outcome" => "ok");
            }
            Err(err) => {
                counter!("beach_harbor_events_published_total", 1, "outcome" => "error");
                warn!(error = %err, kind = event.kind(), key = event.routing_key(), "failed to publish event");
            }
        }
    }
    debug!("event sink stopped");
}
