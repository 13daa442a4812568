//! Streaming relay from one backend event stream to one client.
//!
//! A reader task owns the backend connection and pushes [`RelayFrame`]s into a
//! bounded channel; the client response body drains that channel. Frames keep
//! backend arrival order, and every stream ends with exactly one sentinel
//! frame unless the client went away first.

use std::convert::Infallible;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::logging::{LogLevel, SharedLogger};
use crate::mapping::ModelMapping;
use crate::registry::BackendRegistry;
use crate::translate::openai_types::ErrorEnvelope;
use crate::translate::sse::{FrameDecoder, DONE_FRAME};

/// One unit of streamed output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Data(Bytes),
    /// The terminal sentinel, as received or synthesized.
    Done(Bytes),
}

impl RelayFrame {
    pub fn done() -> Self {
        RelayFrame::Done(Bytes::from_static(DONE_FRAME))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, RelayFrame::Done(_))
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            RelayFrame::Data(b) | RelayFrame::Done(b) => b,
        }
    }
}

/// How a relay ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// The sentinel was delivered after `forwarded` data frames.
    Completed { forwarded: usize },
    /// The backend failed mid-stream; an error frame and the sentinel were delivered.
    Interrupted { forwarded: usize, reason: String },
    /// The client stopped listening. Nothing further was sent.
    Cancelled { forwarded: usize },
}

pub struct RelayContext {
    pub request_id: String,
    pub backend_name: String,
    pub mapping: Arc<ModelMapping>,
    /// Longest wait for the next chunk from the backend.
    pub idle_timeout: Duration,
    pub channel_capacity: usize,
    /// Registry slot to mark failed if the backend breaks mid-stream.
    pub health: Option<(Arc<BackendRegistry>, usize)>,
    pub logger: SharedLogger,
}

/// Start relaying `source` on its own task.
pub fn spawn_relay<S, E>(
    source: S,
    ctx: RelayContext,
) -> (mpsc::Receiver<RelayFrame>, JoinHandle<RelayOutcome>)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(ctx.channel_capacity.max(1));
    let handle = tokio::spawn(run_relay(source, tx, ctx));
    (rx, handle)
}

/// Client-facing body that yields frames as they arrive.
pub fn relay_body(rx: mpsc::Receiver<RelayFrame>) -> Body {
    Body::from_stream(
        ReceiverStream::new(rx).map(|frame| Ok::<_, Infallible>(frame.into_bytes())),
    )
}

async fn run_relay<S, E>(source: S, tx: mpsc::Sender<RelayFrame>, ctx: RelayContext) -> RelayOutcome
where
    S: Stream<Item = Result<Bytes, E>> + Send,
    E: Display,
{
    tokio::pin!(source);
    let mut decoder = FrameDecoder::new();
    let mut forwarded = 0usize;

    let outcome = loop {
        let next = tokio::select! {
            biased;
            () = tx.closed() => break RelayOutcome::Cancelled { forwarded },
            next = tokio::time::timeout(ctx.idle_timeout, source.next()) => next,
        };

        let frames = match next {
            Ok(Some(Ok(chunk))) => decoder.push(&chunk),
            Ok(Some(Err(e))) => {
                break interrupt(&tx, &ctx, forwarded, format!("backend stream failed: {e}")).await;
            }
            Err(_) => {
                let reason = format!(
                    "backend sent nothing for {}s",
                    ctx.idle_timeout.as_secs_f32()
                );
                break interrupt(&tx, &ctx, forwarded, reason).await;
            }
            Ok(None) => {
                let tail = decoder.finish();
                match tail {
                    Some(frame) if frame.is_done() => {
                        break finish(&tx, RelayFrame::Done(frame.to_bytes()), forwarded).await;
                    }
                    Some(frame) => {
                        let bytes = frame.rewrite(&ctx.mapping).to_bytes();
                        if tx.send(RelayFrame::Data(bytes)).await.is_err() {
                            break RelayOutcome::Cancelled { forwarded };
                        }
                        forwarded += 1;
                    }
                    None => {}
                }
                tracing::warn!(
                    request_id = %ctx.request_id,
                    backend = %ctx.backend_name,
                    "Backend closed stream without [DONE], sending sentinel"
                );
                break finish(&tx, RelayFrame::done(), forwarded).await;
            }
        };

        let mut ended = None;
        for frame in frames {
            if frame.is_done() {
                ended = Some(finish(&tx, RelayFrame::Done(frame.to_bytes()), forwarded).await);
                break;
            }
            let bytes = frame.rewrite(&ctx.mapping).to_bytes();
            if tx.send(RelayFrame::Data(bytes)).await.is_err() {
                ended = Some(RelayOutcome::Cancelled { forwarded });
                break;
            }
            forwarded += 1;
        }
        if let Some(outcome) = ended {
            break outcome;
        }
    };

    match &outcome {
        RelayOutcome::Completed { forwarded } => {
            tracing::debug!(request_id = %ctx.request_id, forwarded, "Stream completed");
            ctx.logger.request(
                LogLevel::Info,
                "relay",
                &ctx.request_id,
                format!("Stream completed after {forwarded} frames"),
            );
        }
        RelayOutcome::Interrupted { forwarded, reason } => {
            ctx.logger.request(
                LogLevel::Error,
                "relay",
                &ctx.request_id,
                format!("Stream interrupted after {forwarded} frames: {reason}"),
            );
        }
        RelayOutcome::Cancelled { forwarded } => {
            tracing::info!(
                request_id = %ctx.request_id,
                backend = %ctx.backend_name,
                forwarded,
                "Client went away, closing backend stream"
            );
            ctx.logger.request(
                LogLevel::Info,
                "relay",
                &ctx.request_id,
                format!("Client cancelled after {forwarded} frames"),
            );
        }
    }

    outcome
}

async fn finish(tx: &mpsc::Sender<RelayFrame>, sentinel: RelayFrame, forwarded: usize) -> RelayOutcome {
    if tx.send(sentinel).await.is_err() {
        return RelayOutcome::Cancelled { forwarded };
    }
    RelayOutcome::Completed { forwarded }
}

async fn interrupt(
    tx: &mpsc::Sender<RelayFrame>,
    ctx: &RelayContext,
    forwarded: usize,
    reason: String,
) -> RelayOutcome {
    tracing::error!(
        request_id = %ctx.request_id,
        backend = %ctx.backend_name,
        forwarded,
        "{}",
        reason
    );
    if let Some((registry, slot)) = &ctx.health {
        registry.record_failure(*slot, reason.clone());
    }

    let envelope = ErrorEnvelope::stream_interrupted(reason.clone()).into_response_body();
    let payload = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
    let error_frame = RelayFrame::Data(Bytes::from(format!("data: {payload}\n\n")));

    if tx.send(error_frame).await.is_err() || tx.send(RelayFrame::done()).await.is_err() {
        return RelayOutcome::Cancelled { forwarded };
    }
    RelayOutcome::Interrupted { forwarded, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn ctx() -> RelayContext {
        RelayContext {
            request_id: "req_test".to_string(),
            backend_name: "mock".to_string(),
            mapping: Arc::new(
                ModelMapping::from_pairs([("gpt-3.5-turbo", "llama-3.1-instruct-13b")]).unwrap(),
            ),
            idle_timeout: Duration::from_secs(5),
            channel_capacity: 4,
            health: None,
            logger: SharedLogger::in_memory(),
        }
    }

    fn chunk(content: &str) -> Bytes {
        Bytes::from(format!(
            "data: {{\"model\":\"llama-3.1-instruct-13b\",\"choices\":[{{\"delta\":{{\"content\":\"{content}\"}}}}]}}\n\n"
        ))
    }

    async fn drain(mut rx: mpsc::Receiver<RelayFrame>) -> Vec<RelayFrame> {
        let mut out = Vec::new();
        while let Some(f) = rx.recv().await {
            out.push(f);
        }
        out
    }

    #[tokio::test]
    async fn test_frames_forwarded_in_order_with_single_sentinel() {
        let mut items: Vec<Result<Bytes, std::io::Error>> =
            ["H", "e", "l", "l", "o"].iter().map(|c| Ok(chunk(c))).collect();
        items.push(Ok(Bytes::from_static(b"data: [DONE]\n\n")));

        let (rx, handle) = spawn_relay(futures::stream::iter(items), ctx());
        let frames = drain(rx).await;

        assert_eq!(frames.len(), 6);
        for (frame, c) in frames.iter().zip(["H", "e", "l", "l", "o"]) {
            let RelayFrame::Data(bytes) = frame else {
                panic!("expected data frame, got {frame:?}");
            };
            let text = std::str::from_utf8(bytes).unwrap();
            assert!(text.contains("\"model\":\"gpt-3.5-turbo\""));
            assert!(text.contains(&format!("\"content\":\"{c}\"")));
        }
        assert_eq!(frames[5], RelayFrame::done());
        assert_eq!(
            handle.await.unwrap(),
            RelayOutcome::Completed { forwarded: 5 }
        );
    }

    #[tokio::test]
    async fn test_nothing_after_backend_sentinel() {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![Ok(Bytes::from_static(
            b"data: {\"n\":1}\n\ndata: [DONE]\n\ndata: {\"n\":2}\n\n",
        ))];
        let (rx, handle) = spawn_relay(futures::stream::iter(items), ctx());
        let frames = drain(rx).await;
        assert_eq!(frames.len(), 2);
        assert!(frames[1].is_done());
        assert_eq!(handle.await.unwrap(), RelayOutcome::Completed { forwarded: 1 });
    }

    #[tokio::test]
    async fn test_missing_sentinel_is_synthesized_once() {
        let items: Vec<Result<Bytes, std::io::Error>> = vec![Ok(chunk("a")), Ok(chunk("b"))];
        let (rx, _) = spawn_relay(futures::stream::iter(items), ctx());
        let frames = drain(rx).await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames.iter().filter(|f| f.is_done()).count(), 1);
        assert!(frames[2].is_done());
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream_ends_with_error_and_sentinel() {
        let registry = Arc::new(
            BackendRegistry::from_config(&crate::config::GatewayConfig::default()).unwrap(),
        );
        let items: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(chunk("a")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer")),
            Ok(chunk("never")),
        ];
        let mut c = ctx();
        c.health = Some((Arc::clone(&registry), 0));
        let (rx, handle) = spawn_relay(futures::stream::iter(items), c);
        let frames = drain(rx).await;

        assert_eq!(frames.len(), 3);
        let error = std::str::from_utf8(match &frames[1] {
            RelayFrame::Data(b) => b,
            other => panic!("expected error frame, got {other:?}"),
        })
        .unwrap()
        .to_string();
        assert!(error.contains("stream_interrupted"));
        assert!(error.contains("reset by peer"));
        assert!(frames[2].is_done());
        assert!(matches!(
            handle.await.unwrap(),
            RelayOutcome::Interrupted { forwarded: 1, .. }
        ));
        assert_eq!(registry.snapshot()[0].consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_idle_timeout_interrupts_stream() {
        let source = futures::stream::iter(vec![Ok::<_, std::io::Error>(chunk("a"))])
            .chain(futures::stream::pending());
        let mut c = ctx();
        c.idle_timeout = Duration::from_millis(50);
        let (rx, handle) = spawn_relay(source, c);
        let frames = drain(rx).await;
        assert_eq!(frames.len(), 3);
        assert!(frames[2].is_done());
        assert!(matches!(
            handle.await.unwrap(),
            RelayOutcome::Interrupted { .. }
        ));
    }

    #[tokio::test]
    async fn test_client_cancel_drops_backend_stream() {
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(Arc::clone(&dropped));
        let source = async_stream::stream! {
            let _guard = guard;
            yield Ok::<_, std::io::Error>(chunk("first"));
            futures::future::pending::<()>().await;
        };

        let (mut rx, handle) = spawn_relay(source, ctx());
        let first = rx.recv().await.unwrap();
        assert!(!first.is_done());
        drop(rx);

        let outcome = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("relay task did not observe cancellation")
            .unwrap();
        assert_eq!(outcome, RelayOutcome::Cancelled { forwarded: 1 });
        assert!(dropped.load(Ordering::SeqCst));
    }
}
