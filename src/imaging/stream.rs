//! Websocket client for the camera image service.
//!
//! The service pushes JSON frames carrying base64-encoded thermal and colour
//! images and expects a `{"type":"ping"}` keep-alive roughly every half
//! minute. The client keeps only the newest batch per kind; each message
//! replaces that kind's gallery wholesale, so the gallery is a last-value
//! cache of image sets, not a recording.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ImageStreamConfig;

const PING_PAYLOAD: &str = r#"{"type":"ping"}"#;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    Thermal,
    Colour,
}

/// A single received image, still base64-encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageFrame {
    pub kind: FrameKind,
    pub base64: String,
    pub created_at: DateTime<Utc>,
}

/// Newest image set per kind, in message order. Empty until the first
/// non-empty batch of that kind lands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GallerySnapshot {
    pub thermal: Vec<ImageFrame>,
    pub colour: Vec<ImageFrame>,
}

#[derive(Debug, Error)]
pub enum ImageStreamError {
    #[error("Image stream connection failed: {0}")]
    Connect(#[from] WsError),
}

#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<WireImage>,
}

#[derive(Deserialize)]
struct WireImage {
    #[serde(alias = "thermal_image", alias = "colour_image")]
    image: String,
    created_at: DateTime<Utc>,
}

/// Client for the image websocket. Reconnection is caller-driven: on drop of
/// the socket the task ends and `connect` may be called again.
pub struct ImageStreamClient {
    config: ImageStreamConfig,
    gallery_tx: watch::Sender<GallerySnapshot>,
    gallery_rx: watch::Receiver<GallerySnapshot>,
    task_cancel: Mutex<Option<CancellationToken>>,
}

impl ImageStreamClient {
    pub fn new(config: ImageStreamConfig) -> Self {
        let (gallery_tx, gallery_rx) = watch::channel(GallerySnapshot::default());
        Self {
            config,
            gallery_tx,
            gallery_rx,
            task_cancel: Mutex::new(None),
        }
    }

    /// Open the websocket and start consuming frames.
    ///
    /// Replaces any previous socket task. A connect failure surfaces to the
    /// caller; the gallery keeps its last frames either way.
    pub async fn connect(&self) -> Result<(), ImageStreamError> {
        let (socket, _response) = connect_async(self.config.url.as_str()).await?;
        info!("Image stream connected to {}", self.config.url);

        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .task_cancel
            .lock()
            .expect("cancel lock")
            .replace(cancel.clone())
        {
            previous.cancel();
        }

        let (write, read) = socket.split();
        let gallery_tx = self.gallery_tx.clone();
        let ping_interval = self.config.ping_interval();
        tokio::spawn(async move {
            pump(write, read, gallery_tx, ping_interval, cancel).await;
        });
        Ok(())
    }

    /// Newest frames; never blocks.
    pub fn gallery(&self) -> GallerySnapshot {
        self.gallery_rx.borrow().clone()
    }

    /// Watch for gallery updates.
    pub fn watch(&self) -> watch::Receiver<GallerySnapshot> {
        self.gallery_rx.clone()
    }

    /// Stop the socket task. Safe when never connected.
    pub fn shutdown(&self) {
        if let Some(cancel) = self.task_cancel.lock().expect("cancel lock").take() {
            cancel.cancel();
        }
    }
}

/// Socket loop. The keep-alive timer lives in here, so it cannot outlive the
/// socket it pings.
async fn pump<W, R>(
    mut write: W,
    mut read: R,
    gallery_tx: watch::Sender<GallerySnapshot>,
    ping_interval: std::time::Duration,
    cancel: CancellationToken,
) where
    W: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut keep_alive =
        tokio::time::interval_at(tokio::time::Instant::now() + ping_interval, ping_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Image stream task shutting down");
                break;
            }
            _ = keep_alive.tick() => {
                if write.send(Message::Text(PING_PAYLOAD.to_string())).await.is_err() {
                    warn!("Image stream keep-alive failed, closing");
                    break;
                }
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => apply_frame(&text, &gallery_tx),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Image stream read error: {}", e);
                    break;
                }
                None => {
                    info!("Image stream closed by server");
                    break;
                }
            },
        }
    }
}

fn apply_frame(text: &str, gallery_tx: &watch::Sender<GallerySnapshot>) {
    let wire: WireFrame = match serde_json::from_str(text) {
        Ok(wire) => wire,
        Err(e) => {
            warn!("Discarding malformed image frame: {}", e);
            return;
        }
    };
    let kind = match wire.kind.as_str() {
        "thermal_images" => FrameKind::Thermal,
        "colour_images" => FrameKind::Colour,
        other => {
            debug!("Ignoring image frame of unknown type {:?}", other);
            return;
        }
    };
    // An empty batch means the camera had nothing new; keep what we have.
    if wire.data.is_empty() {
        warn!("Image frame of type {:?} carried no images", kind);
        return;
    }
    let frames: Vec<ImageFrame> = wire
        .data
        .into_iter()
        .map(|img| ImageFrame {
            kind,
            base64: img.image,
            created_at: img.created_at,
        })
        .collect();
    gallery_tx.send_modify(|gallery| match kind {
        FrameKind::Thermal => gallery.thermal = frames,
        FrameKind::Colour => gallery.colour = frames,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_util::sync::PollSender;

    fn thermal_frame(b64: &str, stamp: &str) -> String {
        format!(
            r#"{{"type":"thermal_images","data":[{{"thermal_image":"{b64}","created_at":"{stamp}"}}]}}"#
        )
    }

    #[test]
    fn frames_land_in_their_kind_slot() {
        let (tx, rx) = watch::channel(GallerySnapshot::default());
        apply_frame(
            r#"{"type":"thermal_images","data":[
                {"thermal_image":"QUJD","created_at":"2025-03-01T10:00:00Z"},
                {"thermal_image":"REVG","created_at":"2025-03-01T10:00:01Z"},
                {"thermal_image":"R0hJ","created_at":"2025-03-01T10:00:02Z"}]}"#,
            &tx,
        );
        apply_frame(
            r#"{"type":"colour_images","data":[{"colour_image":"SktM","created_at":"2025-03-01T10:00:05Z"}]}"#,
            &tx,
        );

        // The whole batch survives, in message order.
        let gallery = rx.borrow().clone();
        assert_eq!(gallery.thermal.len(), 3);
        assert!(gallery.thermal.iter().all(|f| f.kind == FrameKind::Thermal));
        let images: Vec<&str> = gallery.thermal.iter().map(|f| f.base64.as_str()).collect();
        assert_eq!(images, ["QUJD", "REVG", "R0hJ"]);
        assert_eq!(gallery.colour.len(), 1);
        assert_eq!(gallery.colour[0].base64, "SktM");
    }

    #[test]
    fn newer_batch_replaces_older_same_kind_wholesale() {
        let (tx, rx) = watch::channel(GallerySnapshot::default());
        apply_frame(
            r#"{"type":"thermal_images","data":[
                {"thermal_image":"old1","created_at":"2025-03-01T10:00:00Z"},
                {"thermal_image":"old2","created_at":"2025-03-01T10:00:01Z"}]}"#,
            &tx,
        );
        apply_frame(&thermal_frame("new", "2025-03-01T10:00:10Z"), &tx);

        let gallery = rx.borrow().clone();
        assert_eq!(gallery.thermal.len(), 1);
        assert_eq!(gallery.thermal[0].base64, "new");
    }

    #[test]
    fn empty_batches_and_garbage_keep_the_gallery() {
        let (tx, rx) = watch::channel(GallerySnapshot::default());
        apply_frame(&thermal_frame("keep", "2025-03-01T10:00:00Z"), &tx);

        apply_frame(r#"{"type":"thermal_images","data":[]}"#, &tx);
        apply_frame(r#"{"type":"mystery","data":[]}"#, &tx);
        apply_frame("not json at all", &tx);

        assert_eq!(rx.borrow().thermal[0].base64, "keep");
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_pings_until_cancelled() {
        let (ping_tx, mut ping_rx) = tokio::sync::mpsc::channel(8);
        let (gallery_tx, _gallery_rx) = watch::channel(GallerySnapshot::default());
        let cancel = CancellationToken::new();

        let task = tokio::spawn(pump(
            PollSender::new(ping_tx),
            stream::pending::<Result<Message, WsError>>(),
            gallery_tx,
            std::time::Duration::from_secs(30),
            cancel.clone(),
        ));

        // Let the pump set up its timer before moving the clock.
        tokio::task::yield_now().await;
        tokio::time::advance(std::time::Duration::from_secs(29)).await;
        assert!(ping_rx.try_recv().is_err(), "no ping before the interval");

        // Two full intervals elapsed at t=61.
        tokio::time::advance(std::time::Duration::from_secs(32)).await;
        for _ in 0..2 {
            let msg = ping_rx.recv().await.expect("ping");
            assert_eq!(msg, Message::Text(PING_PAYLOAD.to_string()));
        }

        cancel.cancel();
        task.await.expect("pump exits");
        assert!(ping_rx.recv().await.is_none(), "no pings after shutdown");
    }

    #[tokio::test]
    async fn closed_socket_ends_the_task_and_keeps_frames() {
        let (gallery_tx, gallery_rx) = watch::channel(GallerySnapshot::default());
        let frames = stream::iter(vec![Ok(Message::Text(thermal_frame(
            "QUJD",
            "2025-03-01T10:00:00Z",
        )))]);
        let (ping_tx, _ping_rx) = tokio::sync::mpsc::channel(8);

        pump(
            PollSender::new(ping_tx),
            frames,
            gallery_tx,
            std::time::Duration::from_secs(30),
            CancellationToken::new(),
        )
        .await;

        assert!(!gallery_rx.borrow().thermal.is_empty());
    }
}
