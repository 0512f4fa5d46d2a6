use crate::{image_utils::encode_jpeg, session::MonitoringSession};
use ab_glyph::FontArc;
use bytes::Bytes;
use futures::stream;
use image::ImageError;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::sleep;
use tracing::instrument;

const FRAME_BOUNDARY: &str = "frame";

/// MJPEG feed of the captured frames with the overlay composited on top.
#[derive(Clone)]
pub struct PreviewStream {
    pub session: Arc<MonitoringSession>,
    pub font: Option<FontArc>,
    pub delay_ms: u64,
    pub quality: u8,
}

#[derive(Error, Debug)]
pub enum VideoStreamError {
    #[error("Encoding failed: {0}")]
    Encode(#[from] ImageError),
    #[error("Preview task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("Http builder error: {0}")]
    HttpBuilderError(String),
}

impl PreviewStream {
    pub fn new(
        session: Arc<MonitoringSession>,
        font: Option<FontArc>,
        delay_ms: u64,
        quality: u8,
    ) -> Self {
        Self {
            session,
            font,
            delay_ms,
            quality,
        }
    }

    async fn next_jpeg(&self) -> Result<Option<Bytes>, VideoStreamError> {
        let session = self.session.clone();
        let font = self.font.clone();
        let quality = self.quality;
        let jpeg = tokio::task::spawn_blocking(move || {
            session
                .compose_preview(font.as_ref())
                .map(|frame| encode_jpeg(&frame, quality))
                .transpose()
        })
        .await??;
        Ok(jpeg)
    }

    /// Ends when the session's frame source goes away.
    #[instrument(skip(self))]
    pub fn generate_stream(self) -> impl futures::Stream<Item = Result<Bytes, VideoStreamError>> {
        let preview = self.session.preview();

        stream::unfold((self, preview), |(feed, mut preview)| async move {
            loop {
                sleep(Duration::from_millis(feed.delay_ms)).await;
                match feed.next_jpeg().await {
                    Ok(Some(frame)) => {
                        let part_header = format!(
                            "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                            FRAME_BOUNDARY,
                            frame.len()
                        );
                        let mut body = part_header.into_bytes();
                        body.extend_from_slice(&frame);
                        body.extend_from_slice(b"\r\n");
                        return Some((Ok(Bytes::from(body)), (feed, preview)));
                    }
                    Ok(None) => {
                        // Nothing captured yet; wait for the next frame.
                        if preview.changed().await.is_err() {
                            return None;
                        }
                    }
                    Err(e) => {
                        tracing::error!("Error getting frame: {:?}", e);
                        return Some((Err(e), (feed, preview)));
                    }
                }
            }
        })
    }
}
