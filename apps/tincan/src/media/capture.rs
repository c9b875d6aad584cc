use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::{AudioCapture, AudioFrame, MediaError};

/// Opus DTX silence frame.
const SILENCE: &[u8] = &[0xf8, 0xff, 0xfe];

/// Hardware-free capture stand-in: emits opus silence at a fixed cadence so
/// the media pipeline runs end to end without device access. Real device
/// capture plugs in through the same `AudioCapture` seam.
pub struct SilentCapture {
    frame: Duration,
}

impl SilentCapture {
    pub fn new(frame: Duration) -> Self {
        Self { frame }
    }
}

impl Default for SilentCapture {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

#[async_trait]
impl AudioCapture for SilentCapture {
    fn label(&self) -> &str {
        "silence"
    }

    async fn start(&self) -> Result<mpsc::Receiver<AudioFrame>, MediaError> {
        let (tx, rx) = mpsc::channel(32);
        let frame = self.frame;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(frame);
            loop {
                ticker.tick().await;
                let sample = AudioFrame {
                    data: Bytes::from_static(SILENCE),
                    duration: frame,
                };
                if tx.send(sample).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn silent_capture_emits_frames() {
        let capture = SilentCapture::default();
        let mut frames = capture.start().await.unwrap();
        let frame = frames.recv().await.unwrap();
        assert_eq!(frame.data.as_ref(), SILENCE);
        assert_eq!(frame.duration, Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn capture_stops_when_receiver_drops() {
        let capture = SilentCapture::default();
        let frames = capture.start().await.unwrap();
        drop(frames);
        // The pump task exits on the next failed send; nothing to observe
        // beyond the absence of a panic.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
