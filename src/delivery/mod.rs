//! Outbound delivery — the transport/TTS seams and the voice-first,
//! optionally segmented send flow.

pub mod segment;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SegmentSettings, TtsSettings};
use segment::{segment_interval, split_text};

/// Host-provided message transport for one session.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_text(&self, session_id: &str, text: &str) -> Result<(), String>;
    async fn send_voice(&self, session_id: &str, audio: &Path) -> Result<(), String>;
}

/// Host-provided speech synthesis. Returns a path to the rendered audio.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<PathBuf, String>;
}

/// The proactive send flow: try voice first, fall back to (or double with)
/// text, segmenting short messages with a typing-like pause between parts.
pub struct ProactiveSender {
    sink: Arc<dyn MessageSink>,
    tts: Option<Arc<dyn SpeechSynthesizer>>,
}

impl ProactiveSender {
    pub fn new(sink: Arc<dyn MessageSink>, tts: Option<Arc<dyn SpeechSynthesizer>>) -> Self {
        Self { sink, tts }
    }

    pub async fn send(
        &self,
        session_id: &str,
        text: &str,
        tts_conf: &TtsSettings,
        seg_conf: &SegmentSettings,
    ) -> Result<(), String> {
        let mut voice_sent = false;
        if tts_conf.enable_tts {
            voice_sent = self.try_send_voice(session_id, text).await;
        }

        // Voice failure always falls back to text; on success the text still
        // goes out when configured to.
        let should_send_text = !voice_sent || tts_conf.always_send_text;
        if !should_send_text {
            return Ok(());
        }

        if seg_conf.enable && text.chars().count() <= seg_conf.words_count_threshold {
            let segments = split_text(text, seg_conf);
            let last = segments.len() - 1;
            for (idx, segment) in segments.iter().enumerate() {
                self.sink.send_text(session_id, segment).await?;
                if idx < last {
                    let pause = segment_interval(segment, seg_conf);
                    tokio::time::sleep(Duration::from_secs_f64(pause)).await;
                }
            }
        } else {
            self.sink.send_text(session_id, text).await?;
        }
        Ok(())
    }

    /// Attempt the voice path. Returns whether audio went out.
    async fn try_send_voice(&self, session_id: &str, text: &str) -> bool {
        let Some(tts) = &self.tts else {
            return false;
        };
        let audio = match tts.synthesize(text).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("speech synthesis failed: {}", e);
                return false;
            }
        };
        match self.sink.send_voice(session_id, &audio).await {
            Ok(()) => {
                // Brief gap so voice and text don't land simultaneously.
                tokio::time::sleep(Duration::from_millis(500)).await;
                true
            }
            Err(e) => {
                tracing::error!("voice delivery failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        texts: Mutex<Vec<String>>,
        voices: Mutex<Vec<PathBuf>>,
        fail_voice: bool,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_text(&self, _session_id: &str, text: &str) -> Result<(), String> {
            self.texts.lock().await.push(text.to_string());
            Ok(())
        }
        async fn send_voice(&self, _session_id: &str, audio: &Path) -> Result<(), String> {
            if self.fail_voice {
                return Err("platform rejected audio".to_string());
            }
            self.voices.lock().await.push(audio.to_path_buf());
            Ok(())
        }
    }

    struct FixedTts;

    #[async_trait]
    impl SpeechSynthesizer for FixedTts {
        async fn synthesize(&self, _text: &str) -> Result<PathBuf, String> {
            Ok(PathBuf::from("/tmp/voice.wav"))
        }
    }

    struct BrokenTts;

    #[async_trait]
    impl SpeechSynthesizer for BrokenTts {
        async fn synthesize(&self, _text: &str) -> Result<PathBuf, String> {
            Err("model not loaded".to_string())
        }
    }

    #[tokio::test]
    async fn voice_plus_text_when_always_send_text() {
        let sink = Arc::new(RecordingSink::default());
        let sender = ProactiveSender::new(sink.clone(), Some(Arc::new(FixedTts)));
        sender
            .send("s", "hello", &TtsSettings::default(), &SegmentSettings::default())
            .await
            .unwrap();
        assert_eq!(sink.voices.lock().await.len(), 1);
        assert_eq!(sink.texts.lock().await.as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn voice_only_when_text_disabled_after_success() {
        let sink = Arc::new(RecordingSink::default());
        let sender = ProactiveSender::new(sink.clone(), Some(Arc::new(FixedTts)));
        let tts_conf = TtsSettings {
            enable_tts: true,
            always_send_text: false,
        };
        sender
            .send("s", "hello", &tts_conf, &SegmentSettings::default())
            .await
            .unwrap();
        assert_eq!(sink.voices.lock().await.len(), 1);
        assert!(sink.texts.lock().await.is_empty());
    }

    #[tokio::test]
    async fn synthesis_failure_still_sends_text() {
        let sink = Arc::new(RecordingSink::default());
        let sender = ProactiveSender::new(sink.clone(), Some(Arc::new(BrokenTts)));
        let tts_conf = TtsSettings {
            enable_tts: true,
            always_send_text: false,
        };
        sender
            .send("s", "hello", &tts_conf, &SegmentSettings::default())
            .await
            .unwrap();
        assert!(sink.voices.lock().await.is_empty());
        assert_eq!(sink.texts.lock().await.as_slice(), ["hello"]);
    }

    #[tokio::test]
    async fn short_messages_are_segmented_long_ones_sent_whole() {
        let sink = Arc::new(RecordingSink::default());
        let sender = ProactiveSender::new(sink.clone(), None);
        let tts_conf = TtsSettings {
            enable_tts: false,
            always_send_text: true,
        };
        let seg_conf = SegmentSettings {
            enable: true,
            words_count_threshold: 20,
            interval: "0.0,0.0".to_string(),
            ..Default::default()
        };

        sender.send("s", "一。二。", &tts_conf, &seg_conf).await.unwrap();
        assert_eq!(sink.texts.lock().await.as_slice(), ["一。", "二。"]);

        sink.texts.lock().await.clear();
        let long = "這句話很長。".repeat(10);
        sender.send("s", &long, &tts_conf, &seg_conf).await.unwrap();
        assert_eq!(sink.texts.lock().await.len(), 1);
    }
}
