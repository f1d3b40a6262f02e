pub mod capture;
pub mod scripted;

use tokio::sync::mpsc;

use sokoni_types::language::Language;

/// Events a recognition engine emits over its channel. All sources feed one
/// ordered queue on the consumer side, so interleavings are explicit rather
/// than buried in callback timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechEvent {
    SessionStarted,
    /// Revisable partial transcript; replaces the previous interim wholesale.
    Interim(String),
    /// A transcript segment the engine will not revise further.
    Final(String),
    Error(String),
    SessionEnded,
}

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("speech recognition unavailable: {0}")]
    Unavailable(String),
    #[error("microphone permission denied")]
    PermissionDenied,
}

/// Streaming speech-to-text capability. Platform implementations are chosen
/// once at startup and injected; the engine delivers events through the
/// channel handed over in [`SpeechEngine::events`].
pub trait SpeechEngine: Send + Sync {
    /// Begin a recognition session in `language`. A failed start must leave
    /// the engine in the not-recording state.
    fn start(&self, language: Language) -> Result<(), SpeechError>;

    /// End the current session, if any. Idempotent.
    fn stop(&self);

    /// Take the event stream. Yields `None` once per engine; a session owns
    /// the receiver for its lifetime.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<SpeechEvent>>;
}

/// Text-to-speech playback. Fire and forget: no completion callback, and
/// `stop` cuts an utterance already in flight.
pub trait TextToSpeech: Send + Sync {
    fn speak(&self, text: &str, language: Language);
    fn stop(&self);
}

/// Speaker that drops everything. For headless runs and tests that do not
/// care about playback.
pub struct NullSpeaker;

impl TextToSpeech for NullSpeaker {
    fn speak(&self, _text: &str, _language: Language) {}
    fn stop(&self) {}
}
