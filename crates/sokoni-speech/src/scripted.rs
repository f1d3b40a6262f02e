use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use sokoni_types::language::Language;

use crate::{SpeechEngine, SpeechError, SpeechEvent, TextToSpeech};

/// Recognition engine driven from the outside. The demo binary and the chat
/// tests feed it events through [`ScriptedEngine::push`]; `start`/`stop`
/// only flip the session flag and emit the session markers.
pub struct ScriptedEngine {
    tx: mpsc::UnboundedSender<SpeechEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SpeechEvent>>>,
    recording: AtomicBool,
    /// When set, `start` fails, simulating a missing microphone permission.
    deny: AtomicBool,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            recording: AtomicBool::new(false),
            deny: AtomicBool::new(false),
        }
    }

    /// Inject a recognition event, as the platform recognizer would.
    pub fn push(&self, event: SpeechEvent) {
        let _ = self.tx.send(event);
    }

    pub fn deny_permission(&self) {
        self.deny.store(true, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }
}

impl Default for ScriptedEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SpeechEngine for ScriptedEngine {
    fn start(&self, language: Language) -> Result<(), SpeechError> {
        if self.deny.load(Ordering::Acquire) {
            return Err(SpeechError::PermissionDenied);
        }
        debug!("scripted recognition session started ({})", language);
        self.recording.store(true, Ordering::Release);
        let _ = self.tx.send(SpeechEvent::SessionStarted);
        Ok(())
    }

    fn stop(&self) {
        if self.recording.swap(false, Ordering::AcqRel) {
            let _ = self.tx.send(SpeechEvent::SessionEnded);
        }
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<SpeechEvent>> {
        self.rx.lock().expect("scripted engine lock poisoned").take()
    }
}

/// Speaker that records what it was asked to play. Tests assert on the
/// utterance log and on `stopped` to check mute semantics.
pub struct RecordingSpeaker {
    utterances: Mutex<Vec<(String, Language)>>,
    stops: AtomicUsize,
}

impl RecordingSpeaker {
    pub fn new() -> Self {
        Self {
            utterances: Mutex::new(Vec::new()),
            stops: AtomicUsize::new(0),
        }
    }

    pub fn spoken(&self) -> Vec<(String, Language)> {
        self.utterances.lock().expect("speaker lock poisoned").clone()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::Acquire)
    }
}

impl Default for RecordingSpeaker {
    fn default() -> Self {
        Self::new()
    }
}

impl TextToSpeech for RecordingSpeaker {
    fn speak(&self, text: &str, language: Language) {
        self.utterances
            .lock()
            .expect("speaker lock poisoned")
            .push((text.to_string(), language));
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::AcqRel);
    }
}
