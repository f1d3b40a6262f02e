/// Conversation synchronization engine.
///
/// A session merges four message sources (initial fetch, store push, local
/// send, outbox flush) into one monotonically growing, newest-first
/// list, and folds speech recognition into the composer. Every asynchronous
/// source feeds the same `tokio::select!` loop, so the interleaving of a
/// push refetch against a local send is explicit and a message id can never
/// appear twice.
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use sokoni_outbox::Outbox;
use sokoni_speech::capture::CaptureBuffer;
use sokoni_speech::{SpeechEngine, SpeechEvent, TextToSpeech};
use sokoni_store::{RemoteStore, StoreError, resolve_conversation};
use sokoni_translate::Translator;
use sokoni_types::events::StoreEvent;
use sokoni_types::language::{Language, LanguageContext};
use sokoni_types::models::{Conversation, ConversationKey, Message, NewMessage, QueuedMessage};

#[derive(Debug, Clone)]
pub struct ChatConfig {
    /// Recognition stops after this long without a speech event.
    pub silence_timeout: Duration,
    /// Bound on a single remote insert before the payload goes to the
    /// outbox instead of hanging the composer.
    pub send_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            silence_timeout: Duration::from_secs(6),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Collaborators, injected once at construction.
#[derive(Clone)]
pub struct ChatDeps {
    pub store: Arc<dyn RemoteStore>,
    pub translator: Arc<dyn Translator>,
    pub speech: Arc<dyn SpeechEngine>,
    pub speaker: Arc<dyn TextToSpeech>,
    pub outbox: Arc<Outbox>,
    pub language: LanguageContext,
}

/// Failures fatal to the whole chat view. Everything softer travels as a
/// [`ChatUpdate`] notice.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Without a resolved conversation id the chat cannot proceed; callers
    /// show a retry affordance and reopen.
    #[error("could not resolve conversation")]
    Resolve(#[source] StoreError),

    #[error("could not load messages")]
    Load(#[source] StoreError),
}

/// One message as the viewer sees it: content already translated into their
/// display language. Stored content stays canonical; this is a projection.
#[derive(Debug, Clone)]
pub struct DisplayMessage {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub read_at: Option<DateTime<Utc>>,
    pub mine: bool,
}

/// State pushed toward the UI layer.
#[derive(Debug, Clone)]
pub enum ChatUpdate {
    /// The current message list, newest first.
    Messages(Vec<DisplayMessage>),
    Composer(String),
    Recording(bool),
    /// A send could not reach the store; the payload is parked in the
    /// outbox. Non-fatal.
    Queued { pending: usize },
    /// A transient, user-visible notice (speech failure, flush progress).
    Notice(String),
}

enum Command {
    SetComposer(String),
    Send,
    StartRecording,
    StopRecording,
    FlushOutbox,
    Refresh,
}

/// Handle held by the chat screen for the lifetime of the view.
pub struct ChatHandle {
    conversation_id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    cancel: CancellationToken,
    muted: Arc<AtomicBool>,
    speaker: Arc<dyn TextToSpeech>,
}

impl std::fmt::Debug for ChatHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatHandle")
            .field("conversation_id", &self.conversation_id)
            .finish_non_exhaustive()
    }
}

impl ChatHandle {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn set_composer(&self, text: String) {
        let _ = self.commands.send(Command::SetComposer(text));
    }

    pub fn send(&self) {
        let _ = self.commands.send(Command::Send);
    }

    pub fn start_recording(&self) {
        let _ = self.commands.send(Command::StartRecording);
    }

    pub fn stop_recording(&self) {
        let _ = self.commands.send(Command::StopRecording);
    }

    pub fn flush_outbox(&self) {
        let _ = self.commands.send(Command::FlushOutbox);
    }

    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    /// Gate text-to-speech playback. The flag is read at playback time, so
    /// the toggle applies to the very next utterance, and muting cuts any
    /// utterance already in flight.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
        if muted {
            self.speaker.stop();
        }
    }

    pub fn muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ChatHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ChatSession;

impl ChatSession {
    /// Resolve the conversation for `key`, load the backlog, and start the
    /// engine. Subscribes to store push before the initial fetch so nothing
    /// lands in the gap between the two.
    pub async fn open(
        deps: ChatDeps,
        key: ConversationKey,
        viewer: Uuid,
        config: ChatConfig,
    ) -> Result<(ChatHandle, mpsc::UnboundedReceiver<ChatUpdate>), ChatError> {
        let conversation = resolve_conversation(deps.store.as_ref(), &key)
            .await
            .map_err(ChatError::Resolve)?;
        info!("conversation {} resolved for viewer {}", conversation.id, viewer);

        let store_rx = deps.store.subscribe();
        let speech_rx = deps.speech.events();

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let muted = Arc::new(AtomicBool::new(false));

        let mut engine = Engine {
            deps: deps.clone(),
            config,
            conversation,
            viewer,
            messages: Vec::new(),
            composer: String::new(),
            capture: CaptureBuffer::new(),
            recording: false,
            speech_alerted: false,
            silence_deadline: None,
            muted: muted.clone(),
            updates: update_tx,
        };
        engine.reload_messages().await.map_err(ChatError::Load)?;

        let handle = ChatHandle {
            conversation_id: engine.conversation.id,
            commands: command_tx,
            cancel: cancel.clone(),
            muted,
            speaker: deps.speaker.clone(),
        };

        tokio::spawn(async move {
            engine.run(command_rx, store_rx, speech_rx, cancel).await;
        });

        Ok((handle, update_rx))
    }
}

struct Engine {
    deps: ChatDeps,
    config: ChatConfig,
    conversation: Conversation,
    viewer: Uuid,
    /// Newest first, unique by message id.
    messages: Vec<DisplayMessage>,
    composer: String,
    capture: CaptureBuffer,
    recording: bool,
    /// A speech failure alerts once per session, then degrades silently to
    /// typed input.
    speech_alerted: bool,
    silence_deadline: Option<Instant>,
    muted: Arc<AtomicBool>,
    updates: mpsc::UnboundedSender<ChatUpdate>,
}

impl Engine {
    async fn run(
        &mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut store_rx: broadcast::Receiver<StoreEvent>,
        speech_rx: Option<mpsc::UnboundedReceiver<SpeechEvent>>,
        cancel: CancellationToken,
    ) {
        // A session that cannot get the engine's event stream (already
        // claimed) still works as a typed-only chat; a closed channel
        // disables that select branch via the Some pattern.
        let mut speech_rx = match speech_rx {
            Some(rx) => rx,
            None => {
                warn!("speech event stream unavailable, typed input only");
                mpsc::unbounded_channel().1
            }
        };

        loop {
            tokio::select! {
                // Teardown first: nothing may run after the view closes.
                biased;
                _ = cancel.cancelled() => {
                    self.deps.speech.stop();
                    debug!("chat session {} closed", self.conversation.id);
                    return;
                }
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => return,
                },
                event = store_rx.recv() => self.on_store_event(event).await,
                Some(event) = speech_rx.recv() => self.on_speech_event(event).await,
                _ = watchdog(self.silence_deadline) => self.on_silence().await,
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::SetComposer(text) => {
                self.composer = text;
                self.emit(ChatUpdate::Composer(self.composer.clone()));
            }
            Command::Send => self.send_current().await,
            Command::StartRecording => self.start_recording(),
            Command::StopRecording => self.stop_recording(),
            Command::FlushOutbox => self.flush_outbox().await,
            Command::Refresh => {
                if let Err(e) = self.reload_messages().await {
                    warn!("refresh failed: {}", e);
                    self.emit(ChatUpdate::Notice("could not refresh messages".into()));
                }
            }
        }
    }

    // -- message list --

    /// Wholesale refetch-and-translate of the conversation.
    async fn reload_messages(&mut self) -> Result<(), StoreError> {
        let rows = self.deps.store.messages(self.conversation.id).await?;
        let mut display = Vec::with_capacity(rows.len());
        for row in rows {
            display.push(self.to_display(&row).await);
        }
        self.messages = display;
        self.emit(ChatUpdate::Messages(self.messages.clone()));
        Ok(())
    }

    /// Translate a stored (canonical-language) message for the viewer.
    /// Translation failure falls back to the canonical text inside the
    /// translator; one bad translation never fails the list.
    async fn to_display(&self, message: &Message) -> DisplayMessage {
        let viewer_language = self.deps.language.current();
        let text = if viewer_language == Language::CANONICAL {
            message.content.clone()
        } else {
            self.deps
                .translator
                .translate(&message.content, viewer_language)
                .await
                .text
        };
        DisplayMessage {
            id: message.id,
            sender_id: message.sender_id,
            text,
            created_at: message.created_at,
            read_at: message.read_at,
            mine: message.sender_id == self.viewer,
        }
    }

    async fn on_store_event(&mut self, event: Result<StoreEvent, broadcast::error::RecvError>) {
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // Missed pushes; the wholesale refetch restores consistency.
                warn!("store subscription lagged by {} events, refetching", n);
                if let Err(e) = self.reload_messages().await {
                    warn!("refetch after lag failed: {}", e);
                }
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        if event.conversation_id() != Some(self.conversation.id) {
            return;
        }

        match event {
            StoreEvent::MessageCreated { message } => self.on_pushed_message(message).await,
            StoreEvent::ConversationUpdated { conversation } => {
                self.conversation = conversation;
            }
            StoreEvent::OrderUpdated { .. } => {}
        }
    }

    /// Incremental merge of one pushed message. The sender's own insert
    /// also comes back through here; the id check keeps the list free of
    /// duplicates no matter which side lands first.
    async fn on_pushed_message(&mut self, message: Message) {
        if self.messages.iter().any(|m| m.id == message.id) {
            return;
        }
        let display = self.to_display(&message).await;
        let from_counterpart = !display.mine;
        let spoken_text = display.text.clone();

        // Newest first.
        self.messages.insert(0, display);
        self.emit(ChatUpdate::Messages(self.messages.clone()));

        if from_counterpart {
            // The view is open, so the message has been seen.
            if let Err(e) = self.deps.store.mark_read(message.id, Utc::now()).await {
                debug!("read receipt failed for {}: {}", message.id, e);
            }
            // Mute is checked here, at playback time.
            if !self.muted.load(Ordering::Acquire) {
                self.deps
                    .speaker
                    .speak(&spoken_text, self.deps.language.current());
            }
        }
    }

    // -- sending --

    async fn send_current(&mut self) {
        let raw = self.composer.trim().to_string();
        if raw.is_empty() {
            return;
        }

        // Canonicalize, capturing the detected source language.
        let translation = self
            .deps
            .translator
            .translate(&raw, Language::CANONICAL)
            .await;
        if let Some(detected) = translation.detected {
            if detected != self.deps.language.current() {
                self.deps.language.set(detected);
            }
        }

        let new = NewMessage {
            conversation_id: self.conversation.id,
            sender_id: self.viewer,
            content: translation.text,
        };

        match self.try_insert(new.clone()).await {
            Ok(message) => {
                self.clear_composer();
                self.on_pushed_message(message).await;
                // A confirmed insert doubles as a reconnect signal.
                self.flush_outbox().await;
            }
            Err(e) => {
                info!("send failed ({}), queueing message", e);
                self.enqueue(QueuedMessage {
                    conversation_id: new.conversation_id,
                    sender_id: new.sender_id,
                    content: new.content,
                });
            }
        }
    }

    /// Insert with a bound: a hung request is treated as a failed send so
    /// the payload lands in the outbox instead of limbo.
    async fn try_insert(&self, new: NewMessage) -> Result<Message, StoreError> {
        match tokio::time::timeout(self.config.send_timeout, self.deps.store.insert_message(new))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(StoreError::Unavailable("send timed out".into())),
        }
    }

    fn enqueue(&mut self, message: QueuedMessage) {
        match self.deps.outbox.enqueue(&message) {
            Ok(_) => {
                self.clear_composer();
                let pending = self.deps.outbox.len().unwrap_or(0);
                self.emit(ChatUpdate::Queued { pending });
            }
            Err(e) => {
                // Composer keeps the text; the user can retry by hand.
                warn!("outbox enqueue failed: {}", e);
                self.emit(ChatUpdate::Notice("message could not be saved".into()));
            }
        }
    }

    /// Drain the outbox in FIFO order. Each entry leaves the queue the
    /// moment its own insert is confirmed; the first failure ends the pass
    /// and the remainder waits for the next trigger.
    async fn flush_outbox(&mut self) {
        let entries = match self.deps.outbox.entries() {
            Ok(entries) if !entries.is_empty() => entries,
            Ok(_) => return,
            Err(e) => {
                warn!("outbox read failed: {}", e);
                return;
            }
        };

        let total = entries.len();
        let mut delivered = 0usize;
        for entry in entries {
            match self.try_insert(entry.message.clone().into()).await {
                Ok(message) => {
                    if let Err(e) = self.deps.outbox.remove(entry.seq) {
                        warn!("outbox remove failed for seq {}: {}", entry.seq, e);
                    }
                    delivered += 1;
                    self.on_pushed_message(message).await;
                }
                Err(e) => {
                    debug!("flush stopped at seq {}: {}", entry.seq, e);
                    break;
                }
            }
        }

        if delivered > 0 {
            info!("flushed {}/{} queued messages", delivered, total);
            let pending = self.deps.outbox.len().unwrap_or(0);
            self.emit(ChatUpdate::Queued { pending });
        }
    }

    fn clear_composer(&mut self) {
        self.composer.clear();
        self.capture.clear();
        self.emit(ChatUpdate::Composer(String::new()));
    }

    // -- speech --

    fn start_recording(&mut self) {
        if self.recording {
            return;
        }
        if let Err(e) = self.deps.speech.start(self.deps.language.current()) {
            self.alert_speech(&e.to_string());
            self.set_recording(false);
        }
        // The engine confirms with SessionStarted; state flips there.
    }

    fn stop_recording(&mut self) {
        self.deps.speech.stop();
        self.set_recording(false);
    }

    async fn on_speech_event(&mut self, event: SpeechEvent) {
        match event {
            SpeechEvent::SessionStarted => {
                self.capture.clear();
                self.composer.clear();
                self.emit(ChatUpdate::Composer(String::new()));
                self.set_recording(true);
            }
            SpeechEvent::Interim(text) => {
                self.capture.set_interim(&text);
                self.sync_composer();
                self.arm_watchdog();
            }
            SpeechEvent::Final(text) => {
                self.capture.push_final(&text);
                self.sync_composer();
                self.arm_watchdog();
            }
            SpeechEvent::Error(reason) => {
                warn!("speech engine error: {}", reason);
                self.deps.speech.stop();
                self.set_recording(false);
                self.alert_speech(&reason);
            }
            SpeechEvent::SessionEnded => {
                // Finalized text stays in the composer until sent or edited.
                self.set_recording(false);
            }
        }
    }

    async fn on_silence(&mut self) {
        info!("silence watchdog fired, stopping recognition");
        self.deps.speech.stop();
        self.set_recording(false);
    }

    fn sync_composer(&mut self) {
        self.composer = self.capture.composed();
        self.emit(ChatUpdate::Composer(self.composer.clone()));
    }

    fn set_recording(&mut self, recording: bool) {
        if recording {
            self.arm_watchdog();
        } else {
            self.silence_deadline = None;
        }
        if self.recording != recording {
            self.recording = recording;
            self.emit(ChatUpdate::Recording(recording));
        }
    }

    fn arm_watchdog(&mut self) {
        self.silence_deadline = Some(Instant::now() + self.config.silence_timeout);
    }

    fn alert_speech(&mut self, reason: &str) {
        if self.speech_alerted {
            return;
        }
        self.speech_alerted = true;
        self.emit(ChatUpdate::Notice(format!(
            "voice input unavailable ({}), you can still type",
            reason
        )));
    }

    fn emit(&mut self, update: ChatUpdate) {
        let _ = self.updates.send(update);
    }
}

/// Pending forever while no deadline is armed; the select loop only wakes
/// on silence while a recognition session is live.
async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
