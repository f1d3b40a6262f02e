/// Integration tests: drive a full chat session against the in-process
/// store and scripted speech engine, and watch the update stream the UI
/// would consume.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use sokoni_chat::{ChatConfig, ChatDeps, ChatError, ChatHandle, ChatSession, ChatUpdate};
use sokoni_outbox::Outbox;
use sokoni_speech::scripted::{RecordingSpeaker, ScriptedEngine};
use sokoni_speech::SpeechEvent;
use sokoni_store::memory::MemoryStore;
use sokoni_store::RemoteStore;
use sokoni_translate::{DictionaryTranslator, Translation, Translator};
use sokoni_types::language::{Language, LanguageContext};
use sokoni_types::models::{ConversationKey, NewMessage};

struct Harness {
    store: MemoryStore,
    speech: Arc<ScriptedEngine>,
    speaker: Arc<RecordingSpeaker>,
    language: LanguageContext,
    key: ConversationKey,
    deps: ChatDeps,
}

fn harness_with_translator(translator: Arc<dyn Translator>, language: Language) -> Harness {
    let store = MemoryStore::new();
    let speech = Arc::new(ScriptedEngine::new());
    let speaker = Arc::new(RecordingSpeaker::new());
    let language = LanguageContext::new(language);
    let key = ConversationKey {
        product_id: Uuid::new_v4(),
        producer_id: Uuid::new_v4(),
        buyer_id: Uuid::new_v4(),
    };
    let deps = ChatDeps {
        store: Arc::new(store.clone()),
        translator,
        speech: speech.clone(),
        speaker: speaker.clone(),
        outbox: Arc::new(Outbox::open_in_memory().unwrap()),
        language: language.clone(),
    };
    Harness {
        store,
        speech,
        speaker,
        language,
        key,
        deps,
    }
}

fn harness() -> Harness {
    harness_with_translator(Arc::new(DictionaryTranslator::new()), Language::English)
}

async fn open(h: &Harness) -> (ChatHandle, mpsc::UnboundedReceiver<ChatUpdate>) {
    ChatSession::open(
        h.deps.clone(),
        h.key,
        h.key.buyer_id,
        ChatConfig::default(),
    )
    .await
    .unwrap()
}

/// Wait for the next update matching `pick`, skipping everything else.
async fn wait_for<T>(
    rx: &mut mpsc::UnboundedReceiver<ChatUpdate>,
    pick: impl Fn(&ChatUpdate) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let update = rx.recv().await.expect("session closed");
            if let Some(value) = pick(&update) {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for update")
}

fn messages_of(update: &ChatUpdate) -> Option<Vec<String>> {
    match update {
        ChatUpdate::Messages(list) => Some(list.iter().map(|m| m.text.clone()).collect()),
        _ => None,
    }
}

#[tokio::test]
async fn send_appears_exactly_once_despite_push_echo() {
    let h = harness();
    let (handle, mut rx) = open(&h).await;
    let _ = wait_for(&mut rx, messages_of).await; // initial (empty) list

    handle.set_composer("hello".into());
    handle.send();

    let list = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| !texts.is_empty())
    })
    .await;
    assert_eq!(list, vec!["hello"]);

    // The store's own push echo for the insert must not duplicate the row.
    handle.refresh();
    let list = wait_for(&mut rx, messages_of).await;
    assert_eq!(list, vec!["hello"]);

    let stored = h.store.messages(handle.conversation_id()).await.unwrap();
    assert_eq!(stored.len(), 1);
    handle.close();
}

#[tokio::test]
async fn offline_send_queues_then_flush_delivers_exactly_once() {
    let h = harness();
    let (handle, mut rx) = open(&h).await;
    let _ = wait_for(&mut rx, messages_of).await;

    h.store.set_online(false);
    handle.set_composer("are the mangoes ripe?".into());
    handle.send();

    let pending = wait_for(&mut rx, |u| match u {
        ChatUpdate::Queued { pending } => Some(*pending),
        _ => None,
    })
    .await;
    assert_eq!(pending, 1, "payload parked, not lost");
    assert_eq!(h.deps.outbox.len().unwrap(), 1);

    // Connectivity returns; the flush drains the queue.
    h.store.set_online(true);
    handle.flush_outbox();
    let pending = wait_for(&mut rx, |u| match u {
        ChatUpdate::Queued { pending } => Some(*pending),
        _ => None,
    })
    .await;
    assert_eq!(pending, 0);

    // Exactly once: another flush must not re-send.
    handle.flush_outbox();
    handle.refresh();
    let list = wait_for(&mut rx, messages_of).await;
    assert_eq!(list, vec!["are the mangoes ripe?"]);
    let stored = h.store.messages(handle.conversation_id()).await.unwrap();
    assert_eq!(stored.len(), 1);
    handle.close();
}

/// Translator that refuses one specific text, simulating the gateway's
/// fallback for a single failing message.
struct PoisonedTranslator {
    poison: String,
}

#[async_trait]
impl Translator for PoisonedTranslator {
    async fn translate(&self, text: &str, target: Language) -> Translation {
        if text == self.poison {
            Translation::untranslated(text)
        } else {
            Translation {
                text: format!("{} [{}]", text, target.tag()),
                detected: None,
            }
        }
    }
}

#[tokio::test]
async fn one_failed_translation_does_not_fail_the_load() {
    let h = harness_with_translator(
        Arc::new(PoisonedTranslator {
            poison: "second".into(),
        }),
        Language::Swahili,
    );

    // Backlog written by the producer before the buyer opens the chat.
    let conversation = h.store.create_conversation(&h.key).await.unwrap();
    for content in ["first", "second", "third"] {
        h.store
            .insert_message(NewMessage {
                conversation_id: conversation.id,
                sender_id: h.key.producer_id,
                content: content.into(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (handle, mut rx) = open(&h).await;
    let list = wait_for(&mut rx, messages_of).await;
    // Newest first; the poisoned message alone stays canonical.
    assert_eq!(list, vec!["third [sw]", "second", "first [sw]"]);
    handle.close();
}

#[tokio::test]
async fn speech_finals_compose_and_send() {
    let h = harness();
    let (handle, mut rx) = open(&h).await;
    let _ = wait_for(&mut rx, messages_of).await;

    handle.start_recording();
    let recording = wait_for(&mut rx, |u| match u {
        ChatUpdate::Recording(r) => Some(*r),
        _ => None,
    })
    .await;
    assert!(recording);

    h.speech.push(SpeechEvent::Final("hello".into()));
    h.speech.push(SpeechEvent::Final("hello".into())); // engine re-delivery
    h.speech.push(SpeechEvent::Interim("wor".into()));
    h.speech.push(SpeechEvent::Final("world".into()));

    let composer = wait_for(&mut rx, |u| match u {
        ChatUpdate::Composer(text) if text == "hello world" => Some(text.clone()),
        _ => None,
    })
    .await;
    assert_eq!(composer, "hello world");

    handle.stop_recording();
    handle.send();
    let list = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| !texts.is_empty())
    })
    .await;
    assert_eq!(list, vec!["hello world"]);

    let stored = h.store.messages(handle.conversation_id()).await.unwrap();
    assert_eq!(stored[0].content, "hello world");
    handle.close();
}

#[tokio::test]
async fn detected_language_updates_preference() {
    let h = harness(); // viewer preference starts at English
    let (handle, mut rx) = open(&h).await;
    let _ = wait_for(&mut rx, messages_of).await;

    // Composed in Swahili; the dictionary detects it and canonicalizes.
    handle.set_composer("habari bei".into());
    handle.send();
    let list = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| !texts.is_empty())
    })
    .await;

    // Stored canonical, displayed for the (now Swahili) viewer.
    let stored = h.store.messages(handle.conversation_id()).await.unwrap();
    assert_eq!(stored[0].content, "hello price");
    assert_eq!(h.language.current(), Language::Swahili);
    assert_eq!(list, vec!["habari bei"]);
    handle.close();
}

#[tokio::test]
async fn mute_gates_playback_immediately() {
    let h = harness();
    let (handle, mut rx) = open(&h).await;
    let _ = wait_for(&mut rx, messages_of).await;
    let conversation_id = handle.conversation_id();

    // Counterpart message arrives: spoken aloud.
    h.store
        .insert_message(NewMessage {
            conversation_id,
            sender_id: h.key.producer_id,
            content: "price is 300 per crate".into(),
        })
        .await
        .unwrap();
    let _ = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| texts.len() == 1)
    })
    .await;
    assert_eq!(h.speaker.spoken().len(), 1);

    // Mute cuts in-flight playback at once.
    handle.set_muted(true);
    assert_eq!(h.speaker.stop_count(), 1);

    // And the next message stays silent.
    h.store
        .insert_message(NewMessage {
            conversation_id,
            sender_id: h.key.producer_id,
            content: "can go to 280".into(),
        })
        .await
        .unwrap();
    let _ = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| texts.len() == 2)
    })
    .await;
    assert_eq!(h.speaker.spoken().len(), 1, "muted message not spoken");

    // Unmute: playback resumes on the next message.
    handle.set_muted(false);
    h.store
        .insert_message(NewMessage {
            conversation_id,
            sender_id: h.key.producer_id,
            content: "deal".into(),
        })
        .await
        .unwrap();
    let _ = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| texts.len() == 3)
    })
    .await;
    assert_eq!(h.speaker.spoken().len(), 2);
    handle.close();
}

#[tokio::test]
async fn incoming_counterpart_message_gets_read_receipt() {
    let h = harness();
    let (handle, mut rx) = open(&h).await;
    let _ = wait_for(&mut rx, messages_of).await;

    h.store
        .insert_message(NewMessage {
            conversation_id: handle.conversation_id(),
            sender_id: h.key.producer_id,
            content: "offer stands until Friday".into(),
        })
        .await
        .unwrap();
    let _ = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| texts.len() == 1)
    })
    .await;

    let stored = h.store.messages(handle.conversation_id()).await.unwrap();
    assert!(stored[0].read_at.is_some(), "open view marks incoming read");
    handle.close();
}

#[tokio::test]
async fn speech_start_failure_alerts_once_and_keeps_typing_usable() {
    let h = harness();
    h.speech.deny_permission();
    let (handle, mut rx) = open(&h).await;
    let _ = wait_for(&mut rx, messages_of).await;

    handle.start_recording();
    let notice = wait_for(&mut rx, |u| match u {
        ChatUpdate::Notice(text) => Some(text.clone()),
        _ => None,
    })
    .await;
    assert!(notice.contains("voice input unavailable"));

    // Second attempt stays quiet, and typed input still works.
    handle.start_recording();
    handle.set_composer("typing instead".into());
    handle.send();
    let list = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| !texts.is_empty())
    })
    .await;
    assert_eq!(list, vec!["typing instead"]);
    handle.close();
}

#[tokio::test(start_paused = true)]
async fn silence_watchdog_stops_recognition() {
    let h = harness();
    let (handle, mut rx) = open(&h).await;
    let _ = wait_for(&mut rx, messages_of).await;

    handle.start_recording();
    let _ = wait_for(&mut rx, |u| match u {
        ChatUpdate::Recording(true) => Some(()),
        _ => None,
    })
    .await;
    h.speech.push(SpeechEvent::Final("hello".into()));
    let _ = wait_for(&mut rx, |u| match u {
        ChatUpdate::Composer(text) if text == "hello" => Some(()),
        _ => None,
    })
    .await;

    // Nothing more is said; the watchdog fires after six quiet seconds.
    tokio::time::advance(Duration::from_secs(7)).await;
    let _ = wait_for(&mut rx, |u| match u {
        ChatUpdate::Recording(false) => Some(()),
        _ => None,
    })
    .await;
    assert!(!h.speech.is_recording());

    // Finalized text survives as composer content.
    handle.send();
    let list = wait_for(&mut rx, |u| {
        messages_of(u).filter(|texts| !texts.is_empty())
    })
    .await;
    assert_eq!(list, vec!["hello"]);
    handle.close();
}

#[tokio::test]
async fn resolution_failure_is_fatal_to_the_view() {
    let h = harness();
    h.store.set_online(false);
    let err = ChatSession::open(
        h.deps.clone(),
        h.key,
        h.key.buyer_id,
        ChatConfig::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ChatError::Resolve(_)));

    // The retry affordance: reopen once the store is reachable.
    h.store.set_online(true);
    assert!(open(&h).await.0.conversation_id() != Uuid::nil());
}

#[tokio::test]
async fn both_parties_resolve_the_same_conversation() {
    let h = harness();
    let (buyer_handle, _buyer_rx) = open(&h).await;

    let producer_deps = ChatDeps {
        outbox: Arc::new(Outbox::open_in_memory().unwrap()),
        ..h.deps.clone()
    };
    let (producer_handle, _producer_rx) = ChatSession::open(
        producer_deps,
        h.key,
        h.key.producer_id,
        ChatConfig::default(),
    )
    .await
    .unwrap();

    assert_eq!(
        buyer_handle.conversation_id(),
        producer_handle.conversation_id()
    );
}
