//! Demo binary. Wires the order tracker and a chat session against either
//! the hosted store (`SOKONI_STORE_URL`) or an in-process store, and in the
//! latter case walks through a scripted negotiation: voice-composed
//! question, producer reply with spoken playback, an offline send parked in
//! the outbox, and the flush once connectivity returns. Orders advance in
//! the background on the poll timer the whole time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use sokoni_chat::{ChatConfig, ChatDeps, ChatSession, ChatUpdate};
use sokoni_orders::{OrderConfig, OrderTracker, OrderUpdate};
use sokoni_outbox::Outbox;
use sokoni_speech::scripted::ScriptedEngine;
use sokoni_speech::{SpeechEvent, TextToSpeech};
use sokoni_store::RemoteStore;
use sokoni_store::memory::MemoryStore;
use sokoni_store::rest::RestStore;
use sokoni_translate::{DictionaryTranslator, HttpTranslator, Translator};
use sokoni_types::language::{Language, LanguageContext};
use sokoni_types::models::{ConversationKey, NewMessage, Order, OrderItem, OrderStatus};

/// Speaker that logs instead of playing audio; the demo runs headless.
struct LoggingSpeaker;

impl TextToSpeech for LoggingSpeaker {
    fn speak(&self, text: &str, language: Language) {
        info!("[speaker {}] {}", language, text);
    }

    fn stop(&self) {
        info!("[speaker] playback stopped");
    }
}

fn env_uuid(name: &str) -> Uuid {
    std::env::var(name)
        .ok()
        .and_then(|v| Uuid::parse_str(&v).ok())
        .unwrap_or_else(Uuid::new_v4)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sokoni=debug".into()),
        )
        .init();

    // Config
    let language = std::env::var("SOKONI_LANGUAGE")
        .ok()
        .and_then(|tag| Language::from_tag(&tag))
        .unwrap_or(Language::Swahili);
    let outbox_path =
        std::env::var("SOKONI_OUTBOX_PATH").unwrap_or_else(|_| "sokoni-outbox.db".into());
    let poll_secs: u64 = std::env::var("SOKONI_POLL_SECS")
        .unwrap_or_else(|_| "3".into())
        .parse()?;
    let buyer_id = env_uuid("SOKONI_BUYER_ID");
    let producer_id = env_uuid("SOKONI_PRODUCER_ID");
    let product_id = env_uuid("SOKONI_PRODUCT_ID");

    let translator: Arc<dyn Translator> = match std::env::var("SOKONI_TRANSLATE_URL") {
        Ok(url) => Arc::new(HttpTranslator::new(&url)),
        Err(_) => Arc::new(DictionaryTranslator::new()),
    };

    // The simulation handle stays None against the hosted store; the
    // scripted walkthrough needs to play the producer's side.
    let (store, simulation): (Arc<dyn RemoteStore>, Option<MemoryStore>) =
        match std::env::var("SOKONI_STORE_URL") {
            Ok(url) => {
                info!("connecting to hosted store at {}", url);
                (Arc::new(RestStore::connect(&url)?), None)
            }
            Err(_) => {
                let memory = MemoryStore::new();
                seed_orders(&memory, buyer_id).await;
                (Arc::new(memory.clone()), Some(memory))
            }
        };

    // Order tracker
    let (orders, mut order_rx) = OrderTracker::open(
        store.clone(),
        buyer_id,
        OrderConfig {
            poll_interval: Duration::from_secs(poll_secs),
        },
    )
    .await?;
    tokio::spawn(async move {
        while let Some(update) = order_rx.recv().await {
            match update {
                OrderUpdate::Orders(views) => info!("[orders] {} on screen", views.len()),
                OrderUpdate::Advanced(view) => info!(
                    "[orders] {} now {} ({:.0}%)",
                    view.id,
                    view.status,
                    view.progress * 100.0
                ),
                OrderUpdate::AlreadyDelivered(id) => info!("[orders] {} already delivered", id),
                OrderUpdate::AdvanceFailed { order_id, reason } => {
                    info!("[orders] advance of {} failed: {}", order_id, reason)
                }
            }
        }
    });

    // Chat session for the buyer
    let speech = Arc::new(ScriptedEngine::new());
    let deps = ChatDeps {
        store: store.clone(),
        translator,
        speech: speech.clone(),
        speaker: Arc::new(LoggingSpeaker),
        outbox: Arc::new(Outbox::open(&PathBuf::from(&outbox_path))?),
        language: LanguageContext::new(language),
    };
    let key = ConversationKey {
        product_id,
        producer_id,
        buyer_id,
    };
    let (chat, mut chat_rx) = ChatSession::open(deps, key, buyer_id, ChatConfig::default()).await?;
    info!("chat open, conversation {}", chat.conversation_id());
    tokio::spawn(async move {
        while let Some(update) = chat_rx.recv().await {
            match update {
                ChatUpdate::Messages(list) => {
                    if let Some(newest) = list.first() {
                        info!("[chat] {} messages, newest: {}", list.len(), newest.text);
                    }
                }
                ChatUpdate::Composer(text) if !text.is_empty() => {
                    info!("[chat] composer: {}", text)
                }
                ChatUpdate::Composer(_) => {}
                ChatUpdate::Recording(on) => info!("[chat] recording: {}", on),
                ChatUpdate::Queued { pending } => info!("[chat] {} queued for later", pending),
                ChatUpdate::Notice(text) => info!("[chat] notice: {}", text),
            }
        }
    });

    match simulation {
        Some(memory) => {
            run_walkthrough(&chat, &speech, &memory, producer_id).await;
            info!("walkthrough complete");
        }
        None => {
            info!("running against hosted store, ctrl-c to exit");
            tokio::signal::ctrl_c().await?;
        }
    }

    chat.close();
    orders.close();
    Ok(())
}

/// A couple of in-flight orders so the poll timer has something to move.
async fn seed_orders(store: &MemoryStore, buyer_id: Uuid) {
    for (name, quantity, unit_price, status) in [
        ("tomatoes", 4u32, 250i64, OrderStatus::Ordered),
        ("maize", 2, 1800, OrderStatus::Shipped),
    ] {
        let item = OrderItem {
            product_id: Uuid::new_v4(),
            product_name: name.into(),
            quantity,
            unit_price,
        };
        store
            .put_order(Order {
                id: Uuid::new_v4(),
                buyer_id,
                total: item.line_total(),
                items: vec![item],
                status,
                updated_at: chrono::Utc::now(),
            })
            .await;
    }
}

async fn run_walkthrough(
    chat: &sokoni_chat::ChatHandle,
    speech: &ScriptedEngine,
    memory: &MemoryStore,
    producer_id: Uuid,
) {
    let pause = Duration::from_millis(400);

    // Voice-composed opening question.
    chat.start_recording();
    tokio::time::sleep(pause).await;
    speech.push(SpeechEvent::Final("habari".into()));
    speech.push(SpeechEvent::Final("bei ngapi".into()));
    tokio::time::sleep(pause).await;
    chat.stop_recording();
    chat.send();
    tokio::time::sleep(pause).await;

    // The producer answers; the open view reads it aloud and marks it read.
    let _ = memory
        .insert_message(NewMessage {
            conversation_id: chat.conversation_id(),
            sender_id: producer_id,
            content: "price is 300 per crate, delivery on Friday".into(),
        })
        .await;
    tokio::time::sleep(pause).await;

    // Connectivity drops mid-negotiation; the reply waits in the outbox.
    memory.set_online(false);
    chat.set_composer("can you do 280?".into());
    chat.send();
    tokio::time::sleep(pause).await;

    memory.set_online(true);
    chat.flush_outbox();
    tokio::time::sleep(pause).await;

    // Leave the poll timer a few more ticks to finish the orders.
    tokio::time::sleep(Duration::from_secs(7)).await;
}
