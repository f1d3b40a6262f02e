//! Translation gateway. One hard rule at this seam: translation never
//! fails the surrounding operation. Any transport or parse problem falls
//! back to the original text with no detected language, logged and moved
//! past. A chat with one untranslated bubble beats a broken screen.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use sokoni_types::language::Language;

/// Result of a translation request. `detected` is the source language the
/// engine recognized, `None` when detection failed, was unsupported, or the
/// request fell back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub text: String,
    pub detected: Option<Language>,
}

impl Translation {
    pub fn untranslated(text: &str) -> Self {
        Self {
            text: text.to_string(),
            detected: None,
        }
    }
}

#[async_trait]
pub trait Translator: Send + Sync {
    /// Translate `text` into `target`, auto-detecting the source language.
    /// Infallible by contract; implementations fall back internally.
    async fn translate(&self, text: &str, target: Language) -> Translation;
}

// -- HTTP implementation --

#[derive(Serialize)]
struct TranslateRequest<'a> {
    q: &'a str,
    target: &'a str,
}

#[derive(Deserialize)]
struct TranslateResponse {
    translated_text: String,
    detected_language: Option<String>,
}

/// Client for a hosted translation service with language auto-detection.
pub struct HttpTranslator {
    http: reqwest::Client,
    url: String,
}

impl HttpTranslator {
    pub fn new(url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(8))
            .build()
            // Builder only fails on TLS backend misconfiguration; the
            // default rustls backend always constructs.
            .unwrap_or_default();
        Self {
            http,
            url: url.to_string(),
        }
    }

    async fn request(&self, text: &str, target: Language) -> Option<TranslateResponse> {
        let resp = self
            .http
            .post(&self.url)
            .json(&TranslateRequest {
                q: text,
                target: target.tag(),
            })
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            warn!("translation service returned {}", resp.status());
            return None;
        }
        resp.json::<TranslateResponse>().await.ok()
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate(&self, text: &str, target: Language) -> Translation {
        match self.request(text, target).await {
            Some(resp) => Translation {
                text: resp.translated_text,
                detected: resp.detected_language.as_deref().and_then(Language::from_tag),
            },
            None => {
                warn!("translation failed, falling back to original text");
                Translation::untranslated(text)
            }
        }
    }
}

// -- Offline implementation --

/// Word-for-word dictionary translator. Ships as the offline fallback for
/// the demo binary and drives the engine tests deterministically: words
/// found in the dictionary are mapped, everything else passes through.
pub struct DictionaryTranslator {
    /// (word in `from`) -> (word in `to`), both directions registered.
    entries: HashMap<(String, Language), String>,
    /// Words whose presence marks the source language.
    markers: HashMap<String, Language>,
}

impl DictionaryTranslator {
    pub fn new() -> Self {
        let mut translator = Self {
            entries: HashMap::new(),
            markers: HashMap::new(),
        };
        // Enough market vocabulary for the demo to feel real.
        for (en, sw) in [
            ("hello", "habari"),
            ("price", "bei"),
            ("tomatoes", "nyanya"),
            ("maize", "mahindi"),
            ("delivery", "usafirishaji"),
            ("thanks", "asante"),
            ("how", "vipi"),
            ("much", "ngapi"),
        ] {
            translator.add(en, Language::English, sw, Language::Swahili);
        }
        translator
    }

    pub fn add(&mut self, a: &str, lang_a: Language, b: &str, lang_b: Language) {
        self.entries
            .insert((a.to_lowercase(), lang_b), b.to_string());
        self.entries
            .insert((b.to_lowercase(), lang_a), a.to_string());
        self.markers.insert(a.to_lowercase(), lang_a);
        self.markers.insert(b.to_lowercase(), lang_b);
    }

    fn detect(&self, text: &str) -> Option<Language> {
        text.split_whitespace()
            .find_map(|word| self.markers.get(&word.to_lowercase()).copied())
    }
}

impl Default for DictionaryTranslator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Translator for DictionaryTranslator {
    async fn translate(&self, text: &str, target: Language) -> Translation {
        let detected = self.detect(text);
        let translated: Vec<String> = text
            .split_whitespace()
            .map(|word| {
                self.entries
                    .get(&(word.to_lowercase(), target))
                    .cloned()
                    .unwrap_or_else(|| word.to_string())
            })
            .collect();
        Translation {
            text: translated.join(" "),
            detected,
        }
    }
}
