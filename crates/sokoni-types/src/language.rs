use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Languages the marketplace supports for display and speech.
/// Message content is always stored in [`Language::CANONICAL`];
/// everything else is a read-time projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    Swahili,
    French,
    Hindi,
}

impl Language {
    /// The single language message content is persisted in.
    pub const CANONICAL: Language = Language::English;

    /// Short language code, as used by the translation and speech engines.
    pub fn tag(&self) -> &'static str {
        match self {
            Language::English => "en",
            Language::Swahili => "sw",
            Language::French => "fr",
            Language::Hindi => "hi",
        }
    }

    /// Parse a detected language code. Returns `None` for codes we do not
    /// support; an unsupported detection never updates a preference.
    pub fn from_tag(tag: &str) -> Option<Language> {
        // Engines sometimes return region-qualified tags like "en-US".
        let base = tag.split(['-', '_']).next().unwrap_or(tag);
        match base {
            "en" => Some(Language::English),
            "sw" => Some(Language::Swahili),
            "fr" => Some(Language::French),
            "hi" => Some(Language::Hindi),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// The viewer's current display language, passed explicitly to every engine
/// that needs it instead of living in a process-wide singleton.
///
/// Cloning is cheap; all clones share the same state. Engines that need to
/// react to a change (e.g. re-translating a message list) subscribe to the
/// watch channel.
#[derive(Clone)]
pub struct LanguageContext {
    inner: Arc<LanguageInner>,
}

struct LanguageInner {
    current: RwLock<Language>,
    notify: watch::Sender<Language>,
}

impl LanguageContext {
    pub fn new(initial: Language) -> Self {
        let (notify, _) = watch::channel(initial);
        Self {
            inner: Arc::new(LanguageInner {
                current: RwLock::new(initial),
                notify,
            }),
        }
    }

    pub fn current(&self) -> Language {
        *self.inner.current.read().expect("language lock poisoned")
    }

    /// Update the preferred language and notify subscribers. No-op if the
    /// language is unchanged.
    pub fn set(&self, language: Language) {
        {
            let mut current = self.inner.current.write().expect("language lock poisoned");
            if *current == language {
                return;
            }
            *current = language;
        }
        tracing::info!("language preference changed to {}", language);
        let _ = self.inner.notify.send(language);
    }

    pub fn subscribe(&self) -> watch::Receiver<Language> {
        self.inner.notify.subscribe()
    }
}

impl fmt::Debug for LanguageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LanguageContext").field(&self.current()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_tag_strips_region() {
        assert_eq!(Language::from_tag("en-US"), Some(Language::English));
        assert_eq!(Language::from_tag("sw"), Some(Language::Swahili));
        assert_eq!(Language::from_tag("zz"), None);
    }

    #[test]
    fn set_notifies_subscribers() {
        let ctx = LanguageContext::new(Language::English);
        let rx = ctx.subscribe();
        ctx.set(Language::Swahili);
        assert_eq!(ctx.current(), Language::Swahili);
        assert_eq!(*rx.borrow(), Language::Swahili);
    }

    #[test]
    fn set_same_language_is_noop() {
        let ctx = LanguageContext::new(Language::Hindi);
        let rx = ctx.subscribe();
        ctx.set(Language::Hindi);
        assert!(!rx.has_changed().unwrap());
    }
}
