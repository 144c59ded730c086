//! Spoken exit for calls the relay ends on its own
//!
//! When a call reaches its duration limit or the caller stops responding,
//! the assistant says goodbye in the language the caller has been using
//! before the line is hung up. Tenants may replace the built-in wording.

use std::time::Duration;
use tokio::sync::oneshot;

use voice_relay_core::{ExitMessages, TerminationCause};

/// Caller language, as far as exit messages care
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Language {
    #[default]
    English,
    Hindi,
    Telugu,
}

const TELUGU_MARKERS: &[&str] = &[
    "నమస్కారం",
    "ధన్యవాదాలు",
    "మీరు",
    "నేను",
    "ఎలా",
    "ఏమి",
    "కాల్",
    "స్పందన",
];

const HINDI_MARKERS: &[&str] = &[
    "नमस्ते", "धन्यवाद", "आप", "मैं", "कैसे", "क्या", "कॉल", "गतिविधि",
];

impl Language {
    /// Language suggested by one caller transcript fragment
    ///
    /// `None` when the fragment carries no hint, e.g. Devanagari text
    /// without any of the marker words.
    pub fn detect(text: &str) -> Option<Language> {
        if TELUGU_MARKERS.iter().any(|m| text.contains(m)) {
            return Some(Language::Telugu);
        }
        if HINDI_MARKERS.iter().any(|m| text.contains(m)) {
            return Some(Language::Hindi);
        }
        if text.chars().any(|c| c.is_ascii_alphabetic()) {
            return Some(Language::English);
        }
        None
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::English => "english",
            Language::Hindi => "hindi",
            Language::Telugu => "telugu",
        }
    }
}

/// Why the relay is hanging up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    MaxDuration,
    Inactivity,
}

impl ExitReason {
    /// Causes that get a spoken exit
    pub fn for_cause(cause: &TerminationCause) -> Option<Self> {
        match cause {
            TerminationCause::MaxDurationExceeded => Some(ExitReason::MaxDuration),
            TerminationCause::CallerInactive => Some(ExitReason::Inactivity),
            _ => None,
        }
    }
}

fn builtin(reason: ExitReason, language: Language) -> &'static str {
    match (reason, language) {
        (ExitReason::Inactivity, Language::English) => {
            "We haven't detected any activity on the call for over {minutes} minutes. \
             The call will now be disconnected. Thank you for calling."
        }
        (ExitReason::Inactivity, Language::Hindi) => {
            "कॉल पर {minutes} मिनट से अधिक समय से कोई गतिविधि नहीं हुई है। \
             अब कॉल को डिस्कनेक्ट कर दिया जाएगा। कॉल करने के लिए धन्यवाद।"
        }
        (ExitReason::Inactivity, Language::Telugu) => {
            "{minutes} నిమిషాలకు పైగా కాల్‌లో ఎలాంటి స్పందన లేదు. \
             కాల్ ఇప్పుడు డిస్‌కనెక్ట్ అవుతుంది. కాల్ చేసినందుకు ధన్యవాదాలు."
        }
        (ExitReason::MaxDuration, Language::English) => {
            "Sorry, maximum call duration of {minutes} minutes exceeded, \
             will need to cut the call. Thank you for your time."
        }
        (ExitReason::MaxDuration, Language::Hindi) => {
            "क्षमा करें, अधिकतम कॉल अवधि {minutes} मिनट पूरी हो गई है, \
             कॉल काटनी होगी। आपके समय के लिए धन्यवाद।"
        }
        (ExitReason::MaxDuration, Language::Telugu) => {
            "క్షమించండి, గరిష్ట కాల్ వ్యవధి {minutes} నిమిషాలు మించిపోయింది, \
             కాల్‌ను కట్ చేయాల్సి వస్తోంది. మీ సమయానికి ధన్యవాదాలు."
        }
    }
}

fn minutes(limit: Duration) -> u64 {
    (limit.as_secs() + 59) / 60
}

/// Exit wording for one session
pub(crate) struct ExitScript {
    overrides: ExitMessages,
    max_duration: Duration,
    inactivity: Duration,
    language: Language,
}

impl ExitScript {
    pub fn new(overrides: ExitMessages, max_duration: Duration, inactivity: Duration) -> Self {
        Self {
            overrides,
            max_duration,
            inactivity,
            language: Language::default(),
        }
    }

    /// Follow the caller's language from their transcript
    pub fn observe_caller(&mut self, text: &str) {
        if let Some(language) = Language::detect(text) {
            if language != self.language {
                tracing::debug!(language = language.as_str(), "Caller language changed");
                self.language = language;
            }
        }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    /// What the assistant should say
    pub fn message(&self, reason: ExitReason) -> String {
        let (custom, limit) = match reason {
            ExitReason::MaxDuration => (&self.overrides.max_duration, self.max_duration),
            ExitReason::Inactivity => (&self.overrides.inactivity, self.inactivity),
        };
        let template = custom
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| builtin(reason, self.language));
        template.replace("{minutes}", &minutes(limit).to_string())
    }

    /// Text turn that makes the assistant speak the exit message
    pub fn prompt(&self, reason: ExitReason) -> String {
        format!(
            "The call is ending now. Say exactly the following to the caller and nothing else: {}",
            self.message(reason)
        )
    }
}

/// Request for the assistant flow to speak an exit message
///
/// `done` fires once the spoken turn was written to telephony; dropping it
/// means the message could not be sent.
pub(crate) struct Farewell {
    pub reason: ExitReason,
    pub done: oneshot::Sender<()>,
}
