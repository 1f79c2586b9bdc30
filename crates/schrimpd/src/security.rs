//! Per-message acceptance checks: rate limiting, duplicate escalation and
//! content filtering.
//!
//! State is keyed by display name, created lazily on an identity's first
//! message and dropped at eviction. One coarse lock guards the whole map;
//! per-message work under it is a few comparisons, so contention is not a
//! concern at chat scale.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::Deserialize;

pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_RATE_MAX: usize = 15;
pub const DEFAULT_DUP_LIMIT: u32 = 3;
pub const DEFAULT_MAX_MSG_CHARS: usize = 500;

const DEFAULT_BANNED_WORDS: [&str; 5] = ["spam", "hack", "exploit", "ddos", "attack"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlongPolicy {
    Reject,
    Truncate,
}

impl std::str::FromStr for OverlongPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "truncate" => Ok(Self::Truncate),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BannedWordPolicy {
    Reject,
    Mask,
}

impl std::str::FromStr for BannedWordPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "mask" => Ok(Self::Mask),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub rate_window: Duration,
    pub rate_max: usize,
    pub dup_limit: u32,
    pub max_message_chars: usize,
    pub overlong: OverlongPolicy,
    pub banned_mode: BannedWordPolicy,
    /// Lowercase; matched as case-insensitive substrings.
    pub banned_words: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_window: DEFAULT_RATE_WINDOW,
            rate_max: DEFAULT_RATE_MAX,
            dup_limit: DEFAULT_DUP_LIMIT,
            max_message_chars: DEFAULT_MAX_MSG_CHARS,
            overlong: OverlongPolicy::Reject,
            banned_mode: BannedWordPolicy::Reject,
            banned_words: DEFAULT_BANNED_WORDS
                .iter()
                .map(|w| w.to_string())
                .collect(),
        }
    }
}

/// Load a banned-words file: a JSON array of strings.
pub fn load_banned_words(path: &str) -> anyhow::Result<Vec<String>> {
    let s = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read banned words file {path:?}: {e}"))?;
    let words: Vec<String> = serde_json::from_str(&s)
        .map_err(|e| anyhow::anyhow!("failed to parse banned words file {path:?}: {e}"))?;
    Ok(words
        .into_iter()
        .map(|w| w.trim().to_ascii_lowercase())
        .filter(|w| !w.is_empty())
        .collect())
}

/// Pipeline outcome for one inbound message. `Rejected` goes privately back
/// to the sender; the message is never broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(String),
    Rejected(String),
}

#[derive(Debug, Default)]
struct IdentityState {
    /// Accepted-message timestamps inside the sliding window, oldest first.
    stamps: VecDeque<Instant>,
    last_text: String,
    /// Consecutive occurrences of `last_text`, the first one included.
    repeats: u32,
}

#[derive(Debug)]
pub struct Pipeline {
    cfg: SecurityConfig,
    state: tokio::sync::Mutex<HashMap<String, IdentityState>>,
}

impl Pipeline {
    pub fn new(cfg: SecurityConfig) -> Self {
        Self {
            cfg,
            state: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, identity: &str, text: &str) -> Verdict {
        self.check_at(identity, text, Instant::now()).await
    }

    async fn check_at(&self, identity: &str, text: &str, now: Instant) -> Verdict {
        if !self.cfg.enabled {
            return Verdict::Accepted(text.to_string());
        }

        let mut map = self.state.lock().await;
        let st = map.entry(identity.to_string()).or_default();

        // Rejected messages never stamp the window.
        if rate_limited(st, &self.cfg, now) {
            return Verdict::Rejected("Rate limit exceeded. Please slow down.".to_string());
        }

        // Duplicate escalation: the N-th identical consecutive text is
        // rejected once N reaches the limit; any different text resets.
        if text == st.last_text {
            st.repeats = st.repeats.saturating_add(1);
        } else {
            st.last_text = text.to_string();
            st.repeats = 1;
        }
        if st.repeats >= self.cfg.dup_limit {
            return Verdict::Rejected("Spam detected: too many duplicate messages.".to_string());
        }

        // Content filter: length first, then banned substrings.
        let mut out = text.to_string();
        if out.chars().count() > self.cfg.max_message_chars {
            match self.cfg.overlong {
                OverlongPolicy::Reject => {
                    return Verdict::Rejected(format!(
                        "Message too long (max {} chars).",
                        self.cfg.max_message_chars
                    ));
                }
                OverlongPolicy::Truncate => {
                    out = out.chars().take(self.cfg.max_message_chars).collect();
                    out.push_str(" [truncated]");
                }
            }
        }

        if contains_banned(&out, &self.cfg.banned_words) {
            match self.cfg.banned_mode {
                BannedWordPolicy::Reject => {
                    return Verdict::Rejected(
                        "Message contains inappropriate content.".to_string(),
                    );
                }
                BannedWordPolicy::Mask => {
                    out = mask_banned(&out, &self.cfg.banned_words);
                }
            }
        }

        st.stamps.push_back(now);
        Verdict::Accepted(out)
    }

    /// Check for a built-in command line. Commands count toward the rate
    /// window like any other message, but they are not chat: they never
    /// participate in duplicate tracking or content filtering, and they do
    /// not disturb the duplicate counter of surrounding chat messages.
    pub async fn check_command(&self, identity: &str, text: &str) -> Verdict {
        self.check_command_at(identity, text, Instant::now()).await
    }

    async fn check_command_at(&self, identity: &str, text: &str, now: Instant) -> Verdict {
        if !self.cfg.enabled {
            return Verdict::Accepted(text.to_string());
        }

        let mut map = self.state.lock().await;
        let st = map.entry(identity.to_string()).or_default();
        if rate_limited(st, &self.cfg, now) {
            return Verdict::Rejected("Rate limit exceeded. Please slow down.".to_string());
        }
        st.stamps.push_back(now);
        Verdict::Accepted(text.to_string())
    }

    /// Drop an identity's state when its session is evicted.
    pub async fn forget(&self, identity: &str) {
        self.state.lock().await.remove(identity);
    }
}

/// Prune stamps older than the window, then report whether the identity has
/// hit its per-window limit.
fn rate_limited(st: &mut IdentityState, cfg: &SecurityConfig, now: Instant) -> bool {
    while let Some(front) = st.stamps.front() {
        if now.duration_since(*front) >= cfg.rate_window {
            st.stamps.pop_front();
        } else {
            break;
        }
    }
    st.stamps.len() >= cfg.rate_max
}

fn contains_banned(text: &str, words: &[String]) -> bool {
    if words.is_empty() {
        return false;
    }
    let hay = text.to_ascii_lowercase();
    words.iter().any(|w| !w.is_empty() && hay.contains(w.as_str()))
}

/// Replace every banned substring with `*` repeated to its length.
///
/// Matching is ASCII case-insensitive, so matched byte ranges are pure ASCII
/// and replacement stays on char boundaries.
fn mask_banned(text: &str, words: &[String]) -> String {
    let hay = text.to_ascii_lowercase();
    let mut bytes = text.as_bytes().to_vec();
    for w in words {
        if w.is_empty() {
            continue;
        }
        let mut start = 0;
        while let Some(pos) = hay[start..].find(w.as_str()) {
            let at = start + pos;
            bytes[at..at + w.len()].fill(b'*');
            start = at + w.len();
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
