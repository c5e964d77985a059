//! Counter records, reserved metadata keys and YYYYMMDD dates.

use chrono::{Datelike, NaiveDate};
use tracing::warn;

/// Newest wordlist schema version this build reads and writes.
pub const SCHEMA_VERSION: u32 = 1;

/// Tokens starting with this byte are reserved for list metadata.
pub const METADATA_PREFIX: u8 = b'.';

/// Scale applied when storing the bias constant in an integer counter.
pub const ROBX_SCALE: f64 = 1_000_000.0;

/// Per-token counters: how many spam and good messages contained the token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CounterRecord {
    /// Spam messages containing the token
    pub spam_count: u32,
    /// Good messages containing the token
    pub good_count: u32,
    /// Date last seen as YYYYMMDD, or 0 when unknown
    pub last_seen: u32,
}

impl CounterRecord {
    /// Record with the given counts and date.
    pub const fn new(spam_count: u32, good_count: u32, last_seen: u32) -> Self {
        Self { spam_count, good_count, last_seen }
    }

    /// Record with counts and no date.
    pub const fn counts(spam_count: u32, good_count: u32) -> Self {
        Self::new(spam_count, good_count, 0)
    }

    /// Both counters are zero.
    pub fn is_empty(&self) -> bool {
        self.spam_count == 0 && self.good_count == 0
    }

    /// Apply signed deltas, clamping each count at zero.
    ///
    /// The second element is true when a count had to be clamped, which means
    /// the store disagrees with the caller about how often the token was seen.
    pub fn adjusted(&self, delta_spam: i64, delta_good: i64) -> (Self, bool) {
        let (spam_count, clamped_spam) = apply_delta(self.spam_count, delta_spam);
        let (good_count, clamped_good) = apply_delta(self.good_count, delta_good);
        let next = Self {
            spam_count,
            good_count,
            last_seen: self.last_seen,
        };
        (next, clamped_spam || clamped_good)
    }

    /// Bias constant record (`.ROBX`).
    pub fn from_robx(robx: f64) -> Self {
        let scaled = (robx * ROBX_SCALE).round().clamp(0.0, u32::MAX as f64);
        Self::counts(scaled as u32, 0)
    }

    /// Bias constant carried by a `.ROBX` record.
    pub fn robx(&self) -> f64 {
        self.spam_count as f64 / ROBX_SCALE
    }
}

/// Add a signed delta to a count, clamping to `[0, u32::MAX]`.
pub fn apply_delta(count: u32, delta: i64) -> (u32, bool) {
    let sum = i64::from(count).saturating_add(delta);
    if sum < 0 {
        (0, true)
    } else if sum > u32::MAX as i64 {
        (u32::MAX, true)
    } else {
        (sum as u32, false)
    }
}

/// Apply deltas to `rec` and log when the store had to clamp.
pub(crate) fn adjust_logged(
    token: &[u8],
    rec: &CounterRecord,
    delta_spam: i64,
    delta_good: i64,
) -> CounterRecord {
    let (next, clamped) = rec.adjusted(delta_spam, delta_good);
    if clamped {
        warn!(
            token = %String::from_utf8_lossy(token),
            spam = rec.spam_count,
            good = rec.good_count,
            delta_spam,
            delta_good,
            "Counter clamped; stored counts disagree with update"
        );
    }
    next
}

/// True for reserved metadata tokens.
pub fn is_metadata_key(token: &[u8]) -> bool {
    token.first() == Some(&METADATA_PREFIX)
}

/// Reserved list-level metadata records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaKey {
    /// Registered message totals (spam_count / good_count)
    MessageCount,
    /// Schema version in spam_count
    WordlistVersion,
    /// Bias constant scaled by [`ROBX_SCALE`] in spam_count
    Robx,
}

impl MetaKey {
    /// Every reserved key.
    pub const ALL: [MetaKey; 3] = [MetaKey::MessageCount, MetaKey::WordlistVersion, MetaKey::Robx];

    /// Token under which the record is stored.
    pub fn token(&self) -> &'static [u8] {
        match self {
            MetaKey::MessageCount => b".MSG_COUNT",
            MetaKey::WordlistVersion => b".WORDLIST_VERSION",
            MetaKey::Robx => b".ROBX",
        }
    }

    /// Reverse lookup from a stored token.
    pub fn from_token(token: &[u8]) -> Option<MetaKey> {
        Self::ALL.iter().copied().find(|k| k.token() == token)
    }
}

/// Today's local date as YYYYMMDD.
pub fn today() -> u32 {
    date_value(chrono::Local::now().date_naive())
}

/// Encode a calendar date as YYYYMMDD.
pub fn date_value(date: NaiveDate) -> u32 {
    date.year().max(0) as u32 * 10_000 + date.month() * 100 + date.day()
}

/// Decode a YYYYMMDD value into a calendar date.
pub fn parse_date(value: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt((value / 10_000) as i32, (value / 100) % 100, value % 100)
}

/// Whether `value` is a real YYYYMMDD calendar date.
pub fn is_valid_date(value: u32) -> bool {
    parse_date(value).is_some()
}
