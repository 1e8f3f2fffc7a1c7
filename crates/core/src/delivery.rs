use std::time::Duration;

use crate::config::DeliveryConfig;

/// Size and rate rules applied to outbound text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryPolicy {
    pub char_limit: usize,
    pub edit_interval: Duration,
    pub edit_threshold: EditThreshold,
    pub max_transport_retries: u32,
}

impl From<&DeliveryConfig> for DeliveryPolicy {
    fn from(config: &DeliveryConfig) -> Self {
        Self {
            char_limit: config.message_char_limit,
            edit_interval: config.edit_interval(),
            edit_threshold: EditThreshold {
                divisor: config.edit_threshold_divisor,
                cap: config.edit_threshold_cap,
            },
            max_transport_retries: config.max_transport_retries,
        }
    }
}

/// Minimum growth, in characters, before an intermediate edit is worth
/// sending: `min(len^2 / divisor, cap)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EditThreshold {
    pub divisor: u64,
    pub cap: usize,
}

impl EditThreshold {
    pub fn threshold(&self, accumulated_len: usize) -> usize {
        let len = accumulated_len as u64;
        let scaled = len.saturating_mul(len) / self.divisor.max(1);
        usize::try_from(scaled).unwrap_or(usize::MAX).min(self.cap)
    }

    pub fn should_edit(&self, accumulated_len: usize, last_edit_len: usize) -> bool {
        accumulated_len.saturating_sub(last_edit_len) >= self.threshold(accumulated_len)
    }
}

/// Splits `text` into pieces of at most `limit` UTF-16 code units, the unit
/// Telegram measures message length in. Pieces end on character boundaries and
/// concatenate back to `text`; empty input yields no pieces.
pub fn split_chunks(text: &str, limit: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while let Some((head, tail)) = split_overflow(rest, limit) {
        chunks.push(head);
        rest = tail;
    }
    if !rest.is_empty() {
        chunks.push(rest);
    }
    chunks
}

/// Splits off the longest prefix that fits in `limit` UTF-16 code units when
/// `text` is longer than `limit`. The prefix always holds at least one
/// character.
pub fn split_overflow(text: &str, limit: usize) -> Option<(&str, &str)> {
    let limit = limit.max(1);
    let mut units = 0;
    for (offset, ch) in text.char_indices() {
        units += ch.len_utf16();
        if units > limit {
            let offset = if offset == 0 { ch.len_utf8() } else { offset };
            return (offset < text.len()).then(|| text.split_at(offset));
        }
    }
    None
}

/// Length in UTF-16 code units.
pub fn text_len(text: &str) -> usize {
    text.chars().map(char::len_utf16).sum()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BannerPhase {
    Responding,
    Finished,
}

/// Header shown above generated text. Not counted against the size limit.
pub fn banner(phase: BannerPhase, model: &str, temperature: f32) -> String {
    let icon = match phase {
        BannerPhase::Responding => "💭",
        BannerPhase::Finished => "🤗",
    };
    format!("{icon} *{model}* (t: {temperature:.2})\n\n")
}

#[cfg(test)]
mod tests {
    use super::{banner, split_chunks, split_overflow, text_len, BannerPhase, EditThreshold};

    #[test]
    fn chunks_respect_limit_and_reassemble() {
        let text = "abcdefghij".repeat(101);
        let limit = 100;
        let chunks = split_chunks(&text, limit);

        assert_eq!(chunks.len(), (text_len(&text) + limit - 1) / limit);
        assert!(chunks.iter().all(|chunk| text_len(chunk) <= limit));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunks_split_on_character_boundaries() {
        let text = "🍓いちご".repeat(5);
        let chunks = split_chunks(&text, 3);

        assert_eq!(chunks[0], "🍓い");
        assert_eq!(chunks[1], "ちご");
        assert!(chunks.iter().all(|chunk| text_len(chunk) <= 3));
        assert_eq!(chunks.concat(), text);
        assert!(split_chunks("", 10).is_empty());
    }

    #[test]
    fn astral_text_fits_the_limit_in_utf16_units() {
        let text = "😀".repeat(4032);
        let limit = 4032;
        let chunks = split_chunks(&text, limit);

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks.len(), (text_len(&text) + limit - 1) / limit);
        for chunk in &chunks {
            let message = format!("{}{chunk}", banner(BannerPhase::Finished, "mini", 0.7));
            assert!(chunk.encode_utf16().count() <= limit);
            assert!(message.encode_utf16().count() <= 4096);
        }
        assert_eq!(chunks.concat(), text);

        assert_eq!(text_len("a😀い"), 4);
        assert_eq!(split_chunks("😀😀", 1), vec!["😀", "😀"]);
    }

    #[test]
    fn overflow_only_when_longer_than_limit() {
        assert_eq!(split_overflow("abcd", 4), None);
        assert_eq!(split_overflow("abcdef", 4), Some(("abcd", "ef")));
        assert_eq!(split_overflow("いちごいちご", 3), Some(("いちご", "いちご")));
        assert_eq!(split_overflow("🍓🍓", 4), None);
        assert_eq!(split_overflow("🍓🍓", 3), Some(("🍓", "🍓")));
    }

    #[test]
    fn edit_threshold_grows_and_caps() {
        let threshold = EditThreshold { divisor: 4000, cap: 100 };

        assert_eq!(threshold.threshold(10), 0);
        assert_eq!(threshold.threshold(200), 10);
        assert_eq!(threshold.threshold(10_000), 100);
        assert!(threshold.should_edit(1, 0));
        assert!(!threshold.should_edit(205, 200));
        assert!(threshold.should_edit(220, 200));

        let mut previous = 0;
        for len in 0..5000 {
            let current = threshold.threshold(len);
            assert!(current >= previous);
            previous = current;
        }
    }

    #[test]
    fn banner_shows_model_and_temperature() {
        assert_eq!(banner(BannerPhase::Responding, "mini", 0.2), "💭 *mini* (t: 0.20)\n\n");
        assert_eq!(banner(BannerPhase::Finished, "mini", 1.0), "🤗 *mini* (t: 1.00)\n\n");
    }
}
