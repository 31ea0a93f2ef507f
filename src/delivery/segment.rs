//! Text segmentation and inter-segment pacing.

use rand::Rng;

use crate::config::SegmentSettings;

/// Split text into segments on the configured sentence-ending characters.
/// Always returns at least one segment.
pub fn split_text(text: &str, settings: &SegmentSettings) -> Vec<String> {
    let split_chars: Vec<char> = settings.split_chars.chars().collect();
    let mut segments = Vec::new();
    let mut buf = String::new();
    for ch in text.chars() {
        buf.push(ch);
        if split_chars.contains(&ch) {
            let segment = buf.trim();
            if !segment.is_empty() {
                segments.push(segment.to_string());
            }
            buf.clear();
        }
    }
    let tail = buf.trim();
    if !tail.is_empty() {
        segments.push(tail.to_string());
    }
    if segments.is_empty() {
        segments.push(text.to_string());
    }
    segments
}

/// How long to wait after sending `text` before the next segment, in
/// seconds: a logarithm of the segment length, or a uniform draw from the
/// configured range.
pub fn segment_interval(text: &str, settings: &SegmentSettings) -> f64 {
    let mut rng = rand::thread_rng();

    if settings.interval_method == "log" {
        let base = if settings.log_base > 1.0 {
            settings.log_base
        } else {
            1.8
        };
        // ASCII counts words; everything else counts alphanumeric chars.
        let n = if text.is_ascii() {
            text.split_whitespace().count()
        } else {
            text.chars().filter(|c| c.is_alphanumeric()).count()
        };
        let val = ((n + 1) as f64).ln() / base.ln();
        return rng.gen_range(val..=val + 0.5);
    }

    let (lo, hi) = parse_interval_range(&settings.interval);
    rng.gen_range(lo..=hi)
}

fn parse_interval_range(raw: &str) -> (f64, f64) {
    let parts: Vec<f64> = raw
        .replace(' ', "")
        .split(',')
        .filter_map(|p| p.parse::<f64>().ok())
        .collect();
    match parts.as_slice() {
        [lo, hi] if hi >= lo => (*lo, *hi),
        _ => (1.5, 3.5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_configured_characters() {
        let settings = SegmentSettings::default();
        let segments = split_text("你好。今天怎麼樣？再聊~", &settings);
        assert_eq!(segments, vec!["你好。", "今天怎麼樣？", "再聊~"]);
    }

    #[test]
    fn text_without_terminators_stays_whole() {
        let settings = SegmentSettings::default();
        assert_eq!(split_text("no terminators here", &settings).len(), 1);
    }

    #[test]
    fn whitespace_only_segments_are_dropped() {
        let settings = SegmentSettings::default();
        let segments = split_text("first。\n\nsecond。", &settings);
        assert_eq!(segments, vec!["first。", "second。"]);
    }

    #[test]
    fn random_interval_stays_in_the_configured_range() {
        let settings = SegmentSettings {
            interval: "0.5,1.0".to_string(),
            ..Default::default()
        };
        for _ in 0..100 {
            let secs = segment_interval("hello", &settings);
            assert!((0.5..=1.0).contains(&secs), "got {}", secs);
        }
    }

    #[test]
    fn malformed_interval_range_uses_the_default() {
        let settings = SegmentSettings {
            interval: "oops".to_string(),
            ..Default::default()
        };
        for _ in 0..20 {
            let secs = segment_interval("hello", &settings);
            assert!((1.5..=3.5).contains(&secs), "got {}", secs);
        }
    }

    #[test]
    fn log_interval_grows_with_length() {
        let settings = SegmentSettings {
            interval_method: "log".to_string(),
            ..Default::default()
        };
        let short: f64 = (0..50)
            .map(|_| segment_interval("two words", &settings))
            .sum::<f64>()
            / 50.0;
        let long: f64 = (0..50)
            .map(|_| {
                segment_interval(
                    "this is a considerably longer sentence with many more words in it",
                    &settings,
                )
            })
            .sum::<f64>()
            / 50.0;
        assert!(long > short, "long {} vs short {}", long, short);
    }
}
