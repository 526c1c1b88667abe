//! Completion/blocker/developer-override marker detection (§4.7).
//!
//! A case-insensitive substring search for a configurable sigil (default
//! `@codor`) followed by one of a closed set of keywords.

const DEFAULT_PREFIX: &str = "@codor";
const ENV_PREFIX_OVERRIDE: &str = "CODOR_CHAT_MARKER_PREFIX";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSignal {
    Done,
    Blocker(String),
    Stop,
    Skip,
    Retry,
    Status,
}

pub fn marker_prefix() -> String {
    std::env::var(ENV_PREFIX_OVERRIDE).unwrap_or_else(|_| DEFAULT_PREFIX.to_string())
}

/// Scans `text` for the first recognized marker, using `prefix` as the
/// sigil. Returns `None` if no marker is present.
pub fn detect_with_prefix(text: &str, prefix: &str) -> Option<ChannelSignal> {
    let lower = text.to_lowercase();
    let needle_prefix = prefix.to_lowercase();
    let idx = lower.find(&needle_prefix)?;
    let lower_rest = lower[idx + needle_prefix.len()..].trim_start();
    let original_rest = text[idx + needle_prefix.len()..].trim_start();

    if let Some(detail) = lower_rest.strip_prefix("blocker:") {
        let offset = original_rest.len() - detail.len();
        return Some(ChannelSignal::Blocker(original_rest[offset..].trim().to_string()));
    }
    let rest = lower_rest;
    if rest.starts_with("done") {
        return Some(ChannelSignal::Done);
    }
    if rest.starts_with("stop") {
        return Some(ChannelSignal::Stop);
    }
    if rest.starts_with("skip") {
        return Some(ChannelSignal::Skip);
    }
    if rest.starts_with("retry") {
        return Some(ChannelSignal::Retry);
    }
    if rest.starts_with("status") {
        return Some(ChannelSignal::Status);
    }
    None
}

pub fn detect(text: &str) -> Option<ChannelSignal> {
    detect_with_prefix(text, &marker_prefix())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_done_marker_case_insensitively() {
        assert_eq!(detect_with_prefix("@CODOR Done, all tests pass", "@codor"), Some(ChannelSignal::Done));
    }

    #[test]
    fn detects_blocker_marker_with_free_text() {
        let signal = detect_with_prefix("@codor blocker: missing API key in env", "@codor");
        assert_eq!(signal, Some(ChannelSignal::Blocker("missing API key in env".to_string())));
    }

    #[test]
    fn detects_developer_override_markers() {
        assert_eq!(detect_with_prefix("@codor stop", "@codor"), Some(ChannelSignal::Stop));
        assert_eq!(detect_with_prefix("@codor skip", "@codor"), Some(ChannelSignal::Skip));
        assert_eq!(detect_with_prefix("@codor retry", "@codor"), Some(ChannelSignal::Retry));
        assert_eq!(detect_with_prefix("@codor status", "@codor"), Some(ChannelSignal::Status));
    }

    #[test]
    fn plain_text_with_no_marker_is_not_detected() {
        assert_eq!(detect_with_prefix("still working on the http client", "@codor"), None);
    }

    #[test]
    fn respects_a_custom_prefix() {
        assert_eq!(detect_with_prefix("##assistant done", "##assistant"), Some(ChannelSignal::Done));
    }
}
