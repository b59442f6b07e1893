use serde_json::Value;

use crate::{Error, Result};

/// Checks the minimum shape every SDP crossing the gateway must have:
/// non-empty, a `v=` version line first, and at least one audio or
/// video media section.
pub fn validate(sdp: &str) -> Result<()> {
    let mut lines = sdp.lines();
    match lines.next() {
        Some(first) if first.trim_end().starts_with("v=") => {}
        _ => return Err(Error::Validation("sdp missing v= line")),
    }

    let has_media = sdp
        .lines()
        .any(|line| line.starts_with("m=audio") || line.starts_with("m=video"));
    if !has_media {
        return Err(Error::Validation("sdp missing m= line"));
    }

    Ok(())
}

/// Browser layers sometimes hand over the whole session description
/// object instead of its `sdp` string. The hub normalizes both shapes
/// to a plain string before the engine ever sees them.
pub fn flatten(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("sdp").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

/// Removes any `m=video` section from a browser answer.
///
/// The telephony leg is audio-only and some downstream devices choke
/// on a rejected video m-line, so the section is dropped wholesale:
/// the `m=video` line and every line up to the next media section.
pub fn strip_video(sdp: &str) -> String {
    let mut kept = Vec::new();
    let mut in_video = false;

    for line in sdp.lines() {
        if line.starts_with("m=") {
            in_video = line.starts_with("m=video");
        }
        if !in_video {
            kept.push(line);
        }
    }

    let mut out = kept.join("\r\n");
    if sdp.ends_with('\n') && !out.is_empty() {
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_requires_version_and_media() {
        assert!(validate("v=0\r\nm=audio 9 RTP/AVP 0\r\n").is_ok());
        assert!(validate("").is_err());
        assert!(validate("o=- 0 0 IN IP4 0.0.0.0\r\nm=audio 9 RTP/AVP 0\r\n").is_err());
        assert!(validate("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\n").is_err());
    }

    #[test]
    fn flatten_accepts_both_shapes() {
        assert_eq!(flatten(&json!("v=0")), Some("v=0".to_string()));
        assert_eq!(
            flatten(&json!({"type": "answer", "sdp": "v=0"})),
            Some("v=0".to_string())
        );
        assert_eq!(flatten(&json!(42)), None);
        assert_eq!(flatten(&json!({"type": "answer"})), None);
    }

    #[test]
    fn strip_video_drops_the_whole_section() {
        let sdp = concat!(
            "v=0\r\n",
            "o=- 1 1 IN IP4 10.0.0.1\r\n",
            "m=audio 30000 RTP/AVP 0\r\n",
            "a=sendrecv\r\n",
            "m=video 30002 UDP/TLS/RTP/SAVPF 96\r\n",
            "a=rtpmap:96 VP8/90000\r\n",
        );

        let stripped = strip_video(sdp);
        assert!(stripped.contains("m=audio"));
        assert!(stripped.contains("a=sendrecv"));
        assert!(!stripped.contains("m=video"));
        assert!(!stripped.contains("VP8"));
    }

    #[test]
    fn strip_video_keeps_audio_only_answers_intact() {
        let sdp = "v=0\r\nm=audio 30000 RTP/AVP 0 8\r\na=sendrecv\r\n";
        assert_eq!(strip_video(sdp), sdp);
    }
}
