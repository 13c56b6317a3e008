//! Extended-attribute decoding and the recursion guard.
//!
//! Handler writes stamp their source documents with a reserved xattr
//! `{cas, digest, timers[]}`. When such a mutation comes back on the
//! stream we can tell whether the handler itself authored it (suppress,
//! to stop infinite recursion) and harvest any timers it scheduled.

use serde::Deserialize;

/// Error type for xattr section decoding.
#[derive(Debug, PartialEq, Eq)]
pub enum XattrError {
    /// Value too short for the declared xattr section.
    Truncated,
    /// A frame length points past the section end.
    BadFrame,
}

impl std::fmt::Display for XattrError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            XattrError::Truncated => write!(f, "xattr section truncated"),
            XattrError::BadFrame => write!(f, "xattr frame overruns section"),
        }
    }
}

impl std::error::Error for XattrError {}

/// Metadata the handler attaches to documents it writes.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct XattrMetadata {
    /// CAS of the handler's own write, hex encoded.
    #[serde(default)]
    pub cas: String,
    /// crc32 of the document body as the handler wrote it.
    #[serde(default)]
    pub digest: u32,
    /// Stored timer strings, `<opaque>::<dueTs>::<callback>`.
    #[serde(default)]
    pub timers: Vec<String>,
}

impl XattrMetadata {
    /// Decode the hex CAS; tolerates an `0x` prefix.
    pub fn cas_value(&self) -> Option<u64> {
        let raw = self.cas.trim_start_matches("0x");
        u64::from_str_radix(raw, 16).ok()
    }
}

/// Split a JSON+XATTR value into its xattr section and document body.
///
/// Layout: 4-byte big-endian section length, then io-vector frames, then
/// the body. Each frame is a 4-byte big-endian length followed by
/// `key\0value\0`.
pub fn split_xattrs(value: &[u8]) -> Result<(&[u8], &[u8]), XattrError> {
    if value.len() < 4 {
        return Err(XattrError::Truncated);
    }
    let total = u32::from_be_bytes([value[0], value[1], value[2], value[3]]) as usize;
    if value.len() < 4 + total {
        return Err(XattrError::Truncated);
    }
    Ok((&value[4..4 + total], &value[4 + total..]))
}

/// Find one xattr value by key inside the io-vector section.
pub fn find_xattr<'a>(section: &'a [u8], key: &str) -> Result<Option<&'a [u8]>, XattrError> {
    let mut pos = 0usize;
    while pos < section.len() {
        if section.len() - pos < 4 {
            return Err(XattrError::BadFrame);
        }
        let frame_len = u32::from_be_bytes([
            section[pos],
            section[pos + 1],
            section[pos + 2],
            section[pos + 3],
        ]) as usize;
        let start = pos + 4;
        let end = start.checked_add(frame_len).ok_or(XattrError::BadFrame)?;
        if end > section.len() || frame_len == 0 {
            return Err(XattrError::BadFrame);
        }
        let frame = &section[start..end];
        // frame = key\0value\0
        if let Some(null_at) = frame.iter().position(|&b| b == 0) {
            if &frame[..null_at] == key.as_bytes() {
                let value = &frame[null_at + 1..];
                let value = value.strip_suffix(&[0u8]).unwrap_or(value);
                return Ok(Some(value));
            }
        }
        pos = end;
    }
    Ok(None)
}

/// Encode an io-vector xattr section plus body (used by tests and the
/// demo feed to fabricate handler-authored mutations).
pub fn encode_with_xattrs(pairs: &[(&str, &[u8])], body: &[u8]) -> Vec<u8> {
    let mut section = Vec::new();
    for (key, value) in pairs {
        let frame_len = key.len() + 1 + value.len() + 1;
        section.extend_from_slice(&(frame_len as u32).to_be_bytes());
        section.extend_from_slice(key.as_bytes());
        section.push(0);
        section.extend_from_slice(value);
        section.push(0);
    }
    let mut out = Vec::with_capacity(4 + section.len() + body.len());
    out.extend_from_slice(&(section.len() as u32).to_be_bytes());
    out.extend_from_slice(&section);
    out.extend_from_slice(body);
    out
}

/// What to do with one JSON+XATTR mutation.
#[derive(Debug, PartialEq)]
pub struct GuardVerdict<'a> {
    /// Forward the body to the worker?
    pub forward: bool,
    /// True when suppression fired because the handler authored the event.
    pub recursive: bool,
    /// Stored timer strings to enqueue, regardless of forwarding.
    pub timers: Vec<String>,
    /// Document body with the xattr section stripped.
    pub body: &'a [u8],
}

/// Apply the recursion guard to a JSON+XATTR mutation value.
///
/// The mutation is recursive exactly when the handler's recorded CAS
/// matches the event CAS; a CAS mismatch with a matching digest means a
/// replayed handler write with no new content, which is also not
/// forwarded. `allow_recursive` (handler setting) forwards everything.
pub fn evaluate_mutation<'a>(
    value: &'a [u8],
    event_cas: u64,
    xattr_prefix: &str,
    allow_recursive: bool,
) -> Result<GuardVerdict<'a>, XattrError> {
    let (section, body) = split_xattrs(value)?;
    let meta = match find_xattr(section, xattr_prefix)? {
        Some(raw) => serde_json::from_slice::<XattrMetadata>(raw).unwrap_or_default(),
        None => XattrMetadata::default(),
    };

    let Some(xattr_cas) = meta.cas_value() else {
        // No handler metadata: plain user write.
        return Ok(GuardVerdict {
            forward: true,
            recursive: false,
            timers: Vec::new(),
            body,
        });
    };

    if allow_recursive {
        return Ok(GuardVerdict {
            forward: true,
            recursive: false,
            timers: meta.timers,
            body,
        });
    }

    if xattr_cas == event_cas {
        return Ok(GuardVerdict {
            forward: false,
            recursive: true,
            timers: meta.timers,
            body,
        });
    }

    let digest = crc32fast::hash(body);
    if digest != meta.digest {
        // Content diverged since the handler write: a real user update.
        Ok(GuardVerdict {
            forward: true,
            recursive: false,
            timers: meta.timers,
            body,
        })
    } else {
        Ok(GuardVerdict {
            forward: false,
            recursive: true,
            timers: meta.timers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREFIX: &str = "eventing";

    fn handler_value(cas: u64, body: &[u8], timers: &[&str]) -> Vec<u8> {
        let timer_list: Vec<String> = timers.iter().map(|s| s.to_string()).collect();
        let meta = serde_json::json!({
            "cas": format!("{:x}", cas),
            "digest": crc32fast::hash(body),
            "timers": timer_list,
        });
        encode_with_xattrs(
            &[(PREFIX, meta.to_string().as_bytes())],
            body,
        )
    }

    #[test]
    fn author_cas_match_suppresses_and_harvests_timers() {
        let value = handler_value(0xABCD, b"v", &["o::2025-01-01T00:00:01Z::cb"]);
        let verdict = evaluate_mutation(&value, 0xABCD, PREFIX, false).unwrap();
        assert!(!verdict.forward);
        assert!(verdict.recursive);
        assert_eq!(verdict.timers, vec!["o::2025-01-01T00:00:01Z::cb"]);
        assert_eq!(verdict.body, b"v");
    }

    #[test]
    fn diverged_content_is_forwarded() {
        // Handler wrote body "old"; a user then overwrote with "new"
        // (different CAS, different digest).
        let meta = serde_json::json!({
            "cas": format!("{:x}", 0x1111u64),
            "digest": crc32fast::hash(b"old"),
            "timers": ["o::2025-01-01T00:00:01Z::cb"],
        });
        let value = encode_with_xattrs(&[(PREFIX, meta.to_string().as_bytes())], b"new");
        let verdict = evaluate_mutation(&value, 0x2222, PREFIX, false).unwrap();
        assert!(verdict.forward);
        assert!(!verdict.recursive);
        assert_eq!(verdict.timers.len(), 1);
    }

    #[test]
    fn replayed_handler_write_enqueues_timers_only() {
        // CAS differs (stream replay after failover) but the digest still
        // matches the handler's write: nothing new happened.
        let value = handler_value(0x1111, b"same", &[]);
        let verdict = evaluate_mutation(&value, 0x9999, PREFIX, false).unwrap();
        assert!(!verdict.forward);
        assert!(verdict.recursive);
    }

    #[test]
    fn missing_metadata_forwards() {
        let value = encode_with_xattrs(&[("sync", b"{}")], b"{\"x\":1}");
        let verdict = evaluate_mutation(&value, 1, PREFIX, false).unwrap();
        assert!(verdict.forward);
        assert!(verdict.timers.is_empty());
        assert_eq!(verdict.body, b"{\"x\":1}");
    }

    #[test]
    fn recursive_setting_bypasses_suppression() {
        let value = handler_value(0xABCD, b"v", &["o::2025-01-01T00:00:01Z::cb"]);
        let verdict = evaluate_mutation(&value, 0xABCD, PREFIX, true).unwrap();
        assert!(verdict.forward);
        assert_eq!(verdict.timers.len(), 1);
    }

    #[test]
    fn truncated_section_is_an_error() {
        assert_eq!(split_xattrs(b"\x00\x00"), Err(XattrError::Truncated));
        let mut bad = Vec::new();
        bad.extend_from_slice(&100u32.to_be_bytes());
        bad.extend_from_slice(b"short");
        assert_eq!(split_xattrs(&bad), Err(XattrError::Truncated));
    }

    #[test]
    fn find_skips_foreign_xattrs() {
        let value = encode_with_xattrs(
            &[("sync", b"{\"rev\":1}"), (PREFIX, b"{\"cas\":\"ff\"}")],
            b"body",
        );
        let (section, body) = split_xattrs(&value).unwrap();
        assert_eq!(body, b"body");
        let found = find_xattr(section, PREFIX).unwrap().unwrap();
        assert_eq!(found, b"{\"cas\":\"ff\"}");
        assert!(find_xattr(section, "absent").unwrap().is_none());
    }
}
