//! Opaque pagination cursors. Each is URL-safe base64 of a position: the
//! last row of the previous page under the listing's keyset order.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub ts: i64,
    pub seq: i64,
}

impl Cursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}", self.ts, self.seq))
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw.trim()).ok()?;
        let text = String::from_utf8(bytes).ok()?;
        let (ts, seq) = text.split_once(':')?;
        Some(Self {
            ts: ts.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

/// Position in listings keyed by `(ts DESC, key DESC, rank DESC)`: tasks by
/// latest activity, agents by last sighting. `rank` separates rows sharing
/// a key; listings that have no such rows leave it at 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCursor {
    pub ts: i64,
    pub rank: i64,
    pub key: String,
}

impl KeyCursor {
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!("{}:{}:{}", self.ts, self.rank, self.key))
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(raw.trim()).ok()?;
        let text = String::from_utf8(bytes).ok()?;
        let mut parts = text.splitn(3, ':');
        let ts = parts.next()?.parse().ok()?;
        let rank = parts.next()?.parse().ok()?;
        let key = parts.next()?.to_string();
        Some(Self { ts, rank, key })
    }
}

#[cfg(test)]
mod tests {
    use super::{Cursor, KeyCursor};

    #[test]
    fn cursor_survives_encoding() {
        let c = Cursor {
            ts: 1_700_000_000_123,
            seq: 42,
        };
        assert_eq!(Cursor::decode(&c.encode()), Some(c));
    }

    #[test]
    fn garbage_cursor_is_rejected() {
        assert_eq!(Cursor::decode("not base64!"), None);
        assert_eq!(Cursor::decode("bm9jb2xvbg"), None); // "nocolon"
        assert_eq!(Cursor::decode(""), None);
    }

    #[test]
    fn key_cursor_keeps_colons_in_the_key() {
        let c = KeyCursor {
            ts: 1_700_000_000_000,
            rank: 1,
            key: "task:with:colons".to_string(),
        };
        assert_eq!(KeyCursor::decode(&c.encode()), Some(c));
        assert_eq!(KeyCursor::decode("MTI6MA"), None); // "12:0"
    }
}
