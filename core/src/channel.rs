//! Topic to channel name encoding
//!
//! Topics are arbitrary strings; channels are what gets spliced into
//! `LISTEN`/`UNLISTEN` and `pg_notify` statements without quoting. Every
//! channel is drawn from `[a-z0-9_]`, which Postgres neither case-folds nor
//! treats as anything but a plain identifier.
//!
//! Most topics get a reversible escape prefixed with `ch_`:
//!
//! - `a-z` and `0-9` are copied verbatim
//! - `_` becomes `__`
//! - `A-Z` becomes `_` plus the lower-case letter
//! - any other character becomes `_<decimal code point>_`
//!
//! A topic whose escape would not fit in a Postgres identifier (63 bytes)
//! is instead named by a truncated SHA-256 digest prefixed with `cd_`. The
//! two prefixes never overlap, escapes never collide, and digest collisions
//! need a 192-bit match, so distinct topics get distinct channels.
//!
//! Changing this scheme changes every channel name; publishers and
//! listeners on different versions would stop seeing each other.

use sha2::{Digest, Sha256};
use std::fmt;
use std::fmt::Write;

/// Prefix on escaped channels; keeps identifiers off the keyword list and non-numeric
pub const CHANNEL_PREFIX: &str = "ch_";

/// Prefix on digest channels
pub const DIGEST_PREFIX: &str = "cd_";

/// Postgres `NAMEDATALEN - 1`
pub const MAX_CHANNEL_LEN: usize = 63;

/// Digest bytes kept in a digest channel (hex-encoded, so twice this many chars)
const DIGEST_BYTES: usize = 24;

/// An encoded, statement-safe channel name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(String);

impl Channel {
    /// Encode a topic into its channel name
    pub fn encode(topic: &str) -> Self {
        let escaped = escape(topic);
        if escaped.len() <= MAX_CHANNEL_LEN {
            return Self(escaped);
        }

        let digest = Sha256::digest(topic.as_bytes());
        let mut out = String::with_capacity(DIGEST_PREFIX.len() + DIGEST_BYTES * 2);
        out.push_str(DIGEST_PREFIX);
        for byte in &digest[..DIGEST_BYTES] {
            let _ = write!(out, "{:02x}", byte);
        }
        Self(out)
    }

    /// Recover the topic an escaped channel was encoded from
    ///
    /// Returns `None` for digest channels and for anything that is not
    /// exactly what [`Channel::encode`] would produce.
    pub fn decode(channel: &str) -> Option<String> {
        let body = channel.strip_prefix(CHANNEL_PREFIX)?;
        let mut topic = String::with_capacity(body.len());
        let mut chars = body.chars();

        while let Some(c) = chars.next() {
            match c {
                'a'..='z' | '0'..='9' => topic.push(c),
                '_' => match chars.next()? {
                    '_' => topic.push('_'),
                    l @ 'a'..='z' => topic.push(l.to_ascii_uppercase()),
                    d @ '0'..='9' => {
                        let mut code = d.to_digit(10)?;
                        loop {
                            match chars.next()? {
                                '_' => break,
                                d @ '0'..='9' => {
                                    code = code.checked_mul(10)?.checked_add(d.to_digit(10)?)?;
                                }
                                _ => return None,
                            }
                        }
                        topic.push(char::from_u32(code)?);
                    }
                    _ => return None,
                },
                _ => return None,
            }
        }

        // Reject non-canonical spellings such as "_097_" for "a"
        (escape(&topic) == channel).then_some(topic)
    }

    /// Whether this channel names its topic by digest
    pub fn is_digest(&self) -> bool {
        self.0.starts_with(DIGEST_PREFIX)
    }

    /// Wrap a channel name received from the server
    pub(crate) fn from_wire(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Channel name as spliced into SQL
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn escape(topic: &str) -> String {
    let mut out = String::with_capacity(CHANNEL_PREFIX.len() + topic.len());
    out.push_str(CHANNEL_PREFIX);
    for c in topic.chars() {
        match c {
            'a'..='z' | '0'..='9' => out.push(c),
            '_' => out.push_str("__"),
            'A'..='Z' => {
                out.push('_');
                out.push(c.to_ascii_lowercase());
            }
            // Writing to a String cannot fail
            _ => {
                let _ = write!(out, "_{}_", c as u32);
            }
        }
    }
    out
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Channel {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
