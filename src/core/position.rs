// Stream positions and raw stream entries as handed back by a store.
use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;

/// Opaque, totally ordered stream id. `<ms>-<seq>` ids order numerically; anything else
/// orders lexically after them.
#[derive(Clone, Debug)]
pub struct StreamPosition(String);

impl StreamPosition {
    pub const BEGINNING: &'static str = "0-0";

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn beginning() -> Self {
        Self(Self::BEGINNING.to_string())
    }

    pub fn from_parts(ms: u64, seq: u64) -> Self {
        Self(format!("{ms}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parts(&self) -> Option<(u64, u64)> {
        let (ms, seq) = match self.0.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (self.0.as_str(), "0"),
        };
        Some((ms.parse().ok()?, seq.parse().ok()?))
    }
}

impl Default for StreamPosition {
    fn default() -> Self {
        Self::beginning()
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StreamPosition {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StreamPosition {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl PartialEq for StreamPosition {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for StreamPosition {}

impl Ord for StreamPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.parts(), other.parts()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for StreamPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StreamEntry {
    pub id: StreamPosition,
    pub fields: Vec<(String, Bytes)>,
}

impl StreamEntry {
    pub fn new(id: StreamPosition, fields: Vec<(String, Bytes)>) -> Self {
        Self { id, fields }
    }
}

#[cfg(test)]
mod tests {
    use super::StreamPosition;

    #[test]
    fn ids_order_numerically() {
        let a = StreamPosition::new("9-0");
        let b = StreamPosition::new("10-0");
        let c = StreamPosition::new("10-2");
        assert!(a < b);
        assert!(b < c);
        assert!(StreamPosition::beginning() < a);
    }

    #[test]
    fn bare_millis_parse_as_seq_zero() {
        assert_eq!(StreamPosition::new("5").parts(), Some((5, 0)));
        assert_eq!(StreamPosition::new("5"), StreamPosition::from_parts(5, 0));
    }

    #[test]
    fn unparsed_tokens_sort_after_ids() {
        let special = StreamPosition::new("$");
        assert!(StreamPosition::new("99-99") < special);
    }
}
