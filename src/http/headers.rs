use std::fmt;

/// Case-insensitive header multimap preserving insertion order.
///
/// Lookups compare names ASCII-case-insensitively; emission walks entries in
/// the order they were added, which keeps repeated headers such as
/// `Set-Cookie` in their original sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a header, keeping any existing entries with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every entry with this name by a single one, or appends.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.entries.push((name.to_string(), value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    }

    /// First value with this name, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value with this name, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Token membership for comma/semicolon separated header values,
    /// e.g. `Connection: keep-alive, Upgrade`.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name).any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    /// Appends a continuation of the most recently added value, used by the
    /// HTTP/1 parser for folded header lines.
    pub fn extend_last(&mut self, continuation: &str) {
        if let Some((_, value)) = self.entries.last_mut() {
            value.push(' ');
            value.push_str(continuation.trim());
        }
    }

    /// Byte size of the serialized header block, used against
    /// MAX_HEADER_LIST_SIZE-style limits.
    pub fn wire_len(&self) -> usize {
        self.entries
            .iter()
            .map(|(name, value)| name.len() + value.len() + 4)
            .sum()
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_lookup() {
        let mut headers = Headers::new();
        headers.append("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(headers.contains("Content-type"));
        assert_eq!(headers.get("content-length"), None);
    }

    #[test]
    fn test_multimap_preserves_order() {
        let mut headers = Headers::new();
        headers.append("Set-Cookie", "a=1");
        headers.append("X-Other", "x");
        headers.append("Set-Cookie", "b=2");
        let cookies: Vec<_> = headers.get_all("set-cookie").collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        let order: Vec<_> = headers.iter().map(|(name, _)| name).collect();
        assert_eq!(order, vec!["Set-Cookie", "X-Other", "Set-Cookie"]);
    }

    #[test]
    fn test_set_collapses_duplicates() {
        let mut headers = Headers::new();
        headers.append("Accept", "a");
        headers.append("Accept", "b");
        headers.set("accept", "c");
        let all: Vec<_> = headers.get_all("Accept").collect();
        assert_eq!(all, vec!["c"]);
    }

    #[test]
    fn test_token_membership() {
        let mut headers = Headers::new();
        headers.append("Connection", "keep-alive, Upgrade");
        assert!(headers.has_token("connection", "upgrade"));
        assert!(headers.has_token("connection", "keep-alive"));
        assert!(!headers.has_token("connection", "close"));
    }

    #[test]
    fn test_folded_continuation() {
        let mut headers = Headers::new();
        headers.append("X-Long", "first");
        headers.extend_last("second part");
        assert_eq!(headers.get("x-long"), Some("first second part"));
    }
}
