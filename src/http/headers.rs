//! Request header map.
//!
//! Lookups are case-insensitive. A repeated header replaces the earlier value
//! unless it is a list-valued header, in which case the values are joined.

/// Headers whose repeated occurrences are combined rather than replaced.
const LIST_HEADERS: &[&str] = &[
    "accept",
    "accept-charset",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "connection",
    "pragma",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "via",
    "warning",
];

#[derive(Debug, Default, Clone)]
pub struct Headers {
    // (lowercased name, name as sent, value)
    entries: Vec<(String, String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, value: &str) {
        let key = name.to_ascii_lowercase();
        let value = value.trim();

        if let Some(entry) = self.entries.iter_mut().find(|(k, _, _)| *k == key) {
            if key == "cookie" {
                entry.2 = format!("{}; {}", entry.2, value);
            } else if LIST_HEADERS.contains(&key.as_str()) {
                entry.2 = format!("{}, {}", entry.2, value);
            } else {
                entry.2 = value.to_string();
            }
            return;
        }
        self.entries.push((key, name.to_string(), value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, _, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether a comma-separated header contains `token`, ignoring case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get(name)
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    }

    /// Iterates `(name as sent, value)` pairs in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(_, n, v)| (n.as_str(), v.as_str()))
    }
}
