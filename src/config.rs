//! a `got.conf`-shaped key/value reader (§6.1, §3.7): a whitespace-
//! insensitive sequence of `key = value` lines, `#` starts a line comment.
//! read-only in this crate; nothing here ever writes it back.

use crate::error::WorktreeResult;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config(HashMap<String, String>);

impl Config {
    pub fn parse(text: &str) -> Self {
        let mut map = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                map.insert(key.trim().to_owned(), value.trim().to_owned());
            }
        }
        Self(map)
    }

    /// absent `got.conf` is not an error: it is documented as optional
    pub fn read(path: &Path) -> WorktreeResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::parse(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_lines() {
        let config = Config::parse("# a comment\nauthor = Jane Doe\n\nremote = origin\n");
        assert_eq!(config.get("author"), Some("Jane Doe"));
        assert_eq!(config.get("remote"), Some("origin"));
        assert_eq!(config.get("missing"), None);
    }

    #[test]
    fn missing_file_is_empty_config() {
        let config = Config::read(Path::new("/nonexistent/got.conf")).unwrap();
        assert_eq!(config.get("anything"), None);
    }
}
