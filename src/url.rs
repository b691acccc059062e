use maplit::hashmap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use strfmt::strfmt;
use tracing::debug;

use crate::tile::Tile;

const SUBDOMAINS: &[&str] = &["a", "b", "c"];

/// A tile URL template with `{z}`, `{x}`, `{y}` placeholders, an optional
/// rotating `{s}` subdomain and any number of named tokens.
///
/// # Example
/// ```rust
/// # use tile_crawler::{Tile, UrlFormat};
/// let url = UrlFormat::new("https://tiles.example.com/{z}/{x}/{y}.png?key={key}")
///     .with_token("key", "secret");
/// assert_eq!(
///     url.tile_url(&Tile::new(3, 5, 4)),
///     "https://tiles.example.com/4/3/5.png?key=secret",
/// );
/// ```
pub struct UrlFormat {
    inc: AtomicUsize,
    format_str: String,
    tokens: HashMap<String, String>,
}

impl UrlFormat {
    pub fn new(format_str: impl Into<String>) -> Self {
        Self {
            inc: AtomicUsize::new(0),
            format_str: format_str.into(),
            tokens: HashMap::new(),
        }
    }

    pub fn with_token(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tokens.insert(key.into(), value.into());
        self
    }

    pub fn with_tokens(mut self, tokens: HashMap<String, String>) -> Self {
        self.tokens.extend(tokens);
        self
    }

    pub fn as_str(&self) -> &str {
        &self.format_str
    }

    /// Builds the URL for `tile`.
    ///
    /// If the template can't be formatted with the known tokens (eg. it
    /// references a token that wasn't supplied), only `{z}`, `{x}` and `{y}`
    /// are substituted so a single bad template doesn't abort a whole batch.
    pub fn tile_url(&self, tile: &Tile) -> String {
        let inc = self.inc.fetch_add(1, Ordering::Relaxed);
        let mut vars = self.tokens.clone();
        vars.extend(hashmap! {
            "s".to_owned() => SUBDOMAINS[inc % SUBDOMAINS.len()].to_owned(),
            "x".to_owned() => tile.x.to_string(),
            "y".to_owned() => tile.y.to_string(),
            "z".to_owned() => tile.z.to_string(),
        });

        match strfmt(&self.format_str, &vars) {
            Ok(url) => url,
            Err(e) => {
                debug!(template = %self.format_str, error = %e, "falling back to positional substitution");
                self.positional_url(tile)
            }
        }
    }

    fn positional_url(&self, tile: &Tile) -> String {
        self.format_str
            .replace("{z}", &tile.z.to_string())
            .replace("{x}", &tile.x.to_string())
            .replace("{y}", &tile.y.to_string())
    }
}

impl PartialEq for UrlFormat {
    fn eq(&self, other: &Self) -> bool {
        self.format_str == other.format_str && self.tokens == other.tokens
    }
}

impl fmt::Debug for UrlFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UrlFormat")
            .field("format_str", &self.format_str)
            .field("tokens", &self.tokens.keys().collect::<Vec<_>>())
            .finish()
    }
}
