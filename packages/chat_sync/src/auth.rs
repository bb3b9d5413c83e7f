//! Session token access. Token storage and refresh live elsewhere; the
//! channel and REST client only ask for the current value.

use reqwest::Url;
use tracing::warn;

pub trait TokenProvider {
    fn token(&self) -> Option<String>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<String>,
{
    fn token(&self) -> Option<String> {
        self()
    }
}

/// A token fixed at startup (config file or env).
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Append `token=<value>` to a URL's query string, keeping existing pairs.
pub fn with_token_query(url: &str, token: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair("token", token);
            parsed.to_string()
        }
        Err(e) => {
            warn!("cannot attach token to unparsable url: {e}");
            url.to_string()
        }
    }
}
