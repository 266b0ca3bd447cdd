//! Per-retry rewriting of request query strings.
//!
//! A [`UriUpdater`] is created once per logical request from the original URL.
//! It decides up front which [`Rule`]s apply and then applies them, in order,
//! every time [`UriUpdater::update`] is called.

use reqwest::Url;
use uuid::Uuid;

use crate::rest::{QUERY_PATH, REQUEST_GUID_PARAM, RETRY_COUNT_PARAM};

/// A stateful query-string mutator scoped to one logical request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Rule {
    /// Adds `retryCount=1` on first use, then overwrites it with 2, 3, ...
    RetryCount { next: u32 },
    /// Replaces `request_guid` with a fresh v4 UUID on every use.
    RequestGuid,
}

impl Rule {
    fn apply(&mut self, pairs: &mut Vec<String>) {
        match self {
            Rule::RetryCount { next } => {
                let pair = format!("{RETRY_COUNT_PARAM}={next}");
                if *next == 1 {
                    pairs.push(pair);
                } else {
                    set_pair(pairs, RETRY_COUNT_PARAM, pair);
                }
                *next = next.saturating_add(1);
            }
            Rule::RequestGuid => {
                let pair = format!("{REQUEST_GUID_PARAM}={}", Uuid::new_v4());
                set_pair(pairs, REQUEST_GUID_PARAM, pair);
            }
        }
    }
}

/// Rewrites a request URL between retry attempts.
#[derive(Clone, Debug)]
pub struct UriUpdater {
    url: Url,
    rules: Vec<Rule>,
}

impl UriUpdater {
    pub fn new(url: &Url) -> Self {
        let mut rules = Vec::new();

        if url.path().starts_with(QUERY_PATH) {
            rules.push(Rule::RetryCount { next: 1 });
        }

        let has_guid = url
            .query()
            .is_some_and(|query| query.split('&').any(|pair| key_of(pair) == REQUEST_GUID_PARAM));
        if has_guid {
            rules.push(Rule::RequestGuid);
        }

        Self {
            url: url.clone(),
            rules,
        }
    }

    /// Rules selected for this request, in application order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Applies every rule to the current query and returns the new URL.
    pub fn update(&mut self) -> Url {
        // Nothing to rewrite: skip parsing the query altogether.
        if self.rules.is_empty() {
            return self.url.clone();
        }

        let mut pairs: Vec<String> = match self.url.query() {
            Some(query) if !query.is_empty() => query.split('&').map(str::to_owned).collect(),
            _ => Vec::new(),
        };

        for rule in &mut self.rules {
            rule.apply(&mut pairs);
        }

        self.url.set_query(Some(&pairs.join("&")));
        self.url.clone()
    }
}

fn key_of(pair: &str) -> &str {
    pair.split_once('=').map_or(pair, |(key, _)| key)
}

/// Replaces the first pair named `key` and drops any duplicates, or appends
/// `pair` when the key is absent.
fn set_pair(pairs: &mut Vec<String>, key: &str, pair: String) {
    match pairs.iter().position(|existing| key_of(existing) == key) {
        Some(index) => {
            pairs[index] = pair;
            let mut seen = 0usize;
            pairs.retain(|existing| {
                if key_of(existing) != key {
                    return true;
                }
                seen += 1;
                seen == 1
            });
        }
        None => pairs.push(pair),
    }
}
