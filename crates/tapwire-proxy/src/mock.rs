//! Mock rule engine.
//!
//! Rules short-circuit the origin round-trip: when an enabled rule's URL
//! pattern matches, the handler answers with the rule's literal response and
//! the origin never sees a connection. Rules are persisted in the store and
//! mirrored in memory with their regexes compiled once.

use crate::error::Result;
use crate::store::{MockRule, NewMockRule, RequestStore};
use http::Method;
use parking_lot::RwLock;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use tracing::warn;

/// The literal response a matched rule synthesizes.
#[derive(Debug, Clone)]
pub struct MockResponse {
  /// Status code.
  pub status: u16,
  /// Headers, as stored on the rule.
  pub headers: Vec<(String, String)>,
  /// Body, literal.
  pub body: String,
  /// Delay to apply before answering.
  pub delay_ms: u64,
}

struct CompiledRule {
  rule: MockRule,
  /// `None` when the pattern failed to compile; such rules never match.
  regex: Option<Regex>,
}

fn compile(rule: MockRule) -> CompiledRule {
  let regex = RegexBuilder::new(&rule.url_pattern)
    .case_insensitive(true)
    .build()
    .map_err(|e| {
      warn!(
        "mock rule {} ({}) has an invalid pattern, disabling match: {e}",
        rule.id, rule.name
      );
    })
    .ok();
  CompiledRule { rule, regex }
}

/// In-memory rule list backed by the store.
#[derive(Clone)]
pub struct MockEngine {
  store: RequestStore,
  rules: Arc<RwLock<Vec<CompiledRule>>>,
}

impl MockEngine {
  /// Build the engine, loading persisted rules (newest creation first,
  /// which is the precedence order).
  pub fn load(store: RequestStore) -> Result<Self> {
    let rules = store
      .list_mock_rules()?
      .into_iter()
      .map(compile)
      .collect::<Vec<_>>();
    Ok(Self {
      store,
      rules: Arc::new(RwLock::new(rules)),
    })
  }

  /// First enabled rule matching `(method, url)`, scanning in precedence
  /// order. Disabled rules, method mismatches and invalid patterns are
  /// skipped.
  pub fn find(&self, method: &Method, url: &str) -> Option<MockRule> {
    let rules = self.rules.read();
    for compiled in rules.iter() {
      if !compiled.rule.enabled {
        continue;
      }
      if let Some(want) = &compiled.rule.method {
        if !want.eq_ignore_ascii_case(method.as_str()) {
          continue;
        }
      }
      match &compiled.regex {
        Some(regex) if regex.is_match(url) => return Some(compiled.rule.clone()),
        _ => continue,
      }
    }
    None
  }

  /// A defensive copy of the rule's literal response fields.
  pub fn generate(rule: &MockRule) -> MockResponse {
    MockResponse {
      status: rule.response_status,
      headers: rule.response_headers.clone(),
      body: rule.response_body.clone(),
      delay_ms: rule.delay_ms,
    }
  }

  /// Persist a rule and splice it into the precedence order.
  pub fn add(&self, rule: NewMockRule) -> Result<MockRule> {
    let stored = self.store.insert_mock_rule(&rule)?;
    self.rules.write().insert(0, compile(stored.clone()));
    Ok(stored)
  }

  /// Update a rule in place.
  pub fn update(&self, id: i64, rule: NewMockRule) -> Result<bool> {
    if !self.store.update_mock_rule(id, &rule)? {
      return Ok(false);
    }
    if let Some(stored) = self.store.get_mock_rule(id)? {
      let mut rules = self.rules.write();
      if let Some(slot) = rules.iter_mut().find(|c| c.rule.id == id) {
        *slot = compile(stored);
      }
    }
    Ok(true)
  }

  /// Flip a rule's enabled flag.
  pub fn set_enabled(&self, id: i64, enabled: bool) -> Result<bool> {
    if !self.store.set_mock_rule_enabled(id, enabled)? {
      return Ok(false);
    }
    let mut rules = self.rules.write();
    if let Some(slot) = rules.iter_mut().find(|c| c.rule.id == id) {
      slot.rule.enabled = enabled;
    }
    Ok(true)
  }

  /// Remove a rule.
  pub fn delete(&self, id: i64) -> Result<bool> {
    if !self.store.delete_mock_rule(id)? {
      return Ok(false);
    }
    self.rules.write().retain(|c| c.rule.id != id);
    Ok(true)
  }

  /// Current rules in precedence order.
  pub fn list(&self) -> Vec<MockRule> {
    self.rules.read().iter().map(|c| c.rule.clone()).collect()
  }
}
