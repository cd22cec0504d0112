use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Routing rule: when the state named `state` ends with an exit code matching
/// `pattern`, go to `next`. A transition without `next` ends the flow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateTransition {
    state: String,
    pattern: String,
    next: Option<String>,
}

impl StateTransition {
    pub const WILDCARD: &'static str = "*";

    pub fn new(state: impl Into<String>, pattern: impl Into<String>, next: impl Into<String>) -> Self {
        Self::with_next(state, pattern, Some(next.into()))
    }

    /// Unconditional transition, matching every exit code.
    pub fn always(state: impl Into<String>, next: impl Into<String>) -> Self {
        Self::new(state, Self::WILDCARD, next)
    }

    pub fn end(state: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::with_next(state, pattern, None)
    }

    fn with_next(state: impl Into<String>, pattern: impl Into<String>, next: Option<String>) -> Self {
        let pattern = pattern.into();
        Self {
            state: state.into(),
            pattern: if pattern.is_empty() {
                Self::WILDCARD.to_string()
            } else {
                pattern
            },
            next,
        }
    }

    pub fn state_name(&self) -> &str {
        &self.state
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }

    pub fn is_end(&self) -> bool {
        self.next.is_none()
    }

    pub fn matches(&self, exit_code: &str) -> bool {
        glob_match(self.pattern.as_bytes(), exit_code.as_bytes())
    }

    /// Precedence between two patterns: `Less` means `self` is more specific
    /// and is tried first. Fewer `*` wins, then fewer `?`, then the longer
    /// pattern.
    pub fn specificity(&self, other: &StateTransition) -> Ordering {
        let count = |p: &str, c: char| p.chars().filter(|&x| x == c).count();
        count(&self.pattern, '*')
            .cmp(&count(&other.pattern, '*'))
            .then_with(|| count(&self.pattern, '?').cmp(&count(&other.pattern, '?')))
            .then_with(|| other.pattern.len().cmp(&self.pattern.len()))
            .then_with(|| self.pattern.cmp(&other.pattern))
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} --[{}]--> {}",
            self.state,
            self.pattern,
            self.next.as_deref().unwrap_or("(end)")
        )
    }
}

/// `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match pattern.get(p) {
            Some(b'*') => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(&c) if c == b'?' || c == text[t] => {
                p += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
