//! Repeated query shape (N+1) detection
//!
//! Every backing operation is reduced to a *shape*: literals become `?`,
//! `IN (...)` lists become `IN (?)`, whitespace and case are normalized. A
//! shape seen more than `threshold` times within one window usually means a
//! loop issuing one query per item, which a [`BatchLoader`] would collapse.
//!
//! Windows are fixed: counters are cleared once `window` has elapsed since
//! the window started, checked on each call. Bursts straddling a boundary
//! are split across two windows and may go unreported.
//!
//! [`BatchLoader`]: crate::loader::BatchLoader

use crate::{config::DetectorConfig, scheduler::Scheduler};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tokio::time::Instant;
use tracing::warn;

/// A shape and how often it was seen in the current window
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShapePattern {
    pub shape: String,
    pub count: u64,
}

#[derive(Debug)]
struct DetectorState {
    window_start: Instant,
    counts: HashMap<String, u64>,
    reported: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct ShapeDetector {
    config: DetectorConfig,
    scheduler: Arc<dyn Scheduler>,
    state: Arc<Mutex<DetectorState>>,
}

impl ShapeDetector {
    pub fn new(config: DetectorConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        let state = DetectorState {
            window_start: scheduler.now(),
            counts: HashMap::new(),
            reported: HashSet::new(),
        };
        Self {
            config,
            scheduler,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Count one occurrence of `signature`; returns its count in the
    /// current window.
    pub fn track(&self, signature: &str) -> u64 {
        self.track_shape(normalize(signature))
    }

    /// Count one occurrence of an already normalized shape.
    pub fn track_shape(&self, shape: String) -> u64 {
        let now = self.scheduler.now();

        let mut state = self.state.lock();
        if now.duration_since(state.window_start) >= self.config.window {
            state.window_start = now;
            state.counts.clear();
            state.reported.clear();
        }

        let count = {
            let count = state.counts.entry(shape.clone()).or_insert(0);
            *count += 1;
            *count
        };

        if count > self.config.threshold && state.reported.insert(shape.clone()) {
            drop(state);
            warn!(
                "Possible N+1: shape executed {} times within {:?}: {}",
                count, self.config.window, shape
            );
        }

        count
    }

    /// Shapes seen more than `threshold` times in the current window,
    /// most frequent first.
    pub fn patterns(&self, threshold: u64) -> Vec<ShapePattern> {
        let state = self.state.lock();
        let now = self.scheduler.now();
        if now.duration_since(state.window_start) >= self.config.window {
            return Vec::new();
        }

        let mut patterns: Vec<ShapePattern> = state
            .counts
            .iter()
            .filter(|&(_, &count)| count > threshold)
            .map(|(shape, &count)| ShapePattern {
                shape: shape.clone(),
                count,
            })
            .collect();
        drop(state);

        patterns.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.shape.cmp(&b.shape)));
        patterns
    }

    /// [`patterns`](Self::patterns) at the configured threshold.
    pub fn hot_patterns(&self) -> Vec<ShapePattern> {
        self.patterns(self.config.threshold)
    }

    /// Clear all counters and start a new window.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.window_start = self.scheduler.now();
        state.counts.clear();
        state.reported.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Literal,
    Open,
    Close,
    Comma,
    Op(char),
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '$' | '@' | ':' | '#' | '`' | '[' | ']' | '?')
}

fn tokenize(signature: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = signature.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {}
            '\'' | '"' => {
                // Quotes are escaped by doubling or with a backslash
                while let Some(next) = chars.next() {
                    if next == '\\' {
                        chars.next();
                    } else if next == c {
                        if chars.peek() == Some(&c) {
                            chars.next();
                        } else {
                            break;
                        }
                    }
                }
                tokens.push(Token::Literal);
            }
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            ',' => tokens.push(Token::Comma),
            c if is_word_char(c) => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !is_word_char(next) {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                if word.starts_with(|first: char| first.is_ascii_digit()) {
                    tokens.push(Token::Literal);
                } else {
                    tokens.push(Token::Word(word.to_lowercase()));
                }
            }
            other => tokens.push(Token::Op(other)),
        }
    }

    tokens
}

/// Collapse `in ( ?, ?, ... )` into `in ( ? )`.
fn collapse_in_lists(tokens: Vec<Token>) -> Vec<Token> {
    let mut out: Vec<Token> = Vec::with_capacity(tokens.len());
    let mut i = 0;

    while i < tokens.len() {
        let after_in = matches!(out.last(), Some(Token::Word(w)) if w == "in");
        if after_in && tokens[i] == Token::Open {
            let mut j = i + 1;
            let mut literals = 0;
            while j < tokens.len() {
                match (&tokens[j], literals % 2) {
                    (Token::Literal, 0) | (Token::Comma, 1) => literals += 1,
                    _ => break,
                }
                j += 1;
            }
            if literals % 2 == 1 && tokens.get(j) == Some(&Token::Close) {
                out.extend([Token::Open, Token::Literal, Token::Close]);
                i = j + 1;
                continue;
            }
        }
        out.push(tokens[i].clone());
        i += 1;
    }

    out
}

/// Reduce an operation signature to its shape.
pub fn normalize(signature: &str) -> String {
    let tokens = collapse_in_lists(tokenize(signature));
    let mut shape = String::with_capacity(signature.len());

    let mut previous: Option<&Token> = None;
    for token in &tokens {
        let spaced = match (previous, token) {
            (None, _) | (Some(Token::Open), _) | (_, Token::Close | Token::Comma) => false,
            _ => true,
        };
        if spaced {
            shape.push(' ');
        }
        match token {
            Token::Word(word) => shape.push_str(word),
            Token::Literal => shape.push('?'),
            Token::Open => shape.push('('),
            Token::Close => shape.push(')'),
            Token::Comma => shape.push(','),
            Token::Op(op) => shape.push(*op),
        }
        previous = Some(token);
    }

    shape
}
