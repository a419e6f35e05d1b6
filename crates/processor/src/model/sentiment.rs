//! Pluggable sentiment classification

use crate::error::DownstreamError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Fixed label set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "POSITIVE",
            SentimentLabel::Negative => "NEGATIVE",
            SentimentLabel::Neutral => "NEUTRAL",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sentiment function: one text in, one label out
#[async_trait]
pub trait SentimentClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<SentimentLabel, DownstreamError>;

    fn name(&self) -> &str {
        "sentiment_classifier"
    }
}

const POSITIVE_WORDS: &[&str] = &[
    "love", "loved", "great", "excellent", "amazing", "awesome", "good", "best", "happy",
    "perfect", "recommend", "fantastic", "nice", "wonderful", "fast", "works",
];

const NEGATIVE_WORDS: &[&str] = &[
    "hate", "hated", "bad", "terrible", "awful", "worst", "broken", "poor", "disappointed",
    "refund", "slow", "useless", "waste", "sad", "angry", "defective",
];

const NEGATIONS: &[&str] = &["not", "no", "never", "don't", "isn't", "wasn't", "didn't"];

/// Lexicon classifier
///
/// Counts positive and negative words, flipping a word's polarity when the
/// previous token is a negation. Ties are neutral.
#[derive(Debug, Clone)]
pub struct KeywordSentimentClassifier {
    positive: HashSet<String>,
    negative: HashSet<String>,
}

impl KeywordSentimentClassifier {
    pub fn new<I, J>(positive: I, negative: J) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        J: IntoIterator,
        J::Item: Into<String>,
    {
        Self {
            positive: positive.into_iter().map(Into::into).collect(),
            negative: negative.into_iter().map(Into::into).collect(),
        }
    }

    fn score(&self, text: &str) -> i64 {
        let tokens: Vec<String> = text
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|t| !t.is_empty())
            .map(|t| t.to_lowercase())
            .collect();

        let mut score = 0i64;
        for (i, token) in tokens.iter().enumerate() {
            let polarity = if self.positive.contains(token) {
                1
            } else if self.negative.contains(token) {
                -1
            } else {
                continue;
            };
            let negated = i > 0 && NEGATIONS.contains(&tokens[i - 1].as_str());
            score += if negated { -polarity } else { polarity };
        }
        score
    }
}

impl Default for KeywordSentimentClassifier {
    fn default() -> Self {
        Self::new(
            POSITIVE_WORDS.iter().copied(),
            NEGATIVE_WORDS.iter().copied(),
        )
    }
}

#[async_trait]
impl SentimentClassifier for KeywordSentimentClassifier {
    async fn classify(&self, text: &str) -> Result<SentimentLabel, DownstreamError> {
        Ok(match self.score(text) {
            s if s > 0 => SentimentLabel::Positive,
            s if s < 0 => SentimentLabel::Negative,
            _ => SentimentLabel::Neutral,
        })
    }

    fn name(&self) -> &str {
        "keyword"
    }
}
