//! Relational (keyword) matching for hybrid search.
//!
//! A question matches when one of its fields contains the whole query
//! phrase, or, for multi-word queries, when every word shows up in at least
//! one field. Answers only count for the whole phrase. All comparisons are
//! case-insensitive substring checks.

use crate::{questions::Question, semantic::preprocess::extract_text};

/// How well a question matched. Orders title phrase matches above
/// everything else, then by the number of fields that matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RelationalHit {
    pub title_phrase: bool,
    pub fields_hit: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMatch {
    phrase: String,
    words: Vec<String>,
}

impl TextMatch {
    /// `None` for a blank query.
    pub fn new(query: &str) -> Option<Self> {
        let phrase = query.split_whitespace().collect::<Vec<_>>().join(" ");
        if phrase.is_empty() {
            return None;
        }
        let phrase = phrase.to_lowercase();

        let mut words: Vec<String> = Vec::new();
        for word in phrase.split(' ') {
            if !words.iter().any(|w| w == word) {
                words.push(word.to_string());
            }
        }

        Some(Self { phrase, words })
    }

    pub fn phrase(&self) -> &str {
        &self.phrase
    }

    pub fn score(&self, question: &Question) -> Option<RelationalHit> {
        let fields = searchable_fields(question);
        let answers_phrase = question
            .answers
            .iter()
            .any(|a| extract_text(&a.content).to_lowercase().contains(&self.phrase));

        let phrase_anywhere = answers_phrase || fields.iter().any(|f| f.contains(&self.phrase));
        let all_words = self.words.len() > 1
            && self
                .words
                .iter()
                .all(|word| fields.iter().any(|f| f.contains(word.as_str())));

        if !phrase_anywhere && !all_words {
            return None;
        }

        let fields_hit = fields
            .iter()
            .filter(|f| {
                f.contains(&self.phrase) || self.words.iter().any(|w| f.contains(w.as_str()))
            })
            .count()
            + usize::from(answers_phrase);

        Some(RelationalHit {
            title_phrase: fields[0].contains(&self.phrase),
            fields_hit,
        })
    }
}

/// Lowercased fields that take part in word matching, title first.
fn searchable_fields(question: &Question) -> Vec<String> {
    let mut fields = Vec::with_capacity(5);
    fields.push(question.title.to_lowercase());
    fields.push(extract_text(&question.content).to_lowercase());
    fields.push(
        question
            .categories
            .iter()
            .map(|c| c.name.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n"),
    );
    fields.push(question.author.name.to_lowercase());
    fields.push(
        question
            .tags
            .iter()
            .map(|t| t.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n"),
    );
    fields
}
