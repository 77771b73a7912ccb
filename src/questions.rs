//! Question-bank collaborator
//!
//! A problem is requested for the negotiated (category, difficulty) when a
//! room becomes ready. Content selection belongs to the question service.

use crate::error::Result;
use crate::types::Difficulty;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use std::collections::HashMap;

/// Source of problems for newly ready rooms
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuestionBank: Send + Sync {
    /// Identifier of a problem for the pair, if one is available
    async fn pick_question(&self, category: &str, difficulty: Difficulty)
        -> Result<Option<String>>;
}

/// Leaves question assignment to the collaboration service
#[derive(Debug, Default, Clone, Copy)]
pub struct UnassignedQuestionBank;

#[async_trait]
impl QuestionBank for UnassignedQuestionBank {
    async fn pick_question(
        &self,
        _category: &str,
        _difficulty: Difficulty,
    ) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Fixed in-process catalogue, picked at random
#[derive(Debug, Default, Clone)]
pub struct StaticQuestionBank {
    questions: HashMap<(String, Difficulty), Vec<String>>,
}

impl StaticQuestionBank {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_question(
        mut self,
        category: &str,
        difficulty: Difficulty,
        question_id: impl Into<String>,
    ) -> Self {
        self.questions
            .entry((category.to_lowercase(), difficulty))
            .or_default()
            .push(question_id.into());
        self
    }
}

#[async_trait]
impl QuestionBank for StaticQuestionBank {
    async fn pick_question(
        &self,
        category: &str,
        difficulty: Difficulty,
    ) -> Result<Option<String>> {
        Ok(self
            .questions
            .get(&(category.to_lowercase(), difficulty))
            .and_then(|ids| ids.choose(&mut rand::thread_rng()))
            .cloned())
    }
}
