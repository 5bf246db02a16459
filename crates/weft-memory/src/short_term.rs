use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use futures::future::BoxFuture;

use weft_core::error::Result;
use weft_core::traits::MemoryProvider;
use weft_core::types::Context;

struct Interaction {
    task: String,
    response: String,
}

/// Keeps the last `max_entries` interactions and recalls those sharing at
/// least one word with the task.
pub struct ShortTermMemory {
    max_entries: usize,
    limit: usize,
    interactions: Mutex<VecDeque<Interaction>>,
}

fn words(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

impl ShortTermMemory {
    pub fn new(max_entries: usize) -> Self {
        Self {
            max_entries: max_entries.max(1),
            limit: 5,
            interactions: Mutex::new(VecDeque::new()),
        }
    }

    /// Maximum interactions returned per recall.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn len(&self) -> usize {
        self.interactions.lock().map(|i| i.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut i) = self.interactions.lock() {
            i.clear();
        }
    }
}

impl MemoryProvider for ShortTermMemory {
    fn retrieve_relevant<'a>(
        &'a self,
        task: &'a str,
        _context: &'a Context,
    ) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let query = words(task);
            if query.is_empty() {
                return Ok(None);
            }
            let interactions = match self.interactions.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Most recent first, then restore chronological order.
            let mut hits: Vec<&Interaction> = interactions
                .iter()
                .rev()
                .filter(|i| !words(&i.task).is_disjoint(&query))
                .take(self.limit)
                .collect();
            if hits.is_empty() {
                return Ok(None);
            }
            hits.reverse();
            let text = hits
                .iter()
                .map(|i| format!("Q: {}\nA: {}", i.task, i.response))
                .collect::<Vec<_>>()
                .join("\n");
            Ok(Some(text))
        })
    }

    fn store_interaction<'a>(
        &'a self,
        task: &'a str,
        response: &'a str,
        _context: &'a Context,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut interactions = match self.interactions.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            interactions.push_back(Interaction {
                task: task.to_string(),
                response: response.to_string(),
            });
            while interactions.len() > self.max_entries {
                interactions.pop_front();
            }
            Ok(())
        })
    }
}
