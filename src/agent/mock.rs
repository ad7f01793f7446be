//! Offline token source.
//!
//! The sampled mode imitates a local model: a canned reply chosen from the
//! prompt's keywords, streamed word by word with 50–200 ms of jitter. The
//! scripted mode replays fixed fragments and can fail or stall on cue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use super::{FragmentSink, TokenSource, TurnRequest};
use crate::errors::AppError;
use crate::models::{timestamp, ModelInfo, ModelParameters};

const SAMPLE_RESPONSES: [&str; 5] = [
    "I'd be happy to help you with that! Let me break this down for you...",
    "That's an interesting question. Based on what you're asking, I think...",
    "Here's a comprehensive approach to solving this problem...",
    "Let me provide you with a detailed explanation of this concept...",
    "I understand what you're looking for. Here's how we can approach this...",
];

const ELABORATIONS: [&str; 4] = [
    "\n\nThis approach has several advantages and is widely used in the industry.",
    "\n\nLet me know if you'd like me to dive deeper into any specific aspect.",
    "\n\nI hope this helps clarify things! Feel free to ask any follow-up questions.",
    "\n\nThis should give you a solid foundation to work with. What would you like to explore next?",
];

const CODE_BODY: &str = "\n\nHere's a code example:\n\n```rust\nfn example() -> &'static str {\n    println!(\"This is a sample code snippet\");\n    \"Hello, World!\"\n}\n```\n\nThis demonstrates the basic structure and can be adapted for your specific needs.";

const EXPLAIN_BODY: &str = "\n\n1. **First Point**: This is the foundational concept you need to understand.\n\n2. **Second Point**: Building on that, we can see how this relates to the broader topic.\n\n3. **Third Point**: Finally, this practical application shows how it all comes together.\n\nWould you like me to elaborate on any of these points?";

const MIN_WORD_DELAY_MS: u64 = 50;
const MAX_WORD_DELAY_MS: u64 = 200;
const CATALOGUE_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
enum Script {
    Sampled,
    Fixed {
        fragments: Vec<String>,
        fail_after: Option<usize>,
        stall_after: Option<usize>,
        delay: Duration,
    },
}

#[derive(Debug)]
pub struct MockTokenSource {
    script: Script,
    requests: Mutex<Vec<TurnRequest>>,
    active: Arc<AtomicUsize>,
}

impl MockTokenSource {
    /// Keyword-driven canned replies with simulated latency.
    pub fn new() -> Self {
        Self::with_script(Script::Sampled)
    }

    /// Replays exactly `fragments`, with no delay.
    pub fn scripted<I, S>(fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_script(Script::Fixed {
            fragments: fragments.into_iter().map(Into::into).collect(),
            fail_after: None,
            stall_after: None,
            delay: Duration::ZERO,
        })
    }

    /// Fails with an inference error after delivering `count` fragments.
    pub fn failing_after(mut self, count: usize) -> Self {
        if let Script::Fixed { fail_after, .. } = &mut self.script {
            *fail_after = Some(count);
        }
        self
    }

    /// Blocks until cancelled after delivering `count` fragments.
    pub fn stalling_after(mut self, count: usize) -> Self {
        if let Script::Fixed { stall_after, .. } = &mut self.script {
            *stall_after = Some(count);
        }
        self
    }

    pub fn with_delay(mut self, per_fragment: Duration) -> Self {
        if let Script::Fixed { delay, .. } = &mut self.script {
            *delay = per_fragment;
        }
        self
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            requests: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Requests received so far, oldest first.
    pub fn recorded_requests(&self) -> Vec<TurnRequest> {
        lock_unpoisoned(&self.requests).clone()
    }

    /// Number of `produce` calls that have not yet returned.
    pub fn active_producers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    async fn produce_sampled(&self, request: &TurnRequest, sink: &FragmentSink) -> Result<(), AppError> {
        let prompt = request
            .last_user_message()
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        let reply = generate_reply(prompt);

        for fragment in split_into_fragments(&reply) {
            let delay = rand::thread_rng().gen_range(MIN_WORD_DELAY_MS..=MAX_WORD_DELAY_MS);
            tokio::select! {
                _ = sink.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
            if !sink.send(fragment).await {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn produce_fixed(
        &self,
        sink: &FragmentSink,
        fragments: &[String],
        fail_after: Option<usize>,
        stall_after: Option<usize>,
        delay: Duration,
    ) -> Result<(), AppError> {
        for (index, fragment) in fragments.iter().enumerate() {
            if fail_after == Some(index) {
                return Err(AppError::inference("mock token source failed mid-stream"));
            }
            if stall_after == Some(index) {
                sink.cancelled().await;
                return Ok(());
            }
            if !delay.is_zero() {
                tokio::select! {
                    _ = sink.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if !sink.send(fragment.clone()).await {
                return Ok(());
            }
        }
        if fail_after.is_some_and(|count| count >= fragments.len()) {
            return Err(AppError::inference("mock token source failed mid-stream"));
        }
        if stall_after.is_some_and(|count| count >= fragments.len()) {
            sink.cancelled().await;
        }
        Ok(())
    }
}

impl Default for MockTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenSource for MockTokenSource {
    async fn produce(&self, request: TurnRequest, sink: FragmentSink) -> Result<(), AppError> {
        let _active = ActiveGuard::enter(&self.active);
        lock_unpoisoned(&self.requests).push(request.clone());
        debug!(history = request.history.len(), model = %request.settings.model, "Mock turn started");

        match &self.script {
            Script::Sampled => self.produce_sampled(&request, &sink).await,
            Script::Fixed { fragments, fail_after, stall_after, delay } => {
                self.produce_fixed(&sink, fragments, *fail_after, *stall_after, *delay)
                    .await
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AppError> {
        if matches!(self.script, Script::Sampled) {
            tokio::time::sleep(CATALOGUE_DELAY).await;
        }
        Ok(mock_models())
    }

    async fn check_connection(&self) -> bool {
        true
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn generate_reply(prompt: &str) -> String {
    let mut rng = rand::thread_rng();
    let opening = SAMPLE_RESPONSES.choose(&mut rng).copied().unwrap_or(SAMPLE_RESPONSES[0]);
    let prompt = prompt.to_lowercase();

    if prompt.contains("code") || prompt.contains("programming") {
        return format!("{opening}{CODE_BODY}");
    }
    if prompt.contains("explain") || prompt.contains("what is") {
        return format!("{opening}{EXPLAIN_BODY}");
    }
    let elaboration = ELABORATIONS.choose(&mut rng).copied().unwrap_or(ELABORATIONS[0]);
    format!("{opening}{elaboration}")
}

/// Splits on single spaces, keeping the separator on every word but the last.
fn split_into_fragments(reply: &str) -> Vec<String> {
    let words: Vec<&str> = reply.split(' ').collect();
    let last = words.len().saturating_sub(1);
    words
        .iter()
        .enumerate()
        .map(|(i, word)| if i < last { format!("{word} ") } else { (*word).to_string() })
        .collect()
}

fn mock_models() -> Vec<ModelInfo> {
    let model = |name: &str, display_name: &str, size: &str, modified: &str, parameters| ModelInfo {
        name: name.to_string(),
        display_name: display_name.to_string(),
        size: size.to_string(),
        modified: timestamp::parse(modified).ok(),
        parameters,
    };
    vec![
        model(
            "llama3.2:latest",
            "Llama 3.2 Latest",
            "4.7GB",
            "2024-01-15T00:00:00Z",
            ModelParameters { temperature: 0.7, top_p: 0.9, top_k: 40, repeat_penalty: 1.1 },
        ),
        model(
            "codellama:latest",
            "Code Llama",
            "3.8GB",
            "2024-01-10T00:00:00Z",
            ModelParameters { temperature: 0.3, top_p: 0.95, top_k: 50, repeat_penalty: 1.0 },
        ),
        model(
            "mistral:latest",
            "Mistral 7B",
            "4.1GB",
            "2024-01-08T00:00:00Z",
            ModelParameters { temperature: 0.8, top_p: 0.9, top_k: 40, repeat_penalty: 1.1 },
        ),
        model(
            "neural-chat:latest",
            "Neural Chat",
            "4.3GB",
            "2024-01-05T00:00:00Z",
            ModelParameters { temperature: 0.7, top_p: 0.9, top_k: 40, repeat_penalty: 1.1 },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_rebuild_the_reply() {
        let reply = "I'd be happy to help.\n\nThis approach works.";
        let fragments = split_into_fragments(reply);
        assert_eq!(fragments.concat(), reply);
        assert!(fragments.iter().all(|f| !f.is_empty()));
        assert_eq!(fragments.last().map(String::as_str), Some("works."));
    }

    #[test]
    fn keywords_pick_the_reply_body() {
        assert!(generate_reply("Write some CODE for me").contains("```rust"));
        assert!(generate_reply("what is a monad").contains("**First Point**"));
        let plain = generate_reply("hello");
        assert!(SAMPLE_RESPONSES.iter().any(|opening| plain.starts_with(opening)));
        assert!(ELABORATIONS.iter().any(|tail| plain.ends_with(tail)));
    }

    #[test]
    fn catalogue_lists_four_models() {
        let models = mock_models();
        assert_eq!(models.len(), 4);
        assert_eq!(models[0].name, "llama3.2:latest");
        assert!(models.iter().all(|m| m.modified.is_some()));
    }

    #[tokio::test]
    async fn records_each_request() {
        let source = Arc::new(MockTokenSource::scripted(["ok"]));
        let request = TurnRequest {
            history: vec![crate::models::Message::user("hi")],
            settings: Default::default(),
        };
        let mut stream = super::super::open_stream(source.clone(), request.clone());
        while stream.next().await.is_some() {}

        assert_eq!(source.recorded_requests(), vec![request]);
        assert_eq!(source.active_producers(), 0);
    }
}
