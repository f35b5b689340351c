//! Text conversation: one turn = retried stream open → decoder → events.
//!
//! [`ChatSession`] owns the history and the learned facts. Each call to
//! [`ChatSession::send`] forwards every [`TurnEvent`] to the caller's channel
//! in emission order and returns a [`TurnOutcome`] summary.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::AuraConfig;
use crate::error::{AuraError, Result};
use crate::gemini::types::{Content, ROLE_MODEL, ROLE_USER};
use crate::gemini::{GenerativeBackend, TurnRequest};
use crate::retry::{self, RetryPolicy};
use crate::turn::{HeaderRecord, Mood, StreamDecoder, TurnEvent};

/// Summary of a finished turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    pub header: HeaderRecord,
    /// Concatenated body text.
    pub text: String,
    /// Set when the turn ended in an image request.
    pub image_prompt: Option<String>,
}

/// One text conversation with the remote model.
pub struct ChatSession {
    backend: Arc<dyn GenerativeBackend>,
    policy: RetryPolicy,
    sentinel: String,
    persona: String,
    max_history_turns: usize,
    history: Vec<Content>,
    facts: Vec<String>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("sentinel", &self.sentinel)
            .field("history_len", &self.history.len())
            .field("facts", &self.facts)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    pub fn new(backend: Arc<dyn GenerativeBackend>, config: &AuraConfig) -> Self {
        Self {
            backend,
            policy: config.retry.policy(),
            sentinel: config.turn.sentinel.clone(),
            persona: config.turn.persona.clone(),
            max_history_turns: config.turn.max_history_turns,
            history: Vec::new(),
            facts: Vec::new(),
        }
    }

    /// Replace the retry policy used to open each turn.
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Facts learned so far, in the order they were first seen.
    pub fn facts(&self) -> &[String] {
        &self.facts
    }

    /// Conversation history (alternating user/model entries).
    pub fn history(&self) -> &[Content] {
        &self.history
    }

    /// Merge `facts` into the learned set, skipping case-insensitive duplicates.
    pub fn remember_facts<S: AsRef<str>>(&mut self, facts: &[S]) {
        for fact in facts {
            let fact = fact.as_ref().trim();
            if fact.is_empty() {
                continue;
            }
            let known = self.facts.iter().any(|f| f.eq_ignore_ascii_case(fact));
            if !known {
                debug!(fact, "learned new fact");
                self.facts.push(fact.to_owned());
            }
        }
    }

    /// System instruction describing the reply format, persona and facts.
    pub fn system_instruction(&self) -> String {
        let moods: Vec<&str> = Mood::ALL.iter().map(|m| m.as_str()).collect();
        let mut out = format!(
            "{persona}\n\n\
             Begin every reply with a single-line JSON object with the keys \
             mood (one of: {moods}), is_image_prompt, image_prompt, is_code, \
             code_language, code_content and new_facts (facts you learned about \
             the user in this message). Then write exactly {sentinel} and \
             continue with your reply to the user as plain text. If the user asks \
             for a picture, set is_image_prompt to true and describe it in \
             image_prompt.",
            persona = self.persona,
            moods = moods.join(", "),
            sentinel = self.sentinel,
        );
        if !self.facts.is_empty() {
            out.push_str("\n\nWhat you know about the user:\n");
            for fact in &self.facts {
                out.push_str("- ");
                out.push_str(fact);
                out.push('\n');
            }
        }
        out
    }

    /// Send one user message and stream the reply.
    ///
    /// Every event is forwarded to `events`; exactly one terminal event
    /// (`Complete` or `Error`) is sent per call. Only opening the stream is
    /// retried. A failure after fragments started flowing ends the turn.
    ///
    /// # Errors
    ///
    /// The stream-open error after retries, a mid-stream failure, or
    /// [`AuraError::EmptyPayload`] when the reply carried no text at all.
    pub async fn send(
        &mut self,
        text: &str,
        events: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Result<TurnOutcome> {
        let mut contents = self.history.clone();
        contents.push(Content::text(ROLE_USER, text));
        let request = TurnRequest {
            system_instruction: Some(self.system_instruction()),
            contents,
        };

        let backend = &self.backend;
        let mut stream = match retry::execute(&self.policy, || backend.stream_turn(&request)).await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "could not open turn stream");
                forward(events, TurnEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let mut decoder = StreamDecoder::new(self.sentinel.clone());
        let mut outcome = TurnOutcome::default();
        let mut received_any = false;

        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) => {
                    received_any = true;
                    for event in decoder.feed(&fragment) {
                        record(&mut outcome, &event);
                        forward(events, event);
                    }
                    if decoder.is_terminated() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "turn stream failed");
                    for event in decoder.fail(e.to_string()) {
                        forward(events, event);
                    }
                    return Err(e);
                }
            }
        }

        if !received_any {
            let err = AuraError::EmptyPayload("turn stream produced no text".into());
            for event in decoder.fail(err.to_string()) {
                forward(events, event);
            }
            return Err(err);
        }
        for event in decoder.finish() {
            record(&mut outcome, &event);
            forward(events, event);
        }

        self.remember_facts(&outcome.header.new_facts);
        self.push_history(text, &outcome);
        info!(
            mood = %outcome.header.mood,
            chars = outcome.text.len(),
            image = outcome.image_prompt.is_some(),
            "turn complete"
        );
        Ok(outcome)
    }

    fn push_history(&mut self, user_text: &str, outcome: &TurnOutcome) {
        let reply = match &outcome.image_prompt {
            Some(prompt) if outcome.text.is_empty() => format!("(shared an image: {prompt})"),
            _ => outcome.text.clone(),
        };
        self.history.push(Content::text(ROLE_USER, user_text));
        self.history.push(Content::text(ROLE_MODEL, reply));

        let max_entries = self.max_history_turns.saturating_mul(2);
        if self.history.len() > max_entries {
            let excess = self.history.len() - max_entries;
            self.history.drain(..excess);
        }
    }
}

fn record(outcome: &mut TurnOutcome, event: &TurnEvent) {
    match event {
        TurnEvent::HeaderParsed(header) => outcome.header = header.clone(),
        TurnEvent::TextChunk(text) => outcome.text.push_str(text),
        TurnEvent::ImageRequired(prompt) => outcome.image_prompt = Some(prompt.clone()),
        TurnEvent::Complete | TurnEvent::Error(_) => {}
    }
}

fn forward(events: &mpsc::UnboundedSender<TurnEvent>, event: TurnEvent) {
    if events.send(event).is_err() {
        trace!("turn event receiver dropped");
    }
}
