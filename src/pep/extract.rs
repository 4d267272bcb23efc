//! Streaming extraction of the decision value from a decision-service reply.
//!
//! Capture is flat: every opened element decides on its own whether text is
//! captured, and closing an element never restores the previous state. A
//! `Decision` element with child markup therefore only yields the text that
//! precedes its first child.

use std::borrow::Cow;

use quick_xml::{events::Event, Reader};

use super::error::{PepError, PepResult};

const DECISION_TAG: &str = "DECISION";

/// A token of the reply as seen by the extractor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlToken<'a> {
    OpenTag(&'a str),
    Text(&'a str),
    EndOfDocument,
    Malformed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Capturing,
    Done,
    Failed,
}

/// Per-call extraction state. Never shared between calls.
#[derive(Debug)]
pub struct DecisionExtractor {
    state: State,
    accumulator: Option<String>,
}

impl Default for DecisionExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl DecisionExtractor {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            accumulator: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    /// Advances the state machine by one token.
    ///
    /// Returns `Some` once the extraction reaches a terminal state; tokens
    /// fed after that are ignored.
    pub fn feed(&mut self, token: XmlToken<'_>) -> Option<PepResult<String>> {
        if self.is_finished() {
            return None;
        }

        match token {
            XmlToken::OpenTag(name) => {
                self.state = if name.to_uppercase() == DECISION_TAG {
                    State::Capturing
                } else {
                    State::Idle
                };
                None
            }
            XmlToken::Text(chunk) => {
                if self.state == State::Capturing {
                    self.accumulator.get_or_insert_with(String::new).push_str(chunk);
                }
                None
            }
            XmlToken::Malformed(reason) => {
                self.state = State::Failed;
                self.accumulator = None;
                Some(Err(PepError::MalformedResponse(reason)))
            }
            XmlToken::EndOfDocument => match self.accumulator.take() {
                Some(decision) if !decision.is_empty() => {
                    self.state = State::Done;
                    Some(Ok(decision.trim().to_string()))
                }
                _ => {
                    self.state = State::Failed;
                    Some(Err(PepError::DecisionNotFound))
                }
            },
        }
    }

    /// Tokenizes `body` and runs it through a fresh extractor.
    pub fn extract(mut self, body: &str) -> PepResult<String> {
        let mut reader = Reader::from_str(body);
        reader.config_mut().check_end_names = true;

        // quick-xml does not flag elements left open at EOF
        let mut depth: usize = 0;

        loop {
            let step = match reader.read_event() {
                Ok(Event::Start(e)) => {
                    depth += 1;
                    let qname = e.name();
                    let name = String::from_utf8_lossy(qname.as_ref());
                    self.feed(XmlToken::OpenTag(&name))
                }
                Ok(Event::Empty(e)) => {
                    let qname = e.name();
                    let name = String::from_utf8_lossy(qname.as_ref());
                    self.feed(XmlToken::OpenTag(&name))
                }
                Ok(Event::End(_)) => {
                    depth = depth.saturating_sub(1);
                    None
                }
                Ok(Event::Text(t)) => match t.unescape() {
                    Ok(text) => self.feed(XmlToken::Text(&text)),
                    Err(e) => self.feed(XmlToken::Malformed(e.to_string())),
                },
                Ok(Event::CData(c)) => {
                    let raw = c.into_inner();
                    let text: Cow<'_, str> = String::from_utf8_lossy(&raw);
                    self.feed(XmlToken::Text(&text))
                }
                Ok(Event::Eof) if depth > 0 => self.feed(XmlToken::Malformed(format!(
                    "{depth} element(s) left open at end of document"
                ))),
                Ok(Event::Eof) => self.feed(XmlToken::EndOfDocument),
                Ok(_) => None,
                Err(e) => self.feed(XmlToken::Malformed(format!(
                    "{e} at position {}",
                    reader.buffer_position()
                ))),
            };

            if let Some(result) = step {
                return result;
            }
        }
    }
}

/// Extracts the trimmed decision text from `body`.
pub fn extract_decision(body: &str) -> PepResult<String> {
    DecisionExtractor::new().extract(body)
}
