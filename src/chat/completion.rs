//! Streaming decode loop - runs a session step by step and turns raw token
//! bytes into display text

use tokio_util::sync::CancellationToken;

use crate::llm_engine::model_loader::SharedSession;
use crate::llm_engine::provider::{LlmError, StepStatus};

/// Remove stop sequences from the end of `text`.
///
/// Suffix-only, exact match. For each stop sequence in order, both the bare
/// sequence and the sequence followed by a newline are stripped.
pub fn strip_stop_sequences(text: &str, stop_sequences: &[String]) -> String {
    let mut text = text;
    for stop in stop_sequences {
        if stop.is_empty() {
            continue;
        }
        if let Some(stripped) = text.strip_suffix(stop.as_str()) {
            text = stripped;
        }
        if let Some(stripped) = text
            .strip_suffix('\n')
            .and_then(|t| t.strip_suffix(stop.as_str()))
        {
            text = stripped;
        }
    }
    text.to_string()
}

/// Decode bytes, holding back an incomplete UTF-8 sequence at the end
fn decode_partial(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(e) if e.error_len().is_none() => {
            String::from_utf8_lossy(&bytes[..e.valid_up_to()]).into_owned()
        }
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Accumulates streamed fragments of one assistant turn
pub struct StreamAccumulator {
    buffer: Vec<u8>,
    stop_sequences: Vec<String>,
}

impl StreamAccumulator {
    pub fn new(stop_sequences: Vec<String>) -> Self {
        Self {
            buffer: Vec::new(),
            stop_sequences,
        }
    }

    /// Append a fragment and return the full display text so far
    pub fn push(&mut self, fragment: &[u8]) -> String {
        self.buffer.extend_from_slice(fragment);
        self.text()
    }

    pub fn text(&self) -> String {
        strip_stop_sequences(&decode_partial(&self.buffer), &self.stop_sequences)
    }
}

/// How a decode loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The session signalled end of generation
    Finished { steps: usize, text: String },
    /// Cancellation was observed between steps
    Cancelled { steps: usize, text: String },
}

/// Submit `prompt` and decode until the session is done or `cancel` fires.
///
/// Blocking; run on the blocking pool. Cancellation is checked before every
/// step, so an in-flight step always completes. `on_update` receives the full
/// display text after every fragment and is not called once cancelled.
pub fn run_decode_loop(
    session: &SharedSession,
    prompt: &str,
    stop_sequences: Vec<String>,
    cancel: &CancellationToken,
    mut on_update: impl FnMut(String),
) -> Result<DecodeOutcome, LlmError> {
    session.blocking_lock().add_message(prompt)?;

    let mut accumulator = StreamAccumulator::new(stop_sequences);
    let mut steps = 0;

    loop {
        if cancel.is_cancelled() {
            return Ok(DecodeOutcome::Cancelled {
                steps,
                text: accumulator.text(),
            });
        }

        let status = {
            let mut session = session.blocking_lock();
            session.generate(&mut |fragment: &[u8]| {
                let text = accumulator.push(fragment);
                log::trace!("+{} bytes, {} chars displayed", fragment.len(), text.len());
                if !cancel.is_cancelled() {
                    on_update(text);
                }
            })
        };
        steps += 1;

        if status == StepStatus::Done {
            return Ok(DecodeOutcome::Finished {
                steps,
                text: accumulator.text(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::testing::{FakeBackend, FakeScript};
    use crate::llm_engine::{InferenceBackend, SessionConfig};
    use std::path::Path;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn stops(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn session_for(script: FakeScript) -> SharedSession {
        let backend = FakeBackend::new(script);
        let mut model = backend.load_model(Path::new("/m.gguf"), &mut |_| {}).unwrap();
        Arc::new(Mutex::new(model.create_session(&SessionConfig::default()).unwrap()))
    }

    #[test]
    fn test_strip_bare_stop_sequence() {
        assert_eq!(strip_stop_sequences("Hello<|im_end|>", &stops(&["<|im_end|>"])), "Hello");
    }

    #[test]
    fn test_strip_stop_sequence_with_newline() {
        assert_eq!(strip_stop_sequences("Hello<|im_end|>\n", &stops(&["<|im_end|>"])), "Hello");
    }

    #[test]
    fn test_strip_is_suffix_only() {
        let list = stops(&["<eos>"]);
        assert_eq!(strip_stop_sequences("a<eos>b", &list), "a<eos>b");
        assert_eq!(strip_stop_sequences("<eos", &list), "<eos");
        assert_eq!(strip_stop_sequences("plain", &[]), "plain");
        assert_eq!(strip_stop_sequences("x<eos>\n\n", &list), "x<eos>\n\n");
    }

    #[test]
    fn test_strip_applies_each_sequence_in_order() {
        let list = stops(&["<end_of_turn>", "<eos>"]);
        assert_eq!(strip_stop_sequences("Hi<end_of_turn><eos>", &list), "Hi<end_of_turn>");
        assert_eq!(strip_stop_sequences("Hi<eos><end_of_turn>", &list), "Hi");
    }

    #[test]
    fn test_accumulator_holds_back_split_utf8() {
        let mut acc = StreamAccumulator::new(Vec::new());
        let bytes = "héllo".as_bytes();
        assert_eq!(acc.push(&bytes[..2]), "h");
        assert_eq!(acc.push(&bytes[2..]), "héllo");
    }

    #[test]
    fn test_accumulator_strips_streamed_stop() {
        let mut acc = StreamAccumulator::new(stops(&["<|im_end|>"]));
        assert_eq!(acc.push(b"Hello"), "Hello");
        assert_eq!(acc.push(b"<|im_"), "Hello<|im_");
        assert_eq!(acc.push(b"end|>"), "Hello");
    }

    #[test]
    fn test_decode_loop_runs_to_completion() {
        let session = session_for(FakeScript {
            chunks: vec![b"Hel".to_vec(), b"lo".to_vec(), b"<eos>".to_vec()],
            ..FakeScript::default()
        });

        let mut updates = Vec::new();
        let outcome = run_decode_loop(
            &session,
            "hi",
            stops(&["<eos>"]),
            &CancellationToken::new(),
            |text| updates.push(text),
        )
        .unwrap();

        assert_eq!(updates, vec!["Hel", "Hello", "Hello"]);
        assert_eq!(
            outcome,
            DecodeOutcome::Finished {
                steps: 4,
                text: "Hello".to_string()
            }
        );
    }

    #[test]
    fn test_decode_loop_stops_when_cancelled() {
        let session = session_for(FakeScript {
            endless: true,
            ..FakeScript::default()
        });
        let cancel = CancellationToken::new();

        let mut count = 0;
        let outcome = run_decode_loop(&session, "hi", Vec::new(), &cancel, |_| {
            count += 1;
            if count == 3 {
                cancel.cancel();
            }
        })
        .unwrap();

        assert_eq!(
            outcome,
            DecodeOutcome::Cancelled {
                steps: 3,
                text: "tok tok tok ".to_string()
            }
        );
    }
}
