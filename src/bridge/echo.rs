//! Prompt-echo suppression.
//!
//! Some assistant responses open by repeating the submitted prompt verbatim
//! before the actual answer. Streaming that back produces a jarring duplicate
//! of the user's own question, so deltas are buffered until the filter can
//! decide whether the turn starts with an echo.

/// Per-turn filter that strips a leading verbatim echo of the prompt.
///
/// The comparison is case-insensitive and ignores leading/trailing whitespace
/// on both sides. Once the echo question is settled (stripped, or ruled out),
/// the filter becomes a pass-through for the rest of the turn.
#[derive(Debug)]
pub struct EchoFilter {
    /// Trimmed original prompt (used for char-accurate stripping).
    prompt: String,
    /// Trimmed, case-folded prompt (used for comparison).
    folded_prompt: String,
    /// Accumulated delta text while unresolved.
    buffer: String,
    resolved: bool,
    /// After stripping an echo, leading whitespace is trimmed from the next
    /// emitted content even if it arrives in a later chunk.
    trim_pending: bool,
}

impl EchoFilter {
    pub fn new(prompt: &str) -> Self {
        let trimmed = prompt.trim();
        Self {
            prompt: trimmed.to_string(),
            folded_prompt: trimmed.to_lowercase(),
            buffer: String::new(),
            // An empty prompt cannot be echoed; skip buffering entirely.
            resolved: trimmed.is_empty(),
            trim_pending: false,
        }
    }

    /// Feed one delta chunk. Returns the text to emit now, if any.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        if self.resolved {
            if self.trim_pending {
                let trimmed = delta.trim_start();
                if trimmed.is_empty() {
                    return None;
                }
                self.trim_pending = false;
                return Some(trimmed.to_string());
            }
            if delta.is_empty() {
                return None;
            }
            return Some(delta.to_string());
        }

        self.buffer.push_str(delta);
        let folded_buffer = self.buffer.trim().to_lowercase();

        if folded_buffer.starts_with(&self.folded_prompt) {
            // Full echo present: drop the prompt's worth of characters from
            // the front of the (trimmed) buffer and emit whatever follows.
            let prompt_chars = self.prompt.chars().count();
            let remainder: String = self
                .buffer
                .trim_start()
                .chars()
                .skip(prompt_chars)
                .collect();
            let remainder = remainder.trim_start().to_string();
            self.resolved = true;
            self.buffer.clear();
            if remainder.is_empty() {
                // The whitespace between echo and answer may land in a
                // later chunk; keep trimming until content shows up.
                self.trim_pending = true;
                return None;
            }
            return Some(remainder);
        }

        if self.folded_prompt.starts_with(&folded_buffer)
            && self.buffer.len() <= self.prompt.len() * 2
        {
            // Still a prefix of the prompt; could yet become a full echo.
            // The length cap bounds how much whitespace padding can keep a
            // trivial trimmed prefix alive.
            return None;
        }

        // The buffer disagrees with the prompt on a character already seen;
        // no later input can repair a mid-string mismatch. All withheld
        // bytes were real content.
        self.resolved = true;
        Some(std::mem::take(&mut self.buffer))
    }

    /// Drain any withheld text. Called at turn end so that a response that
    /// never resolved (e.g. shorter than the prompt) is not swallowed.
    pub fn flush(&mut self) -> Option<String> {
        self.resolved = true;
        if self.buffer.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.buffer))
    }

    /// Strip a leading prompt echo from a complete message (non-streaming
    /// delivery path).
    pub fn strip_full(prompt: &str, text: &str) -> String {
        let trimmed_prompt = prompt.trim();
        if trimmed_prompt.is_empty() {
            return text.to_string();
        }
        let folded_text = text.trim().to_lowercase();
        if folded_text.starts_with(&trimmed_prompt.to_lowercase()) {
            let prompt_chars = trimmed_prompt.chars().count();
            let remainder: String = text.trim_start().chars().skip(prompt_chars).collect();
            return remainder.trim_start().to_string();
        }
        text.to_string()
    }
}
