//! Per-terminal output bookkeeping: scrollback history and the hold-back
//! buffer used while a terminal is hidden.

use std::collections::VecDeque;

/// Lines of scrollback kept per terminal.
pub const HISTORY_LINES: usize = 5000;

const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

/// Bounded line history. A trailing partial line counts as a line.
#[derive(Debug, Clone)]
pub struct OutputHistory {
    lines: VecDeque<Vec<u8>>,
    partial: Vec<u8>,
    max_lines: usize,
}

impl Default for OutputHistory {
    fn default() -> Self {
        Self::new(HISTORY_LINES)
    }
}

impl OutputHistory {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: Vec::new(),
            max_lines: max_lines.max(1),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (line, tail) = rest.split_at(pos + 1);
            self.partial.extend_from_slice(line);
            let complete = std::mem::take(&mut self.partial);
            self.lines.push_back(complete);
            rest = tail;
        }
        self.partial.extend_from_slice(rest);
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
        }
    }

    pub fn line_count(&self) -> usize {
        self.lines.len() + usize::from(!self.partial.is_empty())
    }

    /// The last `max_lines` lines, oldest first, and how many were taken.
    pub fn tail(&self, max_lines: usize) -> (Vec<u8>, usize) {
        let take_partial = !self.partial.is_empty() && max_lines > 0;
        let complete = max_lines
            .saturating_sub(usize::from(take_partial))
            .min(self.lines.len());
        let mut bytes = Vec::new();
        for line in self.lines.iter().skip(self.lines.len() - complete) {
            bytes.extend_from_slice(line);
        }
        if take_partial {
            bytes.extend_from_slice(&self.partial);
        }
        (bytes, complete + usize::from(take_partial))
    }
}

/// Output routing for one terminal.
///
/// While buffering, output accumulates in `pending`. Once buffering is
/// switched off the held bytes stay queued, and new output queues behind
/// them, until [`SessionOutput::take_pending`] drains them in order.
#[derive(Debug, Default)]
pub struct SessionOutput {
    history: OutputHistory,
    buffering: bool,
    pending: Vec<u8>,
    dropped_bytes: usize,
}

impl SessionOutput {
    pub fn new(history_lines: usize) -> Self {
        Self {
            history: OutputHistory::new(history_lines),
            ..Self::default()
        }
    }

    /// Record `data`; returns true when it should be delivered right away.
    pub fn accept(&mut self, data: &[u8]) -> bool {
        self.history.push(data);
        if !self.buffering && self.pending.is_empty() {
            return true;
        }
        self.pending.extend_from_slice(data);
        if self.pending.len() > MAX_PENDING_BYTES {
            let excess = self.pending.len() - MAX_PENDING_BYTES;
            self.pending.drain(..excess);
            self.dropped_bytes += excess;
        }
        false
    }

    pub fn set_buffering(&mut self, enabled: bool) {
        self.buffering = enabled;
    }

    pub fn is_buffering(&self) -> bool {
        self.buffering
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Bytes discarded from the front of an overfull hold-back buffer.
    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }

    pub fn take_pending(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.pending)
    }

    pub fn history(&self) -> &OutputHistory {
        &self.history
    }
}
