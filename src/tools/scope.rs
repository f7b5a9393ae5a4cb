//! Per-pipeline gateway state: the plan-mode flag and the command transcript.

use serde::Serialize;
use std::collections::VecDeque;

/// One shell or verification run recorded for the agent terminal.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub tool: String,
    pub agent: String,
    pub command: String,
    pub output: String,
    pub success: bool,
    pub timestamp: i64,
}

/// Bounded command log. Once it grows past `cap`, only the newest `keep`
/// entries are retained.
#[derive(Debug, Clone)]
pub struct Transcript {
    entries: VecDeque<TranscriptEntry>,
    cap: usize,
    keep: usize,
}

impl Transcript {
    pub fn new(cap: usize, keep: usize) -> Self {
        let cap = cap.max(1);
        Self {
            entries: VecDeque::new(),
            cap,
            keep: keep.min(cap),
        }
    }

    pub fn push(&mut self, entry: TranscriptEntry) {
        self.entries.push_back(entry);
        if self.entries.len() > self.cap {
            let excess = self.entries.len() - self.keep;
            self.entries.drain(..excess);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.iter().cloned().collect()
    }
}

/// Gateway state owned by one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineScope {
    pub plan_mode: bool,
    pub transcript: Transcript,
}

impl PipelineScope {
    pub fn new(plan_mode: bool, cap: usize, keep: usize) -> Self {
        Self {
            plan_mode,
            transcript: Transcript::new(cap, keep),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: usize) -> TranscriptEntry {
        TranscriptEntry {
            tool: "run_command".into(),
            agent: "validator".into(),
            command: format!("echo {}", n),
            output: n.to_string(),
            success: true,
            timestamp: n as i64,
        }
    }

    #[test]
    fn test_transcript_trims_to_newest_on_overflow() {
        let mut t = Transcript::new(500, 250);
        for n in 0..500 {
            t.push(entry(n));
        }
        assert_eq!(t.len(), 500);

        t.push(entry(500));
        assert_eq!(t.len(), 250);
        let entries = t.entries();
        assert_eq!(entries.first().unwrap().output, "251");
        assert_eq!(entries.last().unwrap().output, "500");
    }

    #[test]
    fn test_transcript_small_caps() {
        let mut t = Transcript::new(3, 1);
        for n in 0..4 {
            t.push(entry(n));
        }
        assert_eq!(t.len(), 1);
        assert_eq!(t.entries()[0].output, "3");
    }
}
