use chrono::{DateTime, Utc};
use serde::Serialize;

/// One line of an agent's reasoning history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScratchpadEntry {
    Thought {
        cycle: u32,
        text: String,
    },
    Action {
        cycle: u32,
        tool: String,
        input: serde_json::Value,
    },
    Observation {
        cycle: u32,
        success: bool,
        content: String,
    },
}

impl ScratchpadEntry {
    pub fn cycle(&self) -> u32 {
        match self {
            Self::Thought { cycle, .. }
            | Self::Action { cycle, .. }
            | Self::Observation { cycle, .. } => *cycle,
        }
    }
}

/// Thought / action / observation history of one agent invocation.
///
/// Entries alternate strictly within a cycle: a thought, then optionally an
/// action, then optionally that action's observation. The final answer can
/// be set once.
#[derive(Debug, Clone, Serialize)]
pub struct Scratchpad {
    entries: Vec<ScratchpadEntry>,
    final_answer: Option<String>,
    started_at: DateTime<Utc>,
    cycles: u32,
    cost: f64,
}

impl Scratchpad {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            final_answer: None,
            started_at: Utc::now(),
            cycles: 0,
            cost: 0.0,
        }
    }

    /// Start the next cycle and return its 1-based number.
    pub fn begin_cycle(&mut self) -> u32 {
        self.cycles += 1;
        self.cycles
    }

    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Accumulated cost of the actions taken.
    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn add_cost(&mut self, cost: f64) {
        self.cost += cost;
    }

    pub fn entries(&self) -> &[ScratchpadEntry] {
        &self.entries
    }

    fn last_in_cycle(&self) -> Option<&ScratchpadEntry> {
        self.entries.last().filter(|e| e.cycle() == self.cycles)
    }

    pub fn record_thought(&mut self, text: impl Into<String>) {
        debug_assert!(self.last_in_cycle().is_none(), "one thought per cycle");
        self.entries.push(ScratchpadEntry::Thought {
            cycle: self.cycles,
            text: text.into(),
        });
    }

    pub fn record_action(&mut self, tool: impl Into<String>, input: serde_json::Value) {
        debug_assert!(matches!(
            self.last_in_cycle(),
            Some(ScratchpadEntry::Thought { .. })
        ));
        self.entries.push(ScratchpadEntry::Action {
            cycle: self.cycles,
            tool: tool.into(),
            input,
        });
    }

    pub fn record_observation(&mut self, success: bool, content: impl Into<String>) {
        debug_assert!(matches!(
            self.last_in_cycle(),
            Some(ScratchpadEntry::Action { .. })
        ));
        self.entries.push(ScratchpadEntry::Observation {
            cycle: self.cycles,
            success,
            content: content.into(),
        });
    }

    /// Set the final answer. Returns false if one was already set.
    pub fn conclude(&mut self, answer: impl Into<String>) -> bool {
        if self.final_answer.is_some() {
            return false;
        }
        self.final_answer = Some(answer.into());
        true
    }

    pub fn final_answer(&self) -> Option<&str> {
        self.final_answer.as_deref()
    }

    pub fn is_concluded(&self) -> bool {
        self.final_answer.is_some()
    }

    pub fn thought_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ScratchpadEntry::Thought { .. }))
            .count()
    }

    pub fn action_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ScratchpadEntry::Action { .. }))
            .count()
    }

    pub fn observation_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, ScratchpadEntry::Observation { .. }))
            .count()
    }

    /// Render the history in the text protocol the reasoning backend reads.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            match entry {
                ScratchpadEntry::Thought { text, .. } => {
                    out.push_str(&format!("Thought: {text}\n"));
                }
                ScratchpadEntry::Action { tool, input, .. } => {
                    out.push_str(&format!("Action: {tool}\nAction Input: {input}\n"));
                }
                ScratchpadEntry::Observation {
                    success, content, ..
                } => {
                    if *success {
                        out.push_str(&format!("Observation: {content}\n"));
                    } else {
                        out.push_str(&format!("Observation: ERROR: {content}\n"));
                    }
                }
            }
        }
        out
    }

    /// One-line summary for logs and stage output.
    pub fn summary(&self) -> String {
        let outcome = match &self.final_answer {
            Some(answer) => format!("answered: {answer}"),
            None => "no final answer".to_string(),
        };
        format!(
            "{} cycle(s), {} action(s), {}",
            self.cycles,
            self.action_count(),
            outcome
        )
    }

    /// Stage log lines, one per entry plus the summary.
    pub fn log_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .entries
            .iter()
            .map(|e| match e {
                ScratchpadEntry::Thought { cycle, text } => format!("[{cycle}] thought: {text}"),
                ScratchpadEntry::Action { cycle, tool, input } => {
                    format!("[{cycle}] action: {tool} {input}")
                }
                ScratchpadEntry::Observation {
                    cycle,
                    success,
                    content,
                } => format!(
                    "[{cycle}] observation ({}): {content}",
                    if *success { "ok" } else { "error" }
                ),
            })
            .collect();
        lines.push(self.summary());
        lines
    }
}

impl Default for Scratchpad {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cycle_entries_render_in_protocol_format() {
        let mut pad = Scratchpad::new();
        assert_eq!(pad.begin_cycle(), 1);
        pad.record_thought("look it up");
        pad.record_action("search", json!({"q": "rust"}));
        pad.record_observation(true, "found 3 results");
        pad.begin_cycle();
        pad.record_thought("try again");
        pad.record_action("search", json!({}));
        pad.record_observation(false, "timeout");

        let text = pad.render();
        assert!(text.starts_with("Thought: look it up\nAction: search\nAction Input: {\"q\":\"rust\"}\n"));
        assert!(text.contains("Observation: found 3 results\n"));
        assert!(text.ends_with("Observation: ERROR: timeout\n"));
        assert_eq!(pad.thought_count(), 2);
        assert_eq!(pad.action_count(), 2);
        assert_eq!(pad.observation_count(), 2);
    }

    #[test]
    fn test_final_answer_set_once() {
        let mut pad = Scratchpad::new();
        pad.begin_cycle();
        pad.record_thought("done");
        assert!(pad.conclude("42"));
        assert!(!pad.conclude("43"));
        assert_eq!(pad.final_answer(), Some("42"));
        assert!(pad.is_concluded());
    }

    #[test]
    fn test_summary_and_log_lines() {
        let mut pad = Scratchpad::new();
        pad.begin_cycle();
        pad.record_thought("hmm");
        assert_eq!(pad.summary(), "1 cycle(s), 0 action(s), no final answer");
        pad.conclude("yes");
        let lines = pad.log_lines();
        assert_eq!(lines[0], "[1] thought: hmm");
        assert_eq!(lines.last().unwrap(), "1 cycle(s), 0 action(s), answered: yes");
    }
}
