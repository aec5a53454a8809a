//! OSC message formatting: templates, conditions, and the incoming-message
//! learning mode.
//!
//! A `MessageTemplate` turns one channel's CV value into a zero-or-more
//! `GeneratedMessage`s per engine tick, gated by an `OscCondition`. Two
//! built-in templates cover the common cases (continuous CV, gate/trigger);
//! callers can add more.

use std::collections::HashMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OscConditionType {
    Always,
    GreaterThan,
    LessThan,
    Equal,
    Range,
    Changed,
    Threshold,
}

/// Gate on whether a template fires this tick. `Threshold` is edge-triggered
/// with hysteresis; `Changed` fires once per distinct value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OscCondition {
    pub condition_type: OscConditionType,
    pub value1: f32,
    pub value2: f32,
    pub hysteresis: f32,
    #[serde(skip)]
    last_state: bool,
    #[serde(skip)]
    last_value: Option<f32>,
}

impl Default for OscCondition {
    fn default() -> Self {
        Self {
            condition_type: OscConditionType::Always,
            value1: 0.0,
            value2: 0.0,
            hysteresis: 0.0,
            last_state: false,
            last_value: None,
        }
    }
}

impl OscCondition {
    pub fn always() -> Self {
        Self::default()
    }

    pub fn threshold(value1: f32, hysteresis: f32) -> Self {
        Self { condition_type: OscConditionType::Threshold, value1, hysteresis, ..Default::default() }
    }

    /// Evaluate against the current value, mutating edge-detection state
    /// for `Changed`/`Threshold`.
    pub fn evaluate(&mut self, current: f32) -> bool {
        match self.condition_type {
            OscConditionType::Always => true,
            OscConditionType::GreaterThan => current > self.value1,
            OscConditionType::LessThan => current < self.value1,
            OscConditionType::Equal => (current - self.value1).abs() < f32::EPSILON,
            OscConditionType::Range => current >= self.value1 && current <= self.value2,
            OscConditionType::Changed => {
                let changed = self.last_value != Some(current);
                self.last_value = Some(current);
                changed
            }
            OscConditionType::Threshold => {
                // Rising edge arms at value1 itself; hysteresis only gates
                // the reset (falling below value1 - hysteresis), so a
                // value that lingers just above value1 doesn't re-fire.
                if !self.last_state && current > self.value1 {
                    self.last_state = true;
                    true
                } else if self.last_state && current < self.value1 - self.hysteresis {
                    self.last_state = false;
                    true
                } else {
                    false
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgumentSource {
    Cv,
    Constant,
    /// One of a small fixed set of named formulas (see `evaluate_formula`).
    Calculated,
}

/// Turns one channel's CV reading into an address and argument list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTemplate {
    pub name: String,
    pub description: String,
    /// e.g. `/cv/{channel}`; `{channel}` is replaced with the channel index.
    pub address_pattern: String,
    pub enabled: bool,
    pub priority: i32,
    pub condition: OscCondition,
    pub argument_sources: Vec<ArgumentSource>,
    pub constant_values: Vec<f32>,
    pub calculation_formulas: Vec<String>,
    pub scale_factor: f32,
    pub offset: f32,
}

impl MessageTemplate {
    pub fn generate_address(&self, channel: usize) -> String {
        self.address_pattern.replace("{channel}", &channel.to_string())
    }

    pub fn generate_arguments(&self, cv_values: &[f32], channel: usize) -> Vec<f32> {
        let cv = cv_values.get(channel).copied().unwrap_or(0.0);
        let mut args = Vec::with_capacity(self.argument_sources.len());
        for (i, source) in self.argument_sources.iter().enumerate() {
            let value = match source {
                ArgumentSource::Cv => cv * self.scale_factor + self.offset,
                ArgumentSource::Constant => self.constant_values.get(i).copied().unwrap_or(0.0),
                ArgumentSource::Calculated => self
                    .calculation_formulas
                    .get(i)
                    .map(|f| evaluate_formula(f, cv))
                    .unwrap_or(cv),
            };
            args.push(value);
        }
        args
    }
}

/// A small, fixed vocabulary of calculation formulas. Not a general
/// expression evaluator - templates that need more should be added here
/// by name, the way the gate template's `cv > 0.5 ? 1 : 0` was.
fn evaluate_formula(formula: &str, cv: f32) -> f32 {
    match formula {
        "cv > 0.5 ? 1 : 0" => {
            if cv > 0.5 {
                1.0
            } else {
                0.0
            }
        }
        _ => cv,
    }
}

#[derive(Debug, Clone)]
pub struct GeneratedMessage {
    pub address: String,
    pub arguments: Vec<f32>,
    pub priority: i32,
}

/// One address pattern observed from an incoming OSC stream, accumulated
/// while learning mode is on.
#[derive(Debug, Clone)]
pub struct LearnedPattern {
    pub address: String,
    pub last_values: Vec<f32>,
    pub last_received: Instant,
    pub receive_count: u64,
}

/// Owns the template library, per-target statistics, and the learning-mode
/// pattern table. One instance per engine.
pub struct FormatManager {
    templates: Vec<MessageTemplate>,
    learning_mode: bool,
    /// When set, learning only tracks patterns bound for this channel
    /// (supplemental restriction: `set_learning_target`).
    learning_target: Option<usize>,
    learned_patterns: Vec<LearnedPattern>,
    sent_counts: HashMap<String, u64>,
    received_counts: HashMap<String, u64>,
}

impl FormatManager {
    pub fn new() -> Self {
        let mut manager = Self {
            templates: Vec::new(),
            learning_mode: false,
            learning_target: None,
            learned_patterns: Vec::new(),
            sent_counts: HashMap::new(),
            received_counts: HashMap::new(),
        };
        manager.load_builtin_templates();
        manager
    }

    fn load_builtin_templates(&mut self) {
        self.templates.push(MessageTemplate {
            name: "basic_cv".into(),
            description: "Continuous CV value transmission".into(),
            address_pattern: "/cv/{channel}".into(),
            enabled: true,
            priority: 1,
            condition: OscCondition::always(),
            argument_sources: vec![ArgumentSource::Cv],
            constant_values: Vec::new(),
            calculation_formulas: Vec::new(),
            scale_factor: 1.0,
            offset: 0.0,
        });

        self.templates.push(MessageTemplate {
            name: "gate".into(),
            description: "Gate/trigger detection with hysteresis".into(),
            address_pattern: "/gate/{channel}".into(),
            enabled: true,
            priority: 2,
            condition: OscCondition::threshold(0.5, 0.1),
            argument_sources: vec![ArgumentSource::Calculated],
            constant_values: Vec::new(),
            calculation_formulas: vec!["cv > 0.5 ? 1 : 0".into()],
            scale_factor: 1.0,
            offset: 0.0,
        });
    }

    pub fn add_template(&mut self, template: MessageTemplate) {
        self.templates.push(template);
    }

    pub fn remove_template(&mut self, name: &str) {
        self.templates.retain(|t| t.name != name);
    }

    pub fn templates(&self) -> &[MessageTemplate] {
        &self.templates
    }

    /// Evaluate every enabled template's condition against each channel's CV
    /// value and collect the messages that should go out this tick.
    pub fn generate_messages(&mut self, cv_values: &[f32]) -> Vec<GeneratedMessage> {
        let mut out = Vec::new();
        for template in &mut self.templates {
            if !template.enabled {
                continue;
            }
            for (channel, &cv) in cv_values.iter().enumerate() {
                if !template.condition.evaluate(cv) {
                    continue;
                }
                out.push(GeneratedMessage {
                    address: template.generate_address(channel),
                    arguments: template.generate_arguments(cv_values, channel),
                    priority: template.priority,
                });
            }
        }
        out
    }

    pub fn set_learning_mode(&mut self, enabled: bool) {
        self.learning_mode = enabled;
        if enabled {
            self.learned_patterns.clear();
        }
    }

    pub fn is_learning_mode(&self) -> bool {
        self.learning_mode
    }

    /// Restrict learning to one channel's incoming traffic. `None` learns
    /// everything.
    pub fn set_learning_target(&mut self, channel: Option<usize>) {
        self.learning_target = channel;
    }

    pub fn learn_message(&mut self, address: &str, args: &[f32], channel: Option<usize>) {
        if !self.learning_mode {
            return;
        }
        if self.learning_target.is_some() && self.learning_target != channel {
            return;
        }
        if let Some(existing) = self.learned_patterns.iter_mut().find(|p| p.address == address) {
            existing.last_values = args.to_vec();
            existing.last_received = Instant::now();
            existing.receive_count += 1;
        } else {
            self.learned_patterns.push(LearnedPattern {
                address: address.to_string(),
                last_values: args.to_vec(),
                last_received: Instant::now(),
                receive_count: 1,
            });
        }
    }

    pub fn learned_patterns(&self) -> &[LearnedPattern] {
        &self.learned_patterns
    }

    pub fn record_sent(&mut self, address: &str) {
        *self.sent_counts.entry(address.to_string()).or_insert(0) += 1;
    }

    pub fn record_received(&mut self, address: &str) {
        *self.received_counts.entry(address.to_string()).or_insert(0) += 1;
    }

    pub fn total_sent(&self) -> u64 {
        self.sent_counts.values().sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received_counts.values().sum()
    }

    pub fn reset_statistics(&mut self) {
        self.sent_counts.clear();
        self.received_counts.clear();
    }
}

impl Default for FormatManager {
    fn default() -> Self {
        Self::new()
    }
}
