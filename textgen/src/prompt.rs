//! Prompt conventions and the prompt-building contract.
//!
//! A [`PromptConvention`] names a template family. Besides the text layout it
//! carries the turn-marker stop phrases and how many times each must be seen
//! before generation halts; those counts are template metadata and are only
//! applied to the family that declares them.

use crate::types::ChatTurn;
use serde::{Deserialize, Serialize};

/// Template family used to render prompts for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptConvention {
    #[default]
    Plain,
    Instruct,
    HumanBot,
    InstructVicuna,
    InstructWithEnd,
}

/// Stop phrases of a convention with their required encounter counts.
///
/// Phrase `i` requires `encounters[i % encounters.len()]` matches.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StopRules {
    pub phrases: Vec<String>,
    pub encounters: Vec<usize>,
}

impl StopRules {
    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    /// Pair every phrase with its required encounter count.
    pub fn pairs(&self) -> Vec<(&str, usize)> {
        self.phrases
            .iter()
            .enumerate()
            .map(|(i, phrase)| {
                let required = if self.encounters.is_empty() {
                    1
                } else {
                    self.encounters[i % self.encounters.len()]
                };
                (phrase.as_str(), required)
            })
            .collect()
    }
}

const HUMAN: &str = "<human>:";
const BOT: &str = "<bot>:";
const VICUNA_HUMAN: &str = "### Human:";
const VICUNA_ASSISTANT: &str = "### Assistant:";
const INSTRUCTION: &str = "### Instruction:";
const RESPONSE: &str = "### Response:";
const END: &str = "### End";

impl PromptConvention {
    pub fn stop_rules(&self) -> StopRules {
        match self {
            PromptConvention::HumanBot => StopRules {
                phrases: vec![
                    HUMAN.to_string(),
                    BOT.to_string(),
                    format!("\n{}", HUMAN),
                    format!("\n{}", BOT),
                ],
                encounters: vec![1, 2],
            },
            PromptConvention::InstructVicuna => StopRules {
                phrases: vec![
                    VICUNA_HUMAN.to_string(),
                    format!("\n{}", VICUNA_HUMAN),
                    format!("\n{}\n", VICUNA_HUMAN),
                    VICUNA_ASSISTANT.to_string(),
                    format!("\n{}", VICUNA_ASSISTANT),
                    format!("\n{}\n", VICUNA_ASSISTANT),
                ],
                encounters: vec![1, 2],
            },
            PromptConvention::InstructWithEnd => StopRules {
                phrases: vec![END.to_string()],
                encounters: vec![1],
            },
            PromptConvention::Plain | PromptConvention::Instruct => StopRules::default(),
        }
    }

    /// Markers that end a response when they show up in generated text.
    fn response_terminators(&self) -> &'static [&'static str] {
        match self {
            PromptConvention::HumanBot => &[HUMAN, BOT],
            PromptConvention::InstructVicuna => &[VICUNA_HUMAN, VICUNA_ASSISTANT],
            PromptConvention::Instruct => &[INSTRUCTION],
            PromptConvention::InstructWithEnd => &[END, INSTRUCTION],
            PromptConvention::Plain => &[],
        }
    }
}

/// Input for rendering one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnData<'a> {
    pub convention: PromptConvention,
    pub user_text: &'a str,
    /// Bounded rendering of earlier turns, possibly empty.
    pub context: &'a str,
}

/// Prompt text construction and response extraction.
///
/// Implementations must be deterministic for identical inputs.
pub trait PromptBuilder: Send + Sync {
    fn render(&self, turn: &TurnData<'_>) -> String;

    /// Clean the response out of `raw_output`, which is the decoded prompt
    /// followed by generated text.
    fn extract_response(
        &self,
        convention: PromptConvention,
        raw_output: &str,
        prompt_text: &str,
    ) -> String;

    /// Compact rendering of a completed turn for use as context.
    fn render_reduced(&self, convention: PromptConvention, turn: &ChatTurn) -> String;
}

/// Default builder covering every [`PromptConvention`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ConventionPromptBuilder;

impl ConventionPromptBuilder {
    fn instruction_block(convention: PromptConvention, user_text: &str) -> String {
        match convention {
            PromptConvention::Plain => user_text.to_string(),
            PromptConvention::Instruct | PromptConvention::InstructWithEnd => {
                format!("{}\n{}\n\n{}\n", INSTRUCTION, user_text, RESPONSE)
            }
            PromptConvention::HumanBot => format!("{} {}\n{}", HUMAN, user_text, BOT),
            PromptConvention::InstructVicuna => {
                format!("{} {}\n{}", VICUNA_HUMAN, user_text, VICUNA_ASSISTANT)
            }
        }
    }
}

impl PromptBuilder for ConventionPromptBuilder {
    fn render(&self, turn: &TurnData<'_>) -> String {
        let block = Self::instruction_block(turn.convention, turn.user_text);
        if turn.context.is_empty() {
            block
        } else if turn.context.ends_with('\n') {
            format!("{}{}", turn.context, block)
        } else {
            format!("{}\n{}", turn.context, block)
        }
    }

    fn extract_response(
        &self,
        convention: PromptConvention,
        raw_output: &str,
        prompt_text: &str,
    ) -> String {
        let generated = raw_output.strip_prefix(prompt_text).unwrap_or_else(|| {
            // Fall back to whatever follows the last response marker.
            let marker = match convention {
                PromptConvention::HumanBot => Some(BOT),
                PromptConvention::InstructVicuna => Some(VICUNA_ASSISTANT),
                PromptConvention::Instruct | PromptConvention::InstructWithEnd => Some(RESPONSE),
                PromptConvention::Plain => None,
            };
            marker
                .and_then(|m| raw_output.rfind(m).map(|at| &raw_output[at + m.len()..]))
                .unwrap_or(raw_output)
        });

        let end = convention
            .response_terminators()
            .iter()
            .filter_map(|marker| generated.find(marker))
            .min()
            .unwrap_or(generated.len());

        generated[..end].trim().to_string()
    }

    fn render_reduced(&self, convention: PromptConvention, turn: &ChatTurn) -> String {
        let response = turn.response.as_deref().unwrap_or("");
        match convention {
            PromptConvention::Plain => format!("{}\n{}\n", turn.user_text, response),
            PromptConvention::Instruct | PromptConvention::InstructWithEnd => format!(
                "{}\n{}\n\n{}\n{}\n",
                INSTRUCTION, turn.user_text, RESPONSE, response
            ),
            PromptConvention::HumanBot => {
                format!("{} {}\n{} {}\n", HUMAN, turn.user_text, BOT, response)
            }
            PromptConvention::InstructVicuna => format!(
                "{} {}\n{} {}\n",
                VICUNA_HUMAN, turn.user_text, VICUNA_ASSISTANT, response
            ),
        }
    }
}
