use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::message::Role;

/// Turn wrapping for models that expect a particular instruction layout in
/// plain chat content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstructionFormat {
    #[default]
    Default,
    Alpaca,
    ChatMl,
    Vicuna,
    Llama,
}

impl InstructionFormat {
    /// Wrap one turn. System content is never touched.
    pub fn apply(self, role: Role, content: &str) -> String {
        match (self, role) {
            (_, Role::System) | (InstructionFormat::Default, _) => content.to_string(),
            (InstructionFormat::Alpaca, Role::User) => {
                format!("### Instruction:\n{content}\n\n### Response:")
            }
            (InstructionFormat::ChatMl, Role::User) => {
                format!("<|im_start|>user\n{content}<|im_end|>")
            }
            (InstructionFormat::ChatMl, Role::Assistant) => {
                format!("<|im_start|>assistant\n{content}<|im_end|>")
            }
            (InstructionFormat::Vicuna, Role::User) => format!("USER: {content}\nASSISTANT:"),
            (InstructionFormat::Llama, Role::User) => format!("[INST] {content} [/INST]"),
            (_, Role::Assistant) => content.to_string(),
        }
    }
}

impl InstructionFormat {
    pub const ALL: [InstructionFormat; 5] = [
        InstructionFormat::Default,
        InstructionFormat::Alpaca,
        InstructionFormat::ChatMl,
        InstructionFormat::Vicuna,
        InstructionFormat::Llama,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InstructionFormat::Default => "default",
            InstructionFormat::Alpaca => "alpaca",
            InstructionFormat::ChatMl => "chatml",
            InstructionFormat::Vicuna => "vicuna",
            InstructionFormat::Llama => "llama",
        }
    }
}

impl FromStr for InstructionFormat {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|format| format.as_str().eq_ignore_ascii_case(value.trim()))
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "unknown instruction format '{value}' (expected default, alpaca, chatml, vicuna or llama)"
                ))
            })
    }
}
