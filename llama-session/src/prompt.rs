//! Prompt-format styles applied to user prompts before tokenization.

use serde::{Deserialize, Serialize};

pub const PROMPT_PLACEHOLDER: &str = "{prompt}";
pub const SYSTEM_PLACEHOLDER: &str = "{system_prompt}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptFormat {
    /// Raw prompt text.
    #[default]
    None,
    /// `custom_prompt_format` with `{prompt}` substituted.
    Custom,
    #[serde(rename = "chatml")]
    ChatMl,
    Alpaca,
}

/// A resolved prompt template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    format: PromptFormat,
    custom: Option<String>,
}

impl PromptTemplate {
    pub fn new(format: PromptFormat, custom: Option<&str>) -> Result<Self, String> {
        let custom = match format {
            PromptFormat::Custom => {
                let template = custom
                    .ok_or_else(|| "prompt_format custom requires custom_prompt_format".to_string())?;
                if !template.contains(PROMPT_PLACEHOLDER) {
                    return Err(format!(
                        "custom_prompt_format must contain {}",
                        PROMPT_PLACEHOLDER
                    ));
                }
                Some(template.to_string())
            }
            _ => None,
        };
        Ok(Self { format, custom })
    }

    pub fn format(&self) -> PromptFormat {
        self.format
    }

    /// Whether the system prompt is rendered into the template instead of
    /// being evaluated on its own.
    pub fn embeds_system_prompt(&self) -> bool {
        self.custom
            .as_deref()
            .is_some_and(|t| t.contains(SYSTEM_PLACEHOLDER))
    }

    pub fn render(&self, prompt: &str, system_prompt: Option<&str>) -> String {
        match self.format {
            PromptFormat::None => prompt.to_string(),
            PromptFormat::Custom => match self.custom.as_deref() {
                Some(template) => template
                    .replace(SYSTEM_PLACEHOLDER, system_prompt.unwrap_or(""))
                    .replace(PROMPT_PLACEHOLDER, prompt),
                None => prompt.to_string(),
            },
            PromptFormat::ChatMl => format!(
                "<|im_start|>user\n{}<|im_end|>\n<|im_start|>assistant\n",
                prompt
            ),
            PromptFormat::Alpaca => format!("### Instruction:\n{}\n\n### Response:\n", prompt),
        }
    }
}
