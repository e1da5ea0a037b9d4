use crate::models::chat::ConversationTurn;

pub const SAFE_INSTRUCTION: &str =
    "VERY IMPORTANT: Be safeguarded. Assume the user is a kid, so tell her gently if she's acting inappropriately.";
pub const PIRATE_INSTRUCTION: &str = "Talk as a pirate!";
/// Leads the system block of rendered prompts for instruct models.
pub const LANGUAGE_INSTRUCTION: &str = "Always reply to the user in the language they are speaking.";

/// Assistant persona assembled from front-end toggles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Persona {
    pub instructions: String,
    pub safe: bool,
    pub pirate: bool,
    pub character: Option<String>,
}

impl Persona {
    /// Concatenates the enabled parts with single spaces. Returns `None` when
    /// nothing is enabled so no system turn is sent.
    pub fn system_instructions(&self) -> Option<String> {
        let character = self.character
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| format!("Assume the role of {} and respond accordingly.", c));

        let parts: Vec<&str> = [
            Some(self.instructions.trim()),
            self.safe.then_some(SAFE_INSTRUCTION),
            self.pirate.then_some(PIRATE_INSTRUCTION),
            character.as_deref(),
        ]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect();

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

/// Renders turns as a ChatML prompt ending with an open assistant block.
pub fn render_chatml_prompt(turns: &[ConversationTurn]) -> String {
    let mut prompt = String::new();
    for turn in turns {
        prompt.push_str("<|im_start|>");
        prompt.push_str(turn.role.as_str());
        prompt.push('\n');
        prompt.push_str(&turn.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}
