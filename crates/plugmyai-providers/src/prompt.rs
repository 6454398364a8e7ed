use plugmyai_core::{Message, Role};

/// Flatten a conversation into the single prompt string a CLI agent accepts.
///
/// A lone message is passed through verbatim. Otherwise system and assistant
/// turns get a bracketed role header and turns are separated by a blank line.
pub fn flatten(messages: &[Message]) -> String {
    if let [only] = messages {
        return only.content.clone();
    }
    messages
        .iter()
        .map(|m| match m.role {
            Role::System => format!("[System]\n{}", m.content),
            Role::Assistant => format!("[Assistant]\n{}", m.content),
            Role::User => m.content.clone(),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
