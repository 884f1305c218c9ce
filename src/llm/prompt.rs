//! Prompt construction and reply parsing for neural tasks.

use serde_json::{Map, Value};

use crate::agent::task::TaskDefinition;

use super::Prompt;

const ANSWER_RULES: &str = "You resolve exactly one task. Reply with a single JSON object \
containing the required output keys and nothing else.";

/// Builds the prompt for one attempt of a neural task.
pub fn build_prompt(task: &TaskDefinition, inputs: &Map<String, Value>, persona: Option<&str>) -> Prompt {
    let mut system = String::new();
    if let Some(persona) = persona.filter(|p| !p.trim().is_empty()) {
        system.push_str(persona.trim());
        system.push_str("\n\n");
    }
    system.push_str(ANSWER_RULES);

    let mut user = format!("Task: {}\n", task.name);
    if let Some(instructions) = &task.instructions {
        user.push_str(&format!("\nInstructions:\n{}\n", instructions.trim()));
    }
    let rendered = serde_json::to_string_pretty(inputs).unwrap_or_else(|_| "{}".to_string());
    user.push_str(&format!("\nInputs:\n{rendered}\n"));
    if !task.output_schema.is_empty() {
        user.push_str(&format!(
            "\nRequired output keys:\n{}\n",
            task.output_schema.describe()
        ));
    }

    Prompt { system, user }
}

/// Extracts the first JSON object from a model reply.
///
/// Tolerates code fences and prose around the object.
pub fn parse_response(content: &str) -> Result<Value, String> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err("empty reply".into());
    }
    for (start, _) in trimmed.match_indices('{') {
        let mut stream = serde_json::Deserializer::from_str(&trimmed[start..]).into_iter::<Value>();
        if let Some(Ok(value @ Value::Object(_))) = stream.next() {
            return Ok(value);
        }
    }
    let preview: String = trimmed.chars().take(80).collect();
    Err(format!("no JSON object in reply: {preview}"))
}
