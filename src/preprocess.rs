//! Rewrites OpenAI-shaped message lists into plain-text messages the upstream
//! accepts. The upstream knows nothing about tools or tool results, so both
//! are expressed as prompt text.

use crate::openai::{ChatMessage, Role, ToolChoice, ToolDefinition};
use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_PERSONA: &str = "You are a helpful assistant.";

/// Present in every injected tool catalog; guards against injecting twice.
pub const TOOL_CATALOG_MARKER: &str = "<tool_catalog>";
const TOOL_CATALOG_END: &str = "</tool_catalog>";

/// Present in the thinking instruction; guards against injecting twice.
pub const THINKING_MARKER: &str = "<thinking>";

const THINKING_INSTRUCTION: &str = "Before you answer, think the problem through inside <thinking> and </thinking> tags:\n\
1. Restate what is being asked and note any constraints.\n\
2. Break the problem into smaller steps and work through each one.\n\
3. Check the intermediate results for mistakes or missing cases.\n\
4. Decide on the final answer.\n\
After the closing </thinking> tag, write only the final answer for the user.";

const TOOL_USE_DIRECTIVE: &str = "Use the available tools when they help answer this request. To call a tool, reply with the tool_calls JSON block described in the system prompt.";

const TOOL_EXECUTED_PLACEHOLDER: &str = "tool executed";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreparedMessage {
    pub role: Role,
    pub content: String,
}

impl PreparedMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PreprocessOptions {
    pub tool_support: bool,
    pub thinking_prompt: bool,
}

/// Whether this request should be answered with extracted tool calls.
pub fn tools_active(
    tools: &[ToolDefinition],
    tool_choice: Option<&ToolChoice>,
    tool_support: bool,
) -> bool {
    tool_support && !tools.is_empty() && !tool_choice.is_some_and(ToolChoice::is_none)
}

/// Tool prompt first, then the thinking prompt when enabled.
pub fn preprocess(
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    tool_choice: Option<&ToolChoice>,
    options: PreprocessOptions,
) -> Vec<PreparedMessage> {
    let prepared = inject_tool_prompt(messages, tools, tool_choice, options.tool_support);
    if options.thinking_prompt {
        inject_thinking_prompt(prepared)
    } else {
        prepared
    }
}

pub fn inject_tool_prompt(
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    tool_choice: Option<&ToolChoice>,
    tool_support: bool,
) -> Vec<PreparedMessage> {
    let mut prepared: Vec<PreparedMessage> = messages.iter().map(normalize_message).collect();
    if !tools_active(tools, tool_choice, tool_support) {
        return prepared;
    }

    let catalog = tool_catalog(tools);
    match prepared.iter_mut().find(|m| m.role == Role::System) {
        Some(system) if system.content.contains(TOOL_CATALOG_MARKER) => {}
        Some(system) => append_block(&mut system.content, &catalog),
        None => prepared.insert(
            0,
            PreparedMessage::system(format!("{DEFAULT_PERSONA}\n\n{catalog}")),
        ),
    }

    let directive = match tool_choice {
        Some(choice) if choice.requests_tool_use() => Some(TOOL_USE_DIRECTIVE.to_string()),
        Some(choice) => choice.function_name().map(|name| {
            format!(
                "Call the function `{name}` to answer this request, using the tool_calls JSON block described in the system prompt."
            )
        }),
        None => None,
    };
    if let Some(directive) = directive {
        if let Some(last) = prepared.last_mut() {
            if last.role == Role::User && !last.content.contains(&directive) {
                append_block(&mut last.content, &directive);
            }
        }
    }
    prepared
}

pub fn inject_thinking_prompt(mut messages: Vec<PreparedMessage>) -> Vec<PreparedMessage> {
    match messages.iter_mut().find(|m| m.role == Role::System) {
        Some(system) if system.content.contains(THINKING_MARKER) => {}
        Some(system) => append_block(&mut system.content, THINKING_INSTRUCTION),
        None => messages.insert(
            0,
            PreparedMessage::system(format!("{DEFAULT_PERSONA}\n\n{THINKING_INSTRUCTION}")),
        ),
    }
    messages
}

fn append_block(target: &mut String, block: &str) {
    if !target.trim().is_empty() {
        target.push_str("\n\n");
    }
    target.push_str(block);
}

fn normalize_message(message: &ChatMessage) -> PreparedMessage {
    match message.role {
        Role::Tool | Role::Function => {
            let name = message
                .name
                .as_deref()
                .or(message.tool_call_id.as_deref())
                .filter(|n| !n.is_empty())
                .unwrap_or("unknown");
            let result = message
                .content
                .as_ref()
                .map(|c| c.to_tool_result_text())
                .unwrap_or_default();
            let result = if result.trim().is_empty() {
                TOOL_EXECUTED_PLACEHOLDER.to_string()
            } else {
                result
            };
            PreparedMessage::new(
                Role::Assistant,
                format!("Tool `{name}` returned:\n```\n{result}\n```"),
            )
        }
        Role::Assistant => {
            let mut content = message.content_text();
            if let Some(calls) = message.tool_calls.as_ref().filter(|c| !c.is_empty()) {
                let payload = serde_json::json!({ "tool_calls": calls });
                append_block(&mut content, &format!("```json\n{payload}\n```"));
            }
            PreparedMessage::new(Role::Assistant, content)
        }
        role => PreparedMessage::new(role, message.content_text()),
    }
}

fn tool_catalog(tools: &[ToolDefinition]) -> String {
    let mut out = String::new();
    out.push_str(TOOL_CATALOG_MARKER);
    out.push_str("\n# Available tools\n\nYou can call the following functions.\n");
    for tool in tools {
        let function = &tool.function;
        out.push_str(&format!("\n## {}\n", function.name));
        let purpose = function
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .unwrap_or("No description provided.");
        out.push_str(&format!("Purpose: {purpose}\n"));
        out.push_str(&parameter_table(function.parameters.as_ref()));
    }
    out.push_str(
        "\nTo call tools, reply with one fenced block in exactly this form:\n\
```json\n\
{\"tool_calls\":[{\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"<function name>\",\"arguments\":{\"<parameter>\":\"<value>\"}}}]}\n\
```\n\
Only call functions listed above. When no tool is needed, answer normally.\n",
    );
    out.push_str(TOOL_CATALOG_END);
    out
}

fn parameter_table(parameters: Option<&Value>) -> String {
    let properties = parameters
        .and_then(|p| p.get("properties"))
        .and_then(Value::as_object)
        .filter(|props| !props.is_empty());
    let Some(properties) = properties else {
        return "Parameters: none\n".to_string();
    };
    let required: Vec<&str> = parameters
        .and_then(|p| p.get("required"))
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut out = String::from(
        "Parameters:\n| name | type | required | description |\n|---|---|---|---|\n",
    );
    for (name, schema) in properties {
        let flag = if required.contains(&name.as_str()) {
            "required"
        } else {
            "optional"
        };
        let mut description = schema
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("-")
            .replace('\n', " ");
        if let Some(values) = schema.get("enum").and_then(Value::as_array) {
            let values: Vec<String> = values
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect();
            description.push_str(&format!(" (one of: {})", values.join(", ")));
        }
        out.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            name,
            schema_type(schema),
            flag,
            description
        ));
    }
    out
}

fn schema_type(schema: &Value) -> String {
    match schema.get("type") {
        Some(Value::String(t)) => t.clone(),
        Some(Value::Array(types)) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join("|"),
        _ => "any".to_string(),
    }
}
