//! Wire events exchanged with the realtime service.
//!
//! Every frame is a JSON object discriminated by its `type` field. Server
//! events with an unrecognised type decode to [`ServerEvent::Unknown`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SESSION_INSTRUCTIONS: &str = "You are a helpful assistant. You have access to functions. \
Use them when appropriate and never question their output, always trust them and assume they are correct.";

// ── Client → server ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate { response: ResponseRequest },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub output_modalities: Vec<String>,
    pub instructions: String,
    pub tools: Vec<Value>,
    pub tool_choice: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        role: String,
        content: Vec<ContentPart>,
    },
    FunctionCallOutput {
        call_id: String,
        output: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRequest {
    pub instructions: String,
}

impl ClientEvent {
    /// Text-only session with the given tools and automatic tool choice.
    pub fn session_update(tools: Vec<Value>) -> Self {
        Self::SessionUpdate {
            session: SessionConfig {
                kind: "realtime".into(),
                output_modalities: vec!["text".into()],
                instructions: SESSION_INSTRUCTIONS.into(),
                tools,
                tool_choice: "auto".into(),
            },
        }
    }

    pub fn user_message(text: &str) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::Message {
                role: "user".into(),
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }

    pub fn response_request(instructions: &str) -> Self {
        Self::ResponseCreate {
            response: ResponseRequest {
                instructions: instructions.into(),
            },
        }
    }

    pub fn function_output(call_id: &str, output: &str) -> Self {
        Self::ConversationItemCreate {
            item: ConversationItem::FunctionCallOutput {
                call_id: call_id.into(),
                output: output.into(),
            },
        }
    }

    /// Ask for a natural-language reply built on a function result.
    pub fn function_continue(name: &str, arguments: &str, result: &str) -> Self {
        Self::response_request(&format!(
            "A function named '{name}' was called with arguments {arguments}. \
The function returned: {result}. Write a clear reply in natural language, make sure you mention \
that you have called a custom function and that writes the original problem and incorporates \
the function result directly as if it was your own. Never recompute or override the function \
output, always treat it as ground truth."
        ))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::SessionUpdate { .. } => "session.update",
            Self::ConversationItemCreate { .. } => "conversation.item.create",
            Self::ResponseCreate { .. } => "response.create",
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ── Server → client ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    #[serde(rename = "session.updated")]
    SessionUpdated {
        #[serde(default)]
        session: Option<Value>,
    },

    #[serde(rename = "response.created")]
    ResponseCreated { response: ResponseInfo },

    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        delta: String,
        #[serde(default)]
        item_id: Option<String>,
        #[serde(default)]
        sequence_number: Option<u64>,
    },

    #[serde(rename = "response.output_text.done")]
    OutputTextDone {
        #[serde(default)]
        text: Option<String>,
    },

    #[serde(rename = "response.done")]
    ResponseDone {
        #[serde(default)]
        response: Option<ResponseInfo>,
    },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        #[serde(default)]
        item: Option<Value>,
    },

    #[serde(rename = "conversation.item.done")]
    ConversationItemDone {
        #[serde(default)]
        item: Option<Value>,
    },

    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone(FunctionCall),

    #[serde(rename = "response.failed")]
    ResponseFailed { response: FailedResponse },

    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        event_id: Option<String>,
        error: ErrorDetail,
    },

    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }

    /// Events that close the current streaming response.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::OutputTextDone { .. }
                | Self::ResponseDone { .. }
                | Self::OutputItemDone { .. }
                | Self::ConversationItemDone { .. }
                | Self::FunctionCallArgumentsDone(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionInfo {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResponseInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FunctionCall {
    pub call_id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct FailedResponse {
    #[serde(default)]
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub param: Option<String>,
}

impl ErrorDetail {
    pub fn code(&self) -> &str {
        self.code.as_deref().unwrap_or_default()
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }
}
