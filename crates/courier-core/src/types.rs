//! Protocol payload types exchanged with a server.
//!
//! Field names follow the wire format (camelCase renames where needed).
//! Deserialization is tolerant: optional payload fields default rather
//! than fail, so newer servers with extra fields keep working.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol versions this client can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2025-03-26", "2024-11-05"];

/// The version offered during the handshake.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// Identity the client presents during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Client name.
    pub name: String,
    /// Client version string.
    pub version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Server identity from the `initialize` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Server name.
    pub name: String,
    /// Server version string.
    #[serde(default)]
    pub version: String,
}

/// Server capabilities from the `initialize` response.
///
/// Negotiated once during the handshake and immutable thereafter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Present when the server exposes tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    /// Present when the server exposes resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourcesCapability>,
    /// Present when the server exposes prompts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompts: Option<PromptsCapability>,
}

/// Tool-related capability flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsCapability {
    /// Whether the server emits `notifications/tools/list_changed`.
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

/// Resource-related capability flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesCapability {
    /// Whether individual resources can be subscribed to.
    #[serde(default)]
    pub subscribe: bool,
    /// Whether the server emits `notifications/resources/list_changed`.
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

/// Prompt-related capability flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PromptsCapability {
    /// Whether the server emits `notifications/prompts/list_changed`.
    #[serde(default, rename = "listChanged")]
    pub list_changed: bool,
}

/// The `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    /// The protocol version the server settled on.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Capabilities the server advertises.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    /// Server identity, when provided.
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// A tool definition from the `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique per server.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's arguments.
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// A content block inside tool results and prompt messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text payload.
        text: String,
    },
    /// Base64-encoded image data.
    Image {
        /// Base64 payload.
        data: String,
        /// MIME type of the image.
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    /// A reference to a server resource.
    Resource {
        /// Resource URI.
        uri: String,
        /// MIME type, when known.
        #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
}

impl ContentBlock {
    /// Flatten the block to a display string.
    pub fn to_text(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Image { mime_type, .. } => format!("[image: {mime_type}]"),
            Self::Resource { uri, .. } => format!("[resource: {uri}]"),
        }
    }
}

/// The `tools/call` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallToolResult {
    /// Content blocks produced by the tool.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    /// Whether the tool itself reported a failure.
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}

impl CallToolResult {
    /// All content blocks flattened into a single newline-joined string.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .map(ContentBlock::to_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A resource listing entry from `resources/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Resource URI.
    pub uri: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type, when known.
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// The `resources/read` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResourceContents {
    /// One entry per returned representation of the resource.
    #[serde(default)]
    pub contents: Vec<ResourceContent>,
}

/// A single representation of a read resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceContent {
    /// URI of the resource this content belongs to.
    pub uri: String,
    /// MIME type, when known.
    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Textual payload, for text resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 payload, for binary resources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<String>,
}

/// A prompt listing entry from `prompts/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDescriptor {
    /// Prompt name, unique per server.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Arguments the prompt accepts.
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// One argument a prompt accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied.
    #[serde(default)]
    pub required: bool,
}

/// The role of a prompt message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user.
    User,
    /// The assistant.
    Assistant,
}

/// A single message within a prompt template.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptMessage {
    /// Message author role.
    pub role: Role,
    /// Message content.
    pub content: ContentBlock,
}

/// The `prompts/get` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GetPromptResult {
    /// Description of the rendered prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// The rendered messages.
    #[serde(default)]
    pub messages: Vec<PromptMessage>,
}

/// The `tools/list` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    /// Advertised tools.
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// The `resources/list` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListResourcesResult {
    /// Advertised resources.
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
}

/// The `prompts/list` response payload.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListPromptsResult {
    /// Advertised prompts.
    #[serde(default)]
    pub prompts: Vec<PromptDescriptor>,
}
