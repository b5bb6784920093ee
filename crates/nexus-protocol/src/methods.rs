//! MCP method and notification names.

/// `initialize` request
pub const INITIALIZE: &str = "initialize";
/// `initialized` notification
pub const INITIALIZED: &str = "initialized";
/// `shutdown` request
pub const SHUTDOWN: &str = "shutdown";
/// `exit` notification
pub const EXIT: &str = "exit";

/// `resources/list` request
pub const RESOURCES_LIST: &str = "resources/list";
/// `resources/read` request
pub const RESOURCES_READ: &str = "resources/read";
/// `resources/subscribe` request
pub const RESOURCES_SUBSCRIBE: &str = "resources/subscribe";
/// `resources/unsubscribe` request
pub const RESOURCES_UNSUBSCRIBE: &str = "resources/unsubscribe";

/// `tools/list` request
pub const TOOLS_LIST: &str = "tools/list";
/// `tools/call` request
pub const TOOLS_CALL: &str = "tools/call";

/// `prompts/list` request
pub const PROMPTS_LIST: &str = "prompts/list";
/// `prompts/get` request
pub const PROMPTS_GET: &str = "prompts/get";

/// `sampling/sample` request. Sent by the server role to a client that
/// declared the `sampling` capability.
pub const SAMPLING_SAMPLE: &str = "sampling/sample";

/// `notifications/resources/updated` notification
pub const NOTIFY_RESOURCE_UPDATED: &str = "notifications/resources/updated";
/// `notifications/resources/list_changed` notification
pub const NOTIFY_RESOURCES_CHANGED: &str = "notifications/resources/list_changed";
/// `notifications/tools/list_changed` notification
pub const NOTIFY_TOOLS_CHANGED: &str = "notifications/tools/list_changed";
/// `notifications/prompts/list_changed` notification
pub const NOTIFY_PROMPTS_CHANGED: &str = "notifications/prompts/list_changed";
