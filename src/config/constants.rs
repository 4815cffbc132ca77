/// Busy timeout handed to SQLite so lock contention is a bounded wait
pub const BUSY_TIMEOUT_MS: u64 = 5_000; // 5 seconds

pub const DB_FILE_PATH: &str = "${HOME}/.local/share/personal-agent/personal_agent.db";

pub const LOG_FILE_PATH: &str = "/tmp/personal-agent.log";

pub const DEFAULT_ENDPOINT: &str = "http://localhost:8080";

pub const DEFAULT_MODEL: &str = "local";

pub const MAX_OUTPUT_TOKENS: usize = 1024;

pub const TEMPERATURE: f32 = 0.7;

/// Name given to a conversation created implicitly under a project
pub const LAZY_CONVERSATION_NAME: &str = "Conversation";

/// Name given to a conversation created implicitly without a project
pub const FREE_CONVERSATION_NAME: &str = "Free conversation";

/// Stop streaming after this many consecutive whitespace-only deltas
pub const MAX_BLANK_DELTAS: usize = 20;
