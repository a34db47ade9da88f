/// Separator between the two participant ids of a conversation key
pub const KEY_SEPARATOR: char = '_';

/// Maximum participant id length in bytes
pub const MAX_PARTICIPANT_ID_LEN: usize = 128;

/// Maximum idempotency key length in bytes
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Maximum message content size in bytes (16 KiB)
pub const MAX_CONTENT_BYTES: usize = 16 * 1024;

/// Maximum number of attachment references on a single message
pub const MAX_ATTACHMENTS: usize = 10;

/// Maximum length of a single attachment reference in bytes
pub const MAX_ATTACHMENT_REF_LEN: usize = 2048;

/// Characters kept in a conversation's last-message snippet
pub const SNIPPET_MAX_CHARS: usize = 120;

/// Default number of messages in a history window
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Upper bound on a single history window
pub const MAX_PAGE_SIZE: u32 = 200;

/// Default per-topic broadcast buffer of the subscription hub
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Default upper bound on a single store round-trip, in milliseconds
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;
