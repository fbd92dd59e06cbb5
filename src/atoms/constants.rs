// ── Opsleuth Atoms: Constants ──────────────────────────────────────────────
// All named constants for the crate live here.
// Rationale: collecting constants in one place eliminates magic strings,
// makes auditing easier, and keeps every layer's code self-documenting.

// ── Memory namespace roots ─────────────────────────────────────────────────
// Namespace strings are stable identifiers: changing a root orphans every
// record written under the old one. Treat as frozen.
pub(crate) const NS_PREFERENCES_ROOT: &str = "/opsleuth/users";
pub(crate) const NS_INFRA_ROOT: &str = "/opsleuth/infra";
pub(crate) const NS_INVESTIGATIONS_ROOT: &str = "/opsleuth/investigations";
// Conversation turns are session-scoped by construction.
pub(crate) const NS_CONVERSATIONS_ROOT: &str = "/opsleuth/conversations";

// ── Memory retrieval and persistence limits ────────────────────────────────
// Used by the planner's context assembly and the conversation writer.
pub(crate) const DEFAULT_RECALL_LIMIT: usize = 5;
// A single persisted conversation event is cut at this many characters;
// anything longer gets the explicit truncation marker appended.
pub(crate) const MAX_MEMORY_EVENT_CHARS: usize = 4_000;
pub(crate) const TRUNCATION_MARKER: &str = "[TRUNCATED]";

// ── Wall-clock budgets ─────────────────────────────────────────────────────
// A specialist invocation is the unit of timeout; the investigation budget
// is the driver's last line of defense and must stay well above it.
pub(crate) const DEFAULT_SPECIALIST_TIMEOUT_SECS: u64 = 120;
pub(crate) const DEFAULT_INVESTIGATION_TIMEOUT_SECS: u64 = 600;
pub(crate) const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;

// ── Loop budgets ───────────────────────────────────────────────────────────
// Caps the model→tools→model cycle inside one specialist invocation.
pub(crate) const DEFAULT_MAX_TOOL_ROUNDS: u32 = 10;
// Same tool failing this many times in a row gets blocked for the rest
// of the invocation.
pub(crate) const MAX_CONSECUTIVE_TOOL_FAILS: u32 = 3;

// ── Tool gateway ───────────────────────────────────────────────────────────
// Gateway tool names arrive as `gw_{gateway_id}_{tool}`; the allow-list
// check and display strip the transport prefix.
pub(crate) const GATEWAY_TOOL_PREFIX: &str = "gw_";
// Startup tools/list is the one integration point retried with backoff.
pub(crate) const GATEWAY_LOAD_MAX_RETRIES: u32 = 3;
