// Opsleuth — Multi-Agent SRE Investigation Engine
//
// One user query becomes one investigation: a planner turns the query plus
// long-term memory context into an ordered plan, a routing state machine
// walks the plan one specialist at a time, each specialist runs a bounded
// LLM+tool-calling loop against a tool gateway, and an aggregator merges
// everything into a single final answer — with the results written back to
// a namespaced, append-only memory store for the next session.
//
// Layering:
//   atoms/   — pure data types, constants, traits, errors (no I/O)
//   engine/  — providers, gateway, memory, planner, router, specialists,
//              aggregator, and the investigation driver
//
// Hosts construct an `EngineConfig`, wire an `EngineState` with a memory
// backend and a tool gateway, and call
// `Investigator::run_investigation(query, user_id, session_id, auto_approve)`.

pub mod atoms;
pub mod engine;

pub use atoms::error::{EngineError, EngineResult};
pub use atoms::investigation_types::{
    InvestigationPlan, MemoryContext, MemoryRecord, PlanComplexity, SessionState, SpecialistKind,
    StateUpdate, TraceEvent,
};
pub use atoms::traits::{AiProvider, MemoryBackend, ToolGateway};
pub use atoms::types::{Message, ProviderConfig, ProviderKind, Role, StreamChunk, ToolDefinition};
pub use engine::gateway::HttpToolGateway;
pub use engine::investigation::{InvestigationSession, Investigator};
pub use engine::memory::{MemoryKind, MemoryStore, SqliteMemoryStore};
pub use engine::providers::AnyProvider;
pub use engine::state::{EngineConfig, EngineState, ModelRouting};
