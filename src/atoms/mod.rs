// ── Opsleuth Atoms ─────────────────────────────────────────────────────────
// Pure building blocks: data types, constants, traits, errors.
// Nothing in this layer performs I/O or imports from engine/.

pub mod constants;
pub mod error;
pub mod investigation_types;
pub mod traits;
pub mod types;
