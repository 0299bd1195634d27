//! 🪣➡️🔍 invx: storage-write notifications in, searchable inventory documents out.
//!
//! 🧠 Knowledge graph, leaves first:
//! - `envelopes`: unwrap bus/queue/storage envelopes into `StorageWriteRecord`s
//! - `routing`: storage key ⇄ `(index, doc_id)`
//! - `transforms`: principal + capture-time fixups, bulk unit rendering
//! - `composers`: pack units into bodies under the request size budget
//! - `backends`: blob store, queue, and search cluster traits + implementations
//! - `recovery`: rebuild and requeue failed items
//! - `lifecycle`: create new indices and register dashboard patterns
//! - `supervisors`: one invocation, end to end
//!
//! 🦆

pub mod app_config;
pub mod backends;
pub mod common;
pub mod composers;
pub mod envelopes;
pub mod lifecycle;
pub mod recovery;
pub mod routing;
pub mod supervisors;
pub mod transforms;

pub use app_config::{AppConfig, load_config};
pub use supervisors::{InvocationReport, Supervisor};
