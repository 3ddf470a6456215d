//! Supervision logic.
//!
//! Covers agent spawning and reporting, the health watchdog, specialist
//! queues, convoys and their templates, and context rotation.

pub mod agents;
pub mod convoy;
pub mod health_monitor;
pub mod rotation;
pub mod spawner;
pub mod specialist_queue;
pub mod templates;
