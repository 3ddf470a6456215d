//! Domain model module declarations.

pub mod agent;
pub mod convoy;
pub mod health;
pub mod specialist;
