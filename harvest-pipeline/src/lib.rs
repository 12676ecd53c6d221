#![allow(clippy::missing_docs_in_private_items)]

pub mod acquirer;
pub mod assemble;
pub mod handoff;
pub mod relevance;
pub mod relocate;
pub mod renderer;
pub mod throttle;
pub mod workarea;
