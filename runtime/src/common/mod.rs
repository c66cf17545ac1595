//! Cross-cutting helpers shared by the scheduler and the data fabric.

pub mod global_data;
