#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod error;
pub mod lights;
pub mod reconcile;
pub mod shadow;
pub mod shutdown;
pub mod states;
