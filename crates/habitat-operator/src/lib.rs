//! habitat-operator: runs Habitat services on Kubernetes as StatefulSets

pub mod cache;
pub mod client;
pub mod config;
pub mod controllers;
pub mod events;
pub mod habitat;
pub mod health;
pub mod key;
pub mod registration;
pub mod scheme;

#[cfg(test)]
mod testing;

pub use habitat::Habitat;
