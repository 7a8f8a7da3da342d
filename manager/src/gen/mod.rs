//! Generators shipped with the manager. All of them speak the proposal
//! protocol; campaigns provide their own by implementing
//! [`crate::specs::Generator`].

pub mod evolve;
pub mod localopt;
pub mod sampling;
pub mod support;

pub use evolve::Evolutionary;
pub use localopt::LocalRefine;
pub use sampling::UniformSample;
