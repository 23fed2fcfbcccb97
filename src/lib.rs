pub mod bootstrap;
pub mod config;
pub mod dirsize;
pub mod emitter;
pub mod lifecycle;
pub mod sampler;
pub mod tracking;
