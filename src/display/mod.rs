//! Display-client state machine and event demultiplexing, per spec.md
//! §4.9/§6.4. Rendering itself is out of scope (see [`driver::Renderer`]);
//! this module only owns the LIVE/PLAYBACK cursor logic and the mapping
//! from input events to cursor/view transitions.

pub mod driver;
pub mod events;
