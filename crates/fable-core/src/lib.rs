pub mod errors;
pub mod events;
pub mod generation;
pub mod ids;
pub mod render;
pub mod session;
pub mod summarizer;
pub mod turn;
pub mod world;
