// genex - Generative environment explorer
//
// A single image becomes a 360 degree environment with depth, physics and a
// walkable grid. An agent explores it and the trajectory is turned into a
// semantic 3D map.

pub mod agent;
pub mod color;
pub mod config;
pub mod environment;
pub mod error;
pub mod mapping;
pub mod server;

pub use agent::{ExplorationAgent, ExplorationState, Goal};
pub use config::Settings;
pub use environment::{Action, Environment, EnvironmentGenerator};
pub use error::{GenexError, Result};
pub use mapping::{MappingTask, SemanticMap};
