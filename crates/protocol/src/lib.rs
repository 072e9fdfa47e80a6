pub mod config;
pub mod frame;
pub mod input;
pub mod mesh;
pub mod messages;

pub use config::*;
pub use frame::*;
pub use input::*;
pub use mesh::*;
pub use messages::*;
