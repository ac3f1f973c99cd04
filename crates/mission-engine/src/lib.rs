pub mod bus;
pub mod config;
pub mod controller;
pub mod decomposer;
pub mod error;
pub mod model;
pub mod monitor;
pub mod router;
pub mod scheduler;
pub mod scorer;
pub mod store;
pub mod workers;

pub use bus::*;
pub use config::*;
pub use controller::*;
pub use decomposer::*;
pub use error::*;
pub use model::*;
pub use monitor::*;
pub use router::*;
pub use scheduler::*;
pub use scorer::*;
pub use store::*;
pub use workers::*;
