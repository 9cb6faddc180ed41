//! Three-tier industrial control gateway: a serial Modbus RTU field
//! controller, a Modbus-TCP-facing register image, and an optional
//! supervisor relay role, composed in [`crate::main`].

pub mod auto_engine;
pub mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod json_server;
pub mod logging;
pub mod modbus_server;
pub mod register_image;
pub mod rtu;
pub mod serial;
pub mod supervisor;
