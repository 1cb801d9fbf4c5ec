//! Task launcher: the process that actually spawns and supervises children
//! on behalf of the daemon, plus its wire framing and in-daemon client.

pub mod client;
pub mod server;
pub mod wire;

pub use client::{LauncherClient, TaskStart};
pub use server::Launcher;
