//! The daemon's three long-running units (§10.1): central command,
//! scheduler worker and the Unix-socket command server.

pub mod central_command;
pub mod command_server;
pub mod scheduler_unit;
