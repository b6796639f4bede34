pub mod connection;
pub mod io;
