pub mod types;
pub mod io;
