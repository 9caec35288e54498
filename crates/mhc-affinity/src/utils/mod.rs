pub mod data_handling;
pub mod logging;
pub mod stats;
pub mod utils;
