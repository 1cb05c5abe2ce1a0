//! Postback construction: who receives a conversion, whether they may, and
//! what request they get.

mod antifraud;
mod macros;
mod resolver;
mod status;
mod tracker;

pub use antifraud::*;
pub use resolver::*;
pub use tracker::*;
