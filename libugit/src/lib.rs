#![deny(rust_2018_idioms)]

#[macro_use]
extern crate smallvec;

#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

#[macro_use]
extern crate bitflags;

#[macro_use]
extern crate anyhow;

#[macro_use]
extern crate log;

#[macro_use]
mod macros;

#[cfg(test)]
#[macro_use]
pub mod test_utils;

pub mod checkout;
pub mod cmd;
pub mod config;
pub mod diff;
pub mod error;
pub mod graph;
pub mod hash;
pub mod index;
pub mod iter;
pub mod merge;
pub mod obj;
pub mod pack;
pub mod path;
pub mod pkt;
pub mod protocol;
pub mod refs;
pub mod remote;
pub mod repo;
pub mod revwalk;
pub mod status;
pub mod transport;
pub mod xdiff;

mod fs;
mod io;
mod lockfile;
mod odb;
mod serialize;
mod signature;
mod time;

pub use odb::Odb;
pub use serialize::Serialize;
pub use signature::{GitTime, Signature};
