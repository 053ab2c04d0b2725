// src/lib.rs
//
// Host-side driver for the CAN Bus Triple.
//
// - io::cbt::command - command encoder
// - io::cbt::framer  - device -> host frame classification
// - io::cbt::eeprom  - 512-byte settings image codec
// - io::cbt::link    - transport engine (reader thread, busy/timeout/cancel)
// - controller       - named device operations on top of the link

#[macro_use]
pub mod logging;

pub mod config;
pub mod controller;
pub mod io;

pub use config::LinkConfig;
pub use controller::CbtController;
pub use io::{CanMessage, CanMode, CbtLink, Command, Expect, IoError, JsonReply, LinkEvent, Reply, Settings};
