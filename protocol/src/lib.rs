#![cfg_attr(not(test), no_std)]
//! BrewOS wire protocol, shared by the controller and bridge boards.
//!
//! Both ends of the UART link speak the same framed binary protocol:
//! a fixed header, a bounded payload, and a CRC-16/CCITT trailer, with
//! per-frame sequence numbers for deduplication and an ACK/NACK retry
//! scheme for commands. This crate holds everything both boards must
//! agree on: the frame codec, the byte-stream parser, the message
//! schemas, the sequencing/retry engine, and the OTA chunk format.
//!
//! The crate is `no_std`; all buffers are fixed-capacity (`heapless`).

pub mod bootloader;
pub mod frame;
pub mod link;
pub mod message;
pub mod parser;
