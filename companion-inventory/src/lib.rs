//! # companion-inventory
//!
//! Bulk application inventory handoff to the stats daemon.
//!
//! Call [`InventoryTransmitter::transmit`] with the write end of a channel
//! whose read end the daemon already holds; records are streamed from a
//! throwaway worker thread and the channel is closed when it finishes.
//! [`InventoryReader`] is the consumer-side decoder.

pub mod error;
pub mod transmitter;
pub mod wire;

pub use error::InventoryError;
pub use transmitter::{stream_inventory, InventoryTransmitter, TransmitHandle, TransmitReport};
pub use wire::{encode_record, ApplicationInfo, InventoryReader};
