//! Host-side HCI transport layer for a Bluetooth stack.
//!
//! This crate sits between an upper Bluetooth stack and a hardware
//! abstraction layer (HAL) that talks to a Bluetooth controller over a
//! serial-like channel. It moves typed packets (COMMAND, ACL, SCO, EVENT)
//! between the two sides while enforcing the controller's command
//! flow-control rules ([`scheduler`], [`correlator`]), reassembling inbound
//! packets from a byte stream ([`reassembly`]), and driving the firmware
//! bring-up / teardown lifecycle ([`lifecycle`]).
//!
//! The HAL, vendor driver, fragmenter, low-power manager and upper-stack
//! dispatcher are all external collaborators, expressed here purely as the
//! trait contracts in [`hal`], [`vendor`], [`fragmenter`], [`low_power`] and
//! [`upward`] respectively; this crate does not implement a real transport.
//!
//! [`facade::HciTransport`] is the stable entry point.

pub mod btsnoop;
pub mod config;
pub mod correlator;
pub mod error;
pub mod event_filter;
pub mod facade;
pub mod fragmenter;
pub mod hal;
pub mod lifecycle;
pub mod low_power;
pub mod packet;
pub mod reactor;
pub mod reassembly;
pub mod scheduler;
pub mod upward;
pub mod vendor;

#[cfg(test)]
mod test_support;

pub use config::{BluetoothDeviceAddress, HciConfig};
pub use error::Error;
pub use facade::HciTransport;
pub use lifecycle::LifecycleState;
pub use packet::{Packet, PacketType, UpwardTag};
