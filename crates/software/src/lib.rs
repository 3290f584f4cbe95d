//! This crate contains architecture-agnostic logic for Polyvolt, a six-voice polyphonic MIDI-to-CV converter. The
//! device receives [MIDI](https://midi.org/midi-1-0) over a serial link and turns it into pitch, velocity,
//! modulation and pitch bend voltages produced by a bank of
//! [MCP4728](https://www.microchip.com/en-us/product/MCP4728) quad DACs, plus a gate line per voice and a shared
//! trigger line for use with [CV/gate](https://en.wikipedia.org/wiki/CV/gate) synthesizers.
//!
//! All hardware access goes through [`embedded_hal`] traits, so everything here runs under `cargo test` on the host.

#![deny(missing_docs)]
#![no_std]

#[macro_use]
mod fmt;

pub mod configuration;
pub mod mcp4728;
pub mod midi;
pub mod provisioning;
pub mod soft_i2c;
pub mod voice;

#[cfg(test)]
mod mock;
