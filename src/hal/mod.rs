//! Interfaces to the platform services consumed by the bootloader
//! core: non-volatile storage, the CAN controller and the system
//! clock. Concrete drivers live with the target firmware; the
//! [`doubles`] module provides in-memory stand-ins for tests.

pub mod can;
pub mod storage;
pub mod time;

#[cfg(test)]
pub mod doubles;
