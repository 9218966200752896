//! Wire protocol for BerryMed-style pulse oximeters.

pub mod frame;
