//! Background workers

pub mod deployer;
