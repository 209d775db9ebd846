pub mod config;
pub mod controller;
pub mod coordination;
pub mod datastore;
pub mod error;
pub mod inventory;
pub mod registry;
pub mod shutdown;
pub mod worker;
