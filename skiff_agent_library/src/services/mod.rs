pub mod containers;
pub mod janitor;
pub mod transfer;
pub mod update;
