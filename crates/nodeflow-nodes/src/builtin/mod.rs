pub mod basic;
pub mod data;
pub mod network;
pub mod template;
