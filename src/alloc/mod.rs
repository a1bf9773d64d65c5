pub mod bootstrap;
pub mod header;
pub mod histogram;
pub mod interpose;
pub mod resolve;
