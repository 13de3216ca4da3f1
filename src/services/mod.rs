// Service layer: business operations on top of the db, shared by every caller.

pub mod writer;

pub use writer::LocalWriter;
