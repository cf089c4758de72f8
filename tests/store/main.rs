mod common;

mod cursors;
mod expiry;
mod lifecycle;
mod recovery;
mod references;
mod streams;
mod unlock_count;
