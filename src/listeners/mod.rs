//! Inbound command listeners: a TCP line socket and a drop directory.

pub mod directory;
pub mod socket;

pub use directory::DirectoryListener;
pub use socket::SocketListener;
