pub mod madt;
pub mod redir;
pub mod slots;

/// A global system interrupt number, flat across all I/O interrupt controllers
pub type Gsi = u32;
