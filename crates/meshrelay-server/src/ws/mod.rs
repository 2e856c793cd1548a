pub mod connections;
pub mod handler;
pub mod router;

pub use connections::SessionTable;
pub use router::SignalingRouter;
