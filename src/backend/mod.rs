pub mod conn;

pub use conn::{BackendConn, BackendOptions, SharedBackendConn};
