mod pool_probe;
mod route_registrar;
mod storage;

pub use pool_probe::{PoolProbe, QueryObserver};
pub use route_registrar::RouteRegistrar;
pub use storage::{ConnectionState, Database, SessionStore, Storage};
