//! Shared state handed to every connection session: the store, the static
//! config, and the replication role (master fan-out state, or none).

use std::sync::Arc;

use crate::config::Config;
use crate::replication::master::Master;
use crate::store::Store;

pub enum Role {
    Master(Arc<Master>),
    Replica,
}

pub struct AppState {
    pub store: Arc<Store>,
    pub config: Config,
    pub replid: String,
    pub role: Role,
}
