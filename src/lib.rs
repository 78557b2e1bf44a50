pub mod config;
pub mod error;
pub mod handlers;
pub mod htm;
pub mod manager;
pub mod privatizer;
pub mod schema;
pub mod store;
pub mod tls;

use std::sync::Arc;

use manager::PrivacyManager;
use store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub manager: Arc<PrivacyManager>,
}
