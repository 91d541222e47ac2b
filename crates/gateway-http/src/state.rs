use std::path::PathBuf;
use std::sync::Arc;

use gateway_auth::Authenticator;
use gateway_core::AuthMode;
use gateway_dispatch::{Dispatcher, InstanceLifecycle};
use gateway_scheduling::LoadBalancer;
use gateway_store::ObservationStore;

use crate::logs::LogBroadcaster;

/// Everything an axum handler needs, composed once at startup and cloned
/// cheaply per request (every field is an `Arc` or `Copy`).
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<ObservationStore>,
    pub balancer: Arc<LoadBalancer>,
    pub dispatcher: Arc<Dispatcher>,
    pub lifecycle: Arc<InstanceLifecycle>,
    pub authenticator: Arc<Authenticator>,
    pub log_broadcaster: Arc<LogBroadcaster>,
    pub auth_mode: AuthMode,
    pub templates_dir: PathBuf,
}
