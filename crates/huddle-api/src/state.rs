use std::sync::Arc;

use huddle_db::Database;
use huddle_gateway::credentials::CredentialVerifier;

use crate::media::MediaVerifier;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub media: Arc<dyn MediaVerifier>,
}
