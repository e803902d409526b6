use std::sync::Arc;

use crate::{
    config::AppConfig,
    sioma_client::{ReferenceSource, SubmissionSink},
};

/// Estado compartido por los handlers. Los colaboradores externos se
/// inyectan como trait objects; no hay estado mutable.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub reference: Arc<dyn ReferenceSource>,
    pub submission: Arc<dyn SubmissionSink>,
}
