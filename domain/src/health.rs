use std::sync::Arc;

use crate::{Context, HealthProbe};

/// Reports whether the backing store is reachable.
pub struct HealthChecker<P: HealthProbe> {
    probe: Arc<P>,
}

impl<P: HealthProbe> HealthChecker<P> {
    pub fn new(probe: Arc<P>) -> Self {
        Self { probe }
    }

    pub async fn health_check(&self, ctx: &Context) -> bool {
        self.probe.is_connected(ctx).await
    }
}

impl<P: HealthProbe> Clone for HealthChecker<P> {
    fn clone(&self) -> Self {
        Self {
            probe: Arc::clone(&self.probe),
        }
    }
}
