use anyhow::Result;

use crate::context::Engine;

/// Liveness check behind the /health endpoint: the queue must answer.
pub async fn health_check(engine: &Engine) -> Result<()> {
    engine.ping().await?;
    Ok(())
}
