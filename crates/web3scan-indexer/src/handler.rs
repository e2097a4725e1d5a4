use async_trait::async_trait;

use crate::types::DecodedEvent;

/// Business logic run for every decoded event, inside the reducer's open
/// transaction and before the event itself is stored.
///
/// Returning an error rolls back the transaction of the whole result the
/// event belongs to.
#[async_trait]
pub trait EventHandler<Tx: Send>: Send + Sync + 'static {
    async fn handle(&self, event: &DecodedEvent, tx: &mut Tx) -> anyhow::Result<()>;
}

/// Default handler: logs every event and leaves the transaction untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl<Tx: Send> EventHandler<Tx> for LogHandler {
    async fn handle(&self, event: &DecodedEvent, _tx: &mut Tx) -> anyhow::Result<()> {
        tracing::info!(
            contract = ?event.contract,
            block = event.block_number,
            tx_hash = ?event.transaction_hash,
            args = %event.args_json(),
            "Event {}",
            event.event
        );
        Ok(())
    }
}
