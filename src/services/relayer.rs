use ethers::{
    providers::{JsonRpcClient, PendingTransaction},
    types::{TransactionReceipt, U64},
};
use tokio::time::timeout;

use crate::{
    config::LedgerSettings,
    error::{AppError, Result},
};

use super::onchain::{ConfirmedTx, LedgerOp};

/// Waits for submitted operator transactions to reach the configured depth.
pub struct Relayer {
    settings: LedgerSettings,
}

impl Relayer {
    pub fn new(settings: LedgerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Resolves once the receipt is confirmed. A dropped transaction or a
    /// reverted receipt is a failure; an elapsed wait is a timeout, never a success.
    pub async fn wait_for_receipt<'a, P: JsonRpcClient>(
        &self,
        op: LedgerOp,
        pending: PendingTransaction<'a, P>,
    ) -> Result<TransactionReceipt> {
        let tx_hash = format!("{:#x}", pending.tx_hash());
        tracing::debug!("{} submitted: {}", op.as_str(), tx_hash);

        let waited = timeout(
            self.settings.tx_timeout,
            pending.confirmations(self.settings.confirmations),
        )
        .await;

        let receipt = match waited {
            Err(_) => {
                tracing::warn!(
                    "{} not confirmed within {}s: {}",
                    op.as_str(),
                    self.settings.tx_timeout.as_secs(),
                    tx_hash
                );
                return Err(AppError::TransactionTimeout(self.settings.tx_timeout.as_secs()));
            }
            Ok(Err(e)) => {
                return Err(AppError::BlockchainRPC(format!(
                    "{} receipt polling failed for {}: {}",
                    op.as_str(),
                    tx_hash,
                    e
                )));
            }
            Ok(Ok(None)) => {
                return Err(AppError::TransactionFailed(format!(
                    "{} dropped from mempool: {}",
                    op.as_str(),
                    tx_hash
                )));
            }
            Ok(Ok(Some(receipt))) => receipt,
        };

        if receipt.status != Some(U64::from(1)) {
            return Err(AppError::TransactionFailed(format!(
                "{} reverted on-chain: {}",
                op.as_str(),
                tx_hash
            )));
        }

        tracing::info!(
            "{} confirmed: {} (block {:?})",
            op.as_str(),
            tx_hash,
            receipt.block_number
        );
        Ok(receipt)
    }

    // Internal helper that supports `confirmed` operations.
    pub fn confirmed(receipt: &TransactionReceipt) -> ConfirmedTx {
        ConfirmedTx {
            tx_hash: format!("{:#x}", receipt.transaction_hash),
            block_number: receipt.block_number.map(|n| n.as_u64()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::H256;

    #[test]
    fn confirmed_renders_hash_and_block() {
        let receipt = TransactionReceipt {
            transaction_hash: H256::repeat_byte(0xab),
            block_number: Some(U64::from(42)),
            status: Some(U64::from(1)),
            ..Default::default()
        };
        let tx = Relayer::confirmed(&receipt);
        assert!(tx.tx_hash.starts_with("0xabab"));
        assert_eq!(tx.block_number, Some(42));
    }
}
