//! Error types for the Ember block-production engine.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("serialization: {0}")] Serialization(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("no coinbase script available")] NoCoinbaseScript,
    #[error("block validity check failed: {0}")] ValidityFailed(String),
    #[error("coinbase scriptSig too long: {len} > {max}")] CoinbaseScriptSigTooLong { len: usize, max: usize },
    #[error(transparent)] Tx(#[from] TxError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("transaction already in pool: {0}")] AlreadyExists(String),
    #[error("coinbase transactions cannot enter the pool: {0}")] Coinbase(String),
    #[error("conflicts with pool tx {existing_txid} on outpoint {outpoint}")] Conflict { new_txid: String, existing_txid: String, outpoint: String },
    #[error(transparent)] Tx(#[from] TxError),
}
