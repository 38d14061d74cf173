mod client;
pub mod types;

pub use client::RpcClient;
pub use types::{AccountInfo, AccountInfoResponse, SignatureInfo, TransactionMeta, TransactionResponse};
