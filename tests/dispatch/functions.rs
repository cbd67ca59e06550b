//! Remote functions shared by the integration tests.

use std::fmt;
use std::time::Duration;

use remote_fn::{remote_fn, FunctionError, RemoteException, ValidationError};
use serde::{Deserialize, Serialize};

#[remote_fn]
pub fn add(a: i64, b: i64) -> i64 {
    a + b
}

#[remote_fn(name = "greet")]
pub fn greeting(name: String, punctuation: Option<String>) -> String {
    format!("hello {}{}", name, punctuation.unwrap_or_default())
}

#[remote_fn]
pub fn fail(reason: String) -> Result<(), FunctionError> {
    Err(FunctionError::new("ValueError", reason))
}

#[remote_fn]
pub async fn slow(ms: u64) -> u64 {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    ms
}

#[remote_fn]
pub fn sign_up(email: Option<String>) -> Result<String, ValidationError> {
    match email {
        Some(email) if email.contains('@') => Ok(email),
        Some(_) => Err(ValidationError::new().field("email", "is not an address")),
        None => Err(ValidationError::new().field("email", "is required")),
    }
}

/// Domain exception that survives the trip back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsufficientFunds {
    pub balance: u64,
    pub requested: u64,
}

impl fmt::Display for InsufficientFunds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot withdraw {} from a balance of {}",
            self.requested, self.balance
        )
    }
}

impl std::error::Error for InsufficientFunds {}

impl RemoteException for InsufficientFunds {
    const KIND: &'static str = "InsufficientFunds";
}

impl From<InsufficientFunds> for FunctionError {
    fn from(err: InsufficientFunds) -> Self {
        FunctionError::raise(err)
    }
}

#[remote_fn(namespace = "bank")]
pub fn withdraw(balance: u64, amount: u64) -> Result<u64, InsufficientFunds> {
    if amount > balance {
        return Err(InsufficientFunds {
            balance,
            requested: amount,
        });
    }
    Ok(balance - amount)
}

#[remote_fn(namespace = "audit", durable)]
pub fn record(entry: String) {
    let _ = entry;
}
