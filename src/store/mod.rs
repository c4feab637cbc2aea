//! Participant codes and payout checkout

pub mod checkout;
pub mod codes;

pub use checkout::{Checkout, CheckoutClient};
pub use codes::{CodeStore, CodeStoreError};
