//! Lifecycle test modules

mod deletion;
mod helpers;
mod operator;
mod provisioning;
