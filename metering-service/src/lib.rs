//! metering-service: usage metering and quota enforcement for lead
//! generation accounts.
//!
//! Tracks how many leads each account has consumed against its
//! subscription plan, admits or rejects new work before it starts,
//! settles actual usage after the fact, and reconciles subscription and
//! invoice state from asynchronous payment-processor events.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
