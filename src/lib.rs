//! Tierguard - Escalating Abuse Detection
//!
//! This crate tracks bursts of security-relevant events per IP address or
//! user, and escalates consequences as a burst grows: longer memory of the
//! burst, then blacklisting or suspicious/banned/locked flags. A read-only
//! gateway answers "is this actor blocked?" before a protected action, and an
//! orchestrator records the outcome afterwards.

pub mod config;
pub mod error;
pub mod escalation;
